//! 教学内核的核心：软件地址翻译层和文件系统快照服务。
//!
//! 地址翻译这半边把用户页表项故意留在非存在态（`SOFT` 位），每次访问
//! 都陷入缺页，由处理函数查倒排页表、填软件 TLB、临时置上存在位；
//! 写时复制也走同一个缺页入口。文件系统这半边由 `snap-fs` 提供，
//! 这里只做系统调用的翻译层。

#![no_std]
#![deny(warnings)]

extern crate alloc;

#[macro_use]
extern crate console;

pub mod clock;
pub mod fault;
pub mod fs;
pub mod mmu;
pub mod process;
pub mod processor;
pub mod syscalls;

use spin::Once;

/// 内核启动期的一次性初始化：控制台、日志、时钟源、物理内存托管区、
/// 系统调用实现。重复调用只有第一次生效。
pub fn kernel_init(con: &'static dyn console::Console, memory: &'static mut [frame_tracker::Page]) {
    static ONCE: Once<()> = Once::new();
    let mut region = Some(memory);
    ONCE.call_once(|| {
        console::init_console(con);
        console::set_log_level(option_env!("LOG"));
        frame_tracker::init_clock(&clock::Ticks);
        let (early, rest) = region.take().unwrap().split_at_mut(64);
        frame_tracker::init(early);
        frame_tracker::transfer(rest);
        syscall::init_process(&syscalls::SyscallContext);
        syscall::init_io(&syscalls::SyscallContext);
        syscall::init_translation(&syscalls::SyscallContext);
        syscall::init_snapshot(&syscalls::SyscallContext);
        log::info!("kernel initialized");
    });
}

#[cfg(test)]
mod tests;
