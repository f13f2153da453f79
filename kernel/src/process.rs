//! 进程。
//!
//! 这里只保留地址翻译和文件这两件事需要的进程状态：页目录、
//! 虚地址跟踪器、文件描述符表和一点记账。调度属于别的层。

use crate::mmu;
use alloc::{string::String, vec::Vec};
use core::sync::atomic::{AtomicI32, Ordering::Relaxed};
use frame_tracker::{kalloc, kfree, phys_ptr, PAGE_SIZE};
use page_walk::{MapError, PageDir, Pte, PteFlags, VirtAddr};
use snap_fs::FileHandle;
use spin::Mutex;
use sw_tlb::{ipt, tlb, VaTracker};

/// 用户堆的起始虚地址。
pub const USER_HEAP_BASE: u32 = 0x0100_0000;

/// 调度状态。`get_procinfo` 以数值形式向外报告。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum ProcState {
    /// 可运行。
    Runnable = 2,
    /// 正在运行。
    Running = 3,
    /// 已退出，等待父进程回收。
    Zombie = 4,
}

fn next_pid() -> i32 {
    static PID_COUNTER: AtomicI32 = AtomicI32::new(1);
    PID_COUNTER.fetch_add(1, Relaxed)
}

#[inline]
const fn page_round_up(x: u32) -> u32 {
    (x + PAGE_SIZE as u32 - 1) & !(PAGE_SIZE as u32 - 1)
}

/// 进程。
pub struct Process {
    /// 进程号。
    pub pid: i32,
    /// 父进程号。
    pub ppid: i32,
    /// 调度状态。
    pub state: ProcState,
    /// 退出码。
    pub exit_code: i32,
    /// 被信号杀死的标记。
    pub killed: bool,
    /// 程序断点距堆底的字节数。
    pub sz: u32,
    /// 进程名。
    pub name: String,
    /// 页目录。
    pub pgdir: PageDir,
    /// 缺页处理临时置上存在位的虚地址。
    pub tracked: VaTracker,
    /// 打开的文件。
    pub fd_table: Vec<Option<Mutex<FileHandle>>>,
}

impl Process {
    /// 创建一个空地址空间的进程。
    pub fn new(name: &str, ppid: i32) -> Result<Self, MapError> {
        Ok(Self {
            pid: next_pid(),
            ppid,
            state: ProcState::Runnable,
            exit_code: 0,
            killed: false,
            sz: 0,
            name: String::from(name),
            pgdir: PageDir::new()?,
            tracked: VaTracker::new(),
            fd_table: Vec::new(),
        })
    }

    /// 调整程序断点，返回旧值。
    ///
    /// 增长的页从帧跟踪器取，清零后以软件托管态（非存在）挂进页表并
    /// 登记倒排页表；收缩反向撤销。帧耗尽返回 `None`。
    pub fn grow(&mut self, delta: i32) -> Option<u32> {
        let old = self.sz;
        if delta >= 0 {
            let new = old.checked_add(delta as u32)?;
            let mut off = page_round_up(old);
            while off < new {
                let va = VirtAddr(USER_HEAP_BASE + off);
                let pa = kalloc(Some(self.pid))?;
                unsafe { core::ptr::write_bytes(phys_ptr(pa).as_ptr(), 0, PAGE_SIZE) };
                let flags = PteFlags::SOFT | PteFlags::USER | PteFlags::WRITABLE;
                if self.pgdir.map(va, pa, flags).is_err() || ipt::insert(va, pa, flags, self.pid).is_err()
                {
                    self.pgdir.unmap(va);
                    kfree(pa);
                    return None;
                }
                off += PAGE_SIZE as u32;
            }
            self.sz = new;
            Some(old)
        } else {
            let new = old.saturating_sub((-delta) as u32);
            let mut off = page_round_up(new);
            while off < page_round_up(old) {
                let va = VirtAddr(USER_HEAP_BASE + off);
                if let Some(pte) = self.pgdir.entry(va) {
                    if pte.is_some() {
                        let pa = pte.addr();
                        ipt::remove(va, pa, self.pid);
                        tlb::invalidate(self.pid, va);
                        self.pgdir.unmap(va);
                        kfree(pa);
                    }
                }
                off += PAGE_SIZE as u32;
            }
            self.sz = new;
            mmu::flush_hw_tlb(self.pid);
            Some(old)
        }
    }

    /// 以写时复制派生一个子进程。
    ///
    /// 双方的可写页都改成只读加写时复制挂起，共享同一帧；子进程的
    /// 映射逐条登记进倒排页表。
    pub fn fork(&mut self) -> Result<Self, MapError> {
        let mut child = Self::new(&self.name, self.pid)?;
        child.sz = self.sz;
        for slot in &self.fd_table {
            child
                .fd_table
                .push(slot.as_ref().map(|f| Mutex::new(f.lock().clone())));
        }
        for (va, pte) in self.pgdir.mappings() {
            let pa = pte.addr();
            let mut flags = pte.flags();
            if flags.contains(PteFlags::WRITABLE) {
                flags.remove(PteFlags::WRITABLE);
                flags.insert(PteFlags::COW);
                self.pgdir.set_entry(va, Pte::build(pa, flags))?;
                ipt::insert(va, pa, flags, self.pid).map_err(|_| MapError::NoFrame)?;
            }
            child.pgdir.map(va, pa, flags)?;
            frame_tracker::share(pa);
            ipt::insert(va, pa, flags, child.pid).map_err(|_| MapError::NoFrame)?;
        }
        // 父进程的权限变了，硬件侧的旧翻译必须作废
        mmu::flush_hw_tlb(self.pid);
        Ok(child)
    }

    /// 回收全部地址翻译资源：倒排页表表项、软件 TLB 表项、跟踪器和
    /// 用户帧。进程退出时调用。
    pub fn release_translation(&mut self) {
        for (va, pte) in self.pgdir.mappings() {
            let pa = pte.addr();
            ipt::remove(va, pa, self.pid);
            self.pgdir.unmap(va);
            kfree(pa);
        }
        tlb::invalidate_pid(self.pid);
        let _ = self.tracked.drain();
        mmu::flush_hw_tlb(self.pid);
    }

    /// 放一个打开的文件进描述符表，返回 fd。
    pub fn push_file(&mut self, file: FileHandle) -> usize {
        for (fd, slot) in self.fd_table.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Mutex::new(file));
                return fd;
            }
        }
        self.fd_table.push(Some(Mutex::new(file)));
        self.fd_table.len() - 1
    }

    /// 名字的定长形式，`get_procinfo` 用。
    pub fn name_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        let bytes = self.name.as_bytes();
        let n = bytes.len().min(15);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    /// 堆里第 `i` 页的虚地址。
    pub fn heap_page(i: usize) -> VirtAddr {
        VirtAddr(USER_HEAP_BASE + (i * PAGE_SIZE) as u32)
    }
}
