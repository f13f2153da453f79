extern crate std;

use crate::{
    fault, mmu,
    process::USER_HEAP_BASE,
    processor::PROCESSOR,
};
use alloc::{boxed::Box, string::String, vec::Vec};
use frame_tracker::{FrameInfo, Page, PhysAddr, PAGE_SIZE};
use page_walk::{PteFlags, VirtAddr};
use snap_fs::{FSManager, BSIZE, NDIRECT};
use spin::{Mutex, Once};
use sw_tlb::{ipt, tlb};
use syscall::{Caller, SyscallId as Id, SyscallResult};

/// 全局单例串行化。
static LOCK: Mutex<()> = Mutex::new(());

static CONSOLE_BUF: Mutex<String> = Mutex::new(String::new());

struct TestConsole;

impl console::Console for TestConsole {
    fn put_char(&self, c: u8) {
        CONSOLE_BUF.lock().push(c as char);
    }
}

static TEST_CONSOLE: TestConsole = TestConsole;

fn boot() {
    static ONCE: Once<()> = Once::new();
    ONCE.call_once(|| {
        let region = Box::leak(
            (0..2048)
                .map(|_| Page::ZERO)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );
        crate::kernel_init(&TEST_CONSOLE, region);
    });
}

fn call(id: Id, args: [usize; 6]) -> isize {
    match syscall::handle(Caller { entity: 0, flow: 0 }, id, args) {
        SyscallResult::Done(ret) => ret,
        SyscallResult::Unsupported(id) => panic!("unsupported syscall {id:?}"),
    }
}

fn spawn_current(name: &str) -> i32 {
    let mut manager = PROCESSOR.lock();
    let pid = manager.spawn(name).unwrap();
    assert!(manager.make_current(pid));
    pid
}

fn switch_to(pid: i32) {
    assert!(PROCESSOR.lock().make_current(pid));
}

/// 模拟一次用户访存（会触发缺页处理）。
fn user_write(pid: i32, va: VirtAddr, value: u8) -> Result<(), mmu::Killed> {
    let mut manager = PROCESSOR.lock();
    let p = manager.get_mut(pid).unwrap();
    mmu::write_user_byte(p, va, value)
}

fn user_read(pid: i32, va: VirtAddr) -> Result<u8, mmu::Killed> {
    let mut manager = PROCESSOR.lock();
    let p = manager.get_mut(pid).unwrap();
    mmu::read_user_byte(p, va)
}

/// 内核通道写用户内存（不触发缺页）。
fn upoke(pid: i32, va: VirtAddr, bytes: &[u8]) {
    let mut manager = PROCESSOR.lock();
    let p = manager.get_mut(pid).unwrap();
    mmu::copyout(&p.pgdir, va, bytes).unwrap();
}

fn upeek(pid: i32, va: VirtAddr, buf: &mut [u8]) {
    let mut manager = PROCESSOR.lock();
    let p = manager.get_mut(pid).unwrap();
    mmu::copyin(&p.pgdir, va, buf).unwrap();
}

fn user_translate(pid: i32, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
    let mut manager = PROCESSOR.lock();
    let p = manager.get_mut(pid).unwrap();
    p.pgdir.translate(va)
}

fn heap_va(i: usize) -> VirtAddr {
    VirtAddr(USER_HEAP_BASE + (i * PAGE_SIZE) as u32)
}

fn frames_of(pid: i32) -> usize {
    let mut buf = [FrameInfo {
        frame_index: 0,
        allocated: false,
        pid: -1,
        start_tick: 0,
        refcnt: 0,
    }; 2048];
    let n = frame_tracker::dump(&mut buf);
    buf[..n]
        .iter()
        .filter(|f| f.allocated && f.pid == pid)
        .count()
}

#[test]
fn hello_number_prints_and_doubles() {
    let _g = LOCK.lock();
    boot();
    spawn_current("hello");
    CONSOLE_BUF.lock().clear();
    assert_eq!(call(Id::HELLO_NUMBER, [21, 0, 0, 0, 0, 0]), 42);
    assert!(CONSOLE_BUF
        .lock()
        .contains("Hello, xv6! Your number is 21\n"));
    call(Id::EXIT, [0; 6]);
}

#[test]
fn procinfo_reports_the_caller() {
    let _g = LOCK.lock();
    boot();
    let pid = spawn_current("psinfo");
    assert!(call(Id::SBRK, [PAGE_SIZE, 0, 0, 0, 0, 0]) >= 0);
    let out = heap_va(0);
    assert_eq!(call(Id::GET_PROCINFO, [0, out.0 as usize, 0, 0, 0, 0]), 0);
    let mut raw = [0u8; core::mem::size_of::<syscall::ProcInfo>()];
    upeek(pid, out, &mut raw);
    let info: syscall::ProcInfo = unsafe { core::ptr::read_unaligned(raw.as_ptr().cast()) };
    assert_eq!(info.pid, pid);
    assert_eq!(info.sz, PAGE_SIZE as u32);
    assert_eq!(&info.name[..6], b"psinfo");
    call(Id::EXIT, [0; 6]);
}

#[test]
fn sbrk_frames_carry_owner_and_die_with_process() {
    let _g = LOCK.lock();
    boot();
    let pid = spawn_current("memstress");
    assert_eq!(frames_of(pid), 0);
    assert!(call(Id::SBRK, [31 * PAGE_SIZE, 0, 0, 0, 0, 0]) >= 0);
    assert_eq!(frames_of(pid), 31);
    for i in 0..31 {
        user_write(pid, heap_va(i), i as u8).unwrap();
    }
    // 写入只动已有的帧
    assert_eq!(frames_of(pid), 31);
    call(Id::EXIT, [0; 6]);
    assert_eq!(frames_of(pid), 0);
}

#[test]
fn two_processes_own_disjoint_frames() {
    let _g = LOCK.lock();
    boot();
    let a = spawn_current("memstress");
    assert!(call(Id::SBRK, [4 * PAGE_SIZE, 0, 0, 0, 0, 0]) >= 0);
    let b = spawn_current("memstress");
    assert!(call(Id::SBRK, [5 * PAGE_SIZE, 0, 0, 0, 0, 0]) >= 0);
    assert_eq!(frames_of(a), 4);
    assert_eq!(frames_of(b), 5);
    switch_to(a);
    call(Id::EXIT, [0; 6]);
    assert_eq!(frames_of(a), 0);
    assert_eq!(frames_of(b), 5);
    switch_to(b);
    call(Id::EXIT, [0; 6]);
    assert_eq!(frames_of(b), 0);
}

#[test]
fn refill_counts_miss_then_hit() {
    let _g = LOCK.lock();
    boot();
    let pid = spawn_current("vtop");
    assert!(call(Id::SBRK, [PAGE_SIZE, 0, 0, 0, 0, 0]) >= 0);
    let va = heap_va(0);

    let (h0, m0) = tlb::info();
    user_write(pid, va, b'a').unwrap();
    let (h1, m1) = tlb::info();
    assert_eq!((h1 - h0, m1 - m0), (0, 1), "cold page is a miss");

    // 已置存在位，再访问不再陷入
    user_read(pid, va).unwrap();
    assert_eq!(tlb::info(), (h1, m1));

    // 撤掉存在位重新陷入，这次软件 TLB 命中
    {
        let mut manager = PROCESSOR.lock();
        let p = manager.get_mut(pid).unwrap();
        fault::demote_tracked(p);
    }
    assert_eq!(user_read(pid, va).unwrap(), b'a');
    let (h2, m2) = tlb::info();
    assert_eq!((h2 - h1, m2 - m1), (1, 0), "warm page is a hit");
    call(Id::EXIT, [0; 6]);
}

#[test]
fn vtop_syscall_rewrites_soft_flag() {
    let _g = LOCK.lock();
    boot();
    let pid = spawn_current("vtop");
    assert!(call(Id::SBRK, [2 * PAGE_SIZE, 0, 0, 0, 0, 0]) >= 0);
    let touched = heap_va(0);
    let untouched = heap_va(1);
    user_write(pid, touched, 1).unwrap();

    let out_pa = VirtAddr(touched.0 + 64);
    let out_flags = VirtAddr(touched.0 + 68);
    for &va in [touched, untouched].iter() {
        assert_eq!(
            call(
                Id::VTOP,
                [va.0 as usize, out_pa.0 as usize, out_flags.0 as usize, 0, 0, 0],
            ),
            1
        );
        let mut raw = [0u8; 4];
        upeek(pid, out_pa, &mut raw);
        let pa = u32::from_le_bytes(raw);
        upeek(pid, out_flags, &mut raw);
        let flags = PteFlags::from_bits_truncate(u32::from_le_bytes(raw));
        let (expect, _) = user_translate(pid, va).unwrap();
        assert_eq!(pa, expect.0);
        // 软件托管位改写成存在位再给用户
        assert!(flags.contains(PteFlags::PRESENT));
        assert!(!flags.contains(PteFlags::SOFT));
    }
    // 没有映射的地址
    assert_eq!(
        call(
            Id::VTOP,
            [0xdead_d000, out_pa.0 as usize, out_flags.0 as usize, 0, 0, 0],
        ),
        0
    );
    call(Id::EXIT, [0; 6]);
}

#[test]
fn tlbinfo_validates_both_pointers() {
    let _g = LOCK.lock();
    boot();
    let pid = spawn_current("tlbinfo");
    assert!(call(Id::SBRK, [PAGE_SIZE, 0, 0, 0, 0, 0]) >= 0);
    let good = heap_va(0);
    let bad = VirtAddr(0xdead_d000);
    assert_eq!(
        call(Id::TLBINFO, [good.0 as usize, bad.0 as usize, 0, 0, 0, 0]),
        -1
    );
    assert_eq!(
        call(Id::TLBINFO, [bad.0 as usize, good.0 as usize, 0, 0, 0, 0]),
        -1
    );
    assert_eq!(
        call(
            Id::TLBINFO,
            [good.0 as usize, good.0 as usize + 4, 0, 0, 0, 0]
        ),
        0
    );
    let mut raw = [0u8; 4];
    upeek(pid, good, &mut raw);
    let hits = u32::from_le_bytes(raw);
    assert_eq!(hits, tlb::info().0);
    call(Id::EXIT, [0; 6]);
}

#[test]
fn fork_shares_frames_copy_on_write() {
    let _g = LOCK.lock();
    boot();
    let parent = spawn_current("forktest");
    assert!(call(Id::SBRK, [PAGE_SIZE, 0, 0, 0, 0, 0]) >= 0);
    let shared = heap_va(0);
    user_write(parent, shared, b'A').unwrap();
    let (ppa, _) = user_translate(parent, shared).unwrap();

    let mut children = Vec::new();
    for _ in 0..3 {
        let pid = call(Id::FORK, [0; 6]);
        assert!(pid > 0);
        children.push(pid as i32);
    }
    // 一个物理帧，四条反查记录
    assert_eq!(ipt::chain_len(ppa.floor()), 4);
    assert_eq!(frame_tracker::refcnt(ppa.floor()), 4);
    for &c in &children {
        let (cpa, _) = user_translate(c, shared).unwrap();
        assert_eq!(cpa, ppa, "child shares the parent's frame");
        assert_eq!(user_read(c, shared).unwrap(), b'A');
    }

    // 其中一个孩子写入：旧链少一条，新帧链上一条
    let writer = children[0];
    user_write(writer, shared, b'C').unwrap();
    let (wpa, _) = user_translate(writer, shared).unwrap();
    assert_ne!(wpa.floor(), ppa.floor());
    assert_eq!(ipt::chain_len(ppa.floor()), 3);
    assert_eq!(ipt::chain_len(wpa.floor()), 1);
    assert_eq!(user_read(writer, shared).unwrap(), b'C');
    // 其余进程看到的还是旧值
    assert_eq!(user_read(parent, shared).unwrap(), b'A');
    assert_eq!(user_read(children[1], shared).unwrap(), b'A');

    // phys2virt 系统调用报告旧帧的链
    switch_to(parent);
    let out = heap_va(0);
    let n = call(
        Id::PHYS2VIRT,
        [ppa.floor().0 as usize, out.0 as usize, 10, 0, 0, 0],
    );
    assert_eq!(n, 3);

    for &c in &children {
        switch_to(c);
        call(Id::EXIT, [0; 6]);
    }
    switch_to(parent);
    while call(Id::WAIT, [usize::MAX, 0, 0, 0, 0, 0]) > 0 {}
    call(Id::EXIT, [0; 6]);
    assert_eq!(ipt::chain_len(ppa.floor()), 0);
}

#[test]
fn fault_on_unmapped_address_kills() {
    let _g = LOCK.lock();
    boot();
    let pid = spawn_current("wild");
    assert_eq!(user_write(pid, VirtAddr(0x7fff_0000), 1), Err(mmu::Killed));
    let mut manager = PROCESSOR.lock();
    assert!(manager.get_mut(pid).unwrap().killed);
    drop(manager);
    call(Id::EXIT, [0; 6]);
}

#[test]
fn snapshot_syscalls_end_to_end() {
    let _g = LOCK.lock();
    boot();
    let pid = spawn_current("snap");
    assert!(call(Id::SBRK, [2 * PAGE_SIZE, 0, 0, 0, 0, 0]) >= 0);
    let path_va = heap_va(0);
    let out_va = heap_va(1);
    upoke(pid, path_va, b"hi\0");

    // 12 个整块加一行，正好挂上间接块
    let file = {
        use snap_fs::OpenFlags;
        let handle = crate::fs::FS
            .open("hi", OpenFlags::CREATE | OpenFlags::RDWR)
            .unwrap();
        handle.inode.clone()
    };
    let mut block = [0u8; BSIZE];
    block[BSIZE - 1] = b'\n';
    for i in 0..NDIRECT {
        block[0] = b'0' + (i % 10) as u8;
        assert_eq!(file.write_at((i * BSIZE) as u32, &block), Some(BSIZE));
    }
    assert_eq!(file.write_at((NDIRECT * BSIZE) as u32, b"hello\n"), Some(6));

    let read_addrs = |pid: i32| -> [u32; NDIRECT + 1] {
        assert_eq!(
            call(
                Id::GET_ADDRS,
                [path_va.0 as usize, out_va.0 as usize, 0, 0, 0, 0],
            ),
            0
        );
        let mut raw = [0u8; (NDIRECT + 1) * 4];
        upeek(pid, out_va, &mut raw);
        let mut addrs = [0u32; NDIRECT + 1];
        for (i, slot) in addrs.iter_mut().enumerate() {
            *slot = u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        }
        addrs
    };

    let before = read_addrs(pid);
    assert!(before[..=NDIRECT].iter().all(|&a| a != 0));

    let id = call(Id::SNAPSHOT_CREATE, [0; 6]);
    assert_eq!(id, 1);

    // 追加落在间接块里，整棵间接子树搬家，直接块保持共享
    let size = { file.lock().size() };
    assert_eq!(file.write_at(size, b"XYZ"), Some(3));
    let after = read_addrs(pid);
    assert_eq!(after[..NDIRECT], before[..NDIRECT]);
    assert_ne!(after[NDIRECT], before[NDIRECT]);

    assert_eq!(
        call(
            Id::GET_INDIRECT_ADDRS,
            [path_va.0 as usize, out_va.0 as usize, 0, 0, 0, 0],
        ),
        0
    );
    let mut raw = [0u8; 4];
    upeek(pid, out_va, &mut raw);
    assert_ne!(u32::from_le_bytes(raw), 0);

    // 删掉文件再回滚，内容回到建快照的时刻
    drop(file);
    assert_eq!(call(Id::UNLINK, [path_va.0 as usize, 0, 0, 0, 0, 0]), 0);
    assert!(crate::fs::FS.find("hi").is_none());
    assert_eq!(call(Id::SNAPSHOT_ROLLBACK, [1, 0, 0, 0, 0, 0]), 0);
    let restored = crate::fs::FS.find("hi").unwrap();
    let mut first = [0u8; 1];
    restored.read_at(0, &mut first).unwrap();
    assert_eq!(first[0], b'0');
    let mut tail = [0u8; 6];
    restored
        .read_at((NDIRECT * BSIZE) as u32, &mut tail)
        .unwrap();
    assert_eq!(&tail, b"hello\n");
    drop(restored);

    assert_eq!(call(Id::SNAPSHOT_DELETE, [1, 0, 0, 0, 0, 0]), 0);
    assert_eq!(call(Id::SNAPSHOT_DELETE, [1, 0, 0, 0, 0, 0]), -1);
    assert_eq!(call(Id::SNAPSHOT_ROLLBACK, [7, 0, 0, 0, 0, 0]), -1);
    call(Id::EXIT, [0; 6]);
}
