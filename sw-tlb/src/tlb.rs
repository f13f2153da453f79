//! 直接映射的软件 TLB。
//!
//! 槽号由 `(pid ⊕ 虚页号) mod NUMTLB` 得出，冲突直接覆盖。
//! 命中与缺失单调计数，供 `tlbinfo` 观测。

use frame_tracker::PhysAddr;
use page_walk::{PteFlags, VirtAddr};
use spin::Mutex;

/// TLB 槽数。
pub const NUMTLB: usize = 128;

#[derive(Clone, Copy)]
struct TlbEntry {
    valid: bool,
    pid: i32,
    vp: u32,
    pp: u32,
    flags: PteFlags,
}

impl TlbEntry {
    const INVALID: Self = Self {
        valid: false,
        pid: 0,
        vp: 0,
        pp: 0,
        flags: PteFlags::empty(),
    };
}

struct Tlb {
    entries: [TlbEntry; NUMTLB],
    hits: u32,
    misses: u32,
}

static TLB: Mutex<Tlb> = Mutex::new(Tlb {
    entries: [TlbEntry::INVALID; NUMTLB],
    hits: 0,
    misses: 0,
});

#[inline]
fn slot(pid: i32, vp: u32) -> usize {
    ((pid as u32) ^ vp) as usize & (NUMTLB - 1)
}

/// 查询 `(pid, va)`。
///
/// 命中返回物理地址（带页内偏移）和标志位并计一次命中，否则计一次缺失。
pub fn lookup(pid: i32, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
    let vp = va.0 >> 12;
    let mut tlb = TLB.lock();
    let e = tlb.entries[slot(pid, vp)];
    if e.valid && e.pid == pid && e.vp == vp {
        tlb.hits += 1;
        Some((PhysAddr((e.pp << 12) | (va.0 & 0xFFF)), e.flags))
    } else {
        tlb.misses += 1;
        None
    }
}

/// 装入一条翻译，覆盖槽里原有的任何内容。
pub fn alloc(pid: i32, va: VirtAddr, pa: PhysAddr, flags: PteFlags) {
    let vp = va.0 >> 12;
    let mut tlb = TLB.lock();
    tlb.entries[slot(pid, vp)] = TlbEntry {
        valid: true,
        pid,
        vp,
        pp: pa.0 >> 12,
        flags,
    };
}

/// 失效指定的 `(pid, va)`。映射改动时调用。
pub fn invalidate(pid: i32, va: VirtAddr) {
    let vp = va.0 >> 12;
    let mut tlb = TLB.lock();
    let e = &mut tlb.entries[slot(pid, vp)];
    if e.valid && e.pid == pid && e.vp == vp {
        e.valid = false;
    }
}

/// 失效该进程的全部表项。进程退出时调用。
pub fn invalidate_pid(pid: i32) {
    let mut tlb = TLB.lock();
    for e in tlb.entries.iter_mut() {
        if e.valid && e.pid == pid {
            e.valid = false;
        }
    }
}

/// 全表失效。
pub fn flush() {
    let mut tlb = TLB.lock();
    for e in tlb.entries.iter_mut() {
        e.valid = false;
    }
}

/// 累计的命中与缺失计数。
pub fn info() -> (u32, u32) {
    let tlb = TLB.lock();
    (tlb.hits, tlb.misses)
}
