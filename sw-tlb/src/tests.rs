extern crate std;

use crate::{ipt, tlb, VaTracker, MAX_TRACKERS};
use frame_tracker::{kalloc, Page, PhysAddr};
use page_walk::{PteFlags, VirtAddr};
use spin::{Mutex, Once};
use std::{boxed::Box, vec::Vec};

static LOCK: Mutex<()> = Mutex::new(());

fn setup() {
    static INIT: Once<()> = Once::new();
    INIT.call_once(|| {
        let region = Box::leak(
            (0..512)
                .map(|_| Page::ZERO)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );
        frame_tracker::init(region);
    });
}

const UF: PteFlags = PteFlags::USER;

#[test]
fn tlb_hit_right_after_alloc() {
    let _g = LOCK.lock();
    setup();
    let (pid, va, pa) = (11, VirtAddr(0x4000), PhysAddr(0x7000));
    tlb::alloc(pid, va, pa, UF);
    let (h0, m0) = tlb::info();
    let (got, flags) = tlb::lookup(pid, VirtAddr(va.0 + 0x45)).unwrap();
    assert_eq!(got.0, pa.0 | 0x45);
    assert_eq!(flags, UF);
    let (h1, m1) = tlb::info();
    assert_eq!((h1 - h0, m1 - m0), (1, 0));
    tlb::invalidate(pid, va);
}

#[test]
fn tlb_miss_counts_once() {
    let _g = LOCK.lock();
    setup();
    let (h0, m0) = tlb::info();
    assert!(tlb::lookup(99, VirtAddr(0xabc000)).is_none());
    let (h1, m1) = tlb::info();
    assert_eq!((h1 - h0, m1 - m0), (0, 1));
}

#[test]
fn foreign_invalidate_keeps_entry() {
    let _g = LOCK.lock();
    setup();
    let (pid, va, pa) = (21, VirtAddr(0x8000), PhysAddr(0x9000));
    tlb::alloc(pid, va, pa, UF);
    // 其他 (pid, va) 的失效不碰这条
    tlb::invalidate(pid, VirtAddr(0x1000));
    tlb::invalidate(pid + 1, va);
    tlb::invalidate_pid(pid + 1);
    assert!(tlb::lookup(pid, va).is_some());
    tlb::invalidate(pid, va);
    assert!(tlb::lookup(pid, va).is_none());
}

#[test]
fn collision_overwrites_slot() {
    let _g = LOCK.lock();
    setup();
    // 两个键落在同一槽：pid ⊕ 虚页号 相同
    let a = (0x10, VirtAddr(0x3000));
    let b = (0x11, VirtAddr(0x2000));
    assert_eq!((a.0 ^ (a.1 .0 >> 12) as i32), (b.0 ^ (b.1 .0 >> 12) as i32));
    tlb::alloc(a.0, a.1, PhysAddr(0x5000), UF);
    tlb::alloc(b.0, b.1, PhysAddr(0x6000), UF);
    assert!(tlb::lookup(a.0, a.1).is_none());
    assert!(tlb::lookup(b.0, b.1).is_some());
    tlb::invalidate(b.0, b.1);
}

#[test]
fn pid_flush_only_hits_that_pid() {
    let _g = LOCK.lock();
    setup();
    tlb::alloc(31, VirtAddr(0x1000), PhysAddr(0x1000), UF);
    tlb::alloc(32, VirtAddr(0x1000), PhysAddr(0x2000), UF);
    tlb::invalidate_pid(31);
    assert!(tlb::lookup(31, VirtAddr(0x1000)).is_none());
    assert!(tlb::lookup(32, VirtAddr(0x1000)).is_some());
    tlb::flush();
    assert!(tlb::lookup(32, VirtAddr(0x1000)).is_none());
}

#[test]
fn ipt_chains_share_a_frame() {
    let _g = LOCK.lock();
    setup();
    let pa = kalloc(None).unwrap();
    ipt::insert(VirtAddr(0x1000), pa, UF, 41).unwrap();
    ipt::insert(VirtAddr(0x1000), pa, UF, 42).unwrap();
    ipt::insert(VirtAddr(0x6000), pa, UF, 41).unwrap();
    assert_eq!(ipt::chain_len(pa), 3);

    let recs = ipt::chain(pa, 16);
    assert_eq!(recs.len(), 3);
    // 按插入次序接在链尾
    assert_eq!((recs[0].pid, recs[0].va), (41, VirtAddr(0x1000)));
    assert_eq!((recs[2].pid, recs[2].va), (41, VirtAddr(0x6000)));
    // 存下的标志位总是带存在位
    assert!(recs.iter().all(|r| r.flags.contains(PteFlags::PRESENT)));

    assert!(ipt::remove(VirtAddr(0x1000), pa, 42));
    assert_eq!(ipt::chain_len(pa), 2);
    assert!(ipt::remove(VirtAddr(0x1000), pa, 41));
    assert!(ipt::remove(VirtAddr(0x6000), pa, 41));
    assert_eq!(ipt::chain_len(pa), 0);
    frame_tracker::kfree(pa);
}

#[test]
fn ipt_update_does_not_duplicate() {
    let _g = LOCK.lock();
    setup();
    let pa = kalloc(None).unwrap();
    ipt::insert(VirtAddr(0x2000), pa, UF, 51).unwrap();
    ipt::insert(VirtAddr(0x2000), pa, UF | PteFlags::WRITABLE, 51).unwrap();
    assert_eq!(ipt::chain_len(pa), 1);
    let rec = ipt::chain(pa, 1)[0];
    assert!(rec.flags.contains(PteFlags::WRITABLE));
    assert!(ipt::remove(VirtAddr(0x2000), pa, 51));
    frame_tracker::kfree(pa);
}

#[test]
fn ipt_removing_head_keeps_rest_of_chain() {
    let _g = LOCK.lock();
    setup();
    let pa = kalloc(None).unwrap();
    for pid in 61..64 {
        ipt::insert(VirtAddr(0x3000), pa, UF, pid).unwrap();
    }
    assert!(ipt::remove(VirtAddr(0x3000), pa, 61));
    let recs = ipt::chain(pa, 16);
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[0].pid, 62);
    for pid in 62..64 {
        assert!(ipt::remove(VirtAddr(0x3000), pa, pid));
    }
    frame_tracker::kfree(pa);
}

#[test]
fn ipt_insert_invalidates_tlb_slot() {
    let _g = LOCK.lock();
    setup();
    let pa = kalloc(None).unwrap();
    let (pid, va) = (71, VirtAddr(0xd000));
    tlb::alloc(pid, va, PhysAddr(0x4000), UF);
    ipt::insert(va, pa, UF, pid).unwrap();
    assert!(tlb::lookup(pid, va).is_none());
    assert!(ipt::remove(va, pa, pid));
    frame_tracker::kfree(pa);
}

#[test]
fn slab_grows_without_losing_entries() {
    let _g = LOCK.lock();
    setup();
    let pa = kalloc(None).unwrap();
    // 远超一帧能切出的表项数，强迫池子扩充
    let count = 300;
    for i in 0..count {
        ipt::insert(VirtAddr((i as u32 + 1) << 12), pa, UF, 81).unwrap();
    }
    assert_eq!(ipt::chain_len(pa), count);
    for i in 0..count {
        assert!(ipt::remove(VirtAddr((i as u32 + 1) << 12), pa, 81));
    }
    assert_eq!(ipt::chain_len(pa), 0);
    frame_tracker::kfree(pa);
}

#[test]
fn tracker_dedups_and_fills() {
    let mut t = VaTracker::new();
    assert!(t.is_empty());
    t.push(VirtAddr(0x1234));
    assert!(t.contains(VirtAddr(0x1000)));
    assert_eq!(t.len(), 1);
    for i in 1..MAX_TRACKERS {
        t.push(VirtAddr((i as u32) << 14));
    }
    assert!(t.is_full());
    let drained = t.drain();
    assert_eq!(drained.len(), MAX_TRACKERS);
    assert_eq!(drained[0], VirtAddr(0x1000));
    assert!(t.is_empty() && !t.is_full());
}
