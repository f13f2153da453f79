extern crate std;

use super::*;
use frame_tracker::{free_frames, Page};
use spin::{Mutex, Once};
use std::{boxed::Box, vec::Vec};

static LOCK: Mutex<()> = Mutex::new(());

fn setup() {
    static INIT: Once<()> = Once::new();
    INIT.call_once(|| {
        let region = Box::leak(
            (0..256)
                .map(|_| Page::ZERO)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );
        frame_tracker::init(region);
    });
}

#[test]
fn translate_walks_both_levels() {
    let _g = LOCK.lock();
    setup();
    let mut dir = PageDir::new().unwrap();
    let frame = kalloc(Some(1)).unwrap();
    let va = VirtAddr(0x0040_3000);
    dir.map(va, frame, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
        .unwrap();

    let (pa, flags) = dir.translate(VirtAddr(va.0 + 0x123)).unwrap();
    assert_eq!(pa.floor(), frame);
    assert_eq!(pa.offset(), 0x123);
    assert!(flags.contains(PteFlags::PRESENT | PteFlags::WRITABLE));
    kfree(frame);
}

#[test]
fn absent_levels_are_not_mapped() {
    let _g = LOCK.lock();
    setup();
    let dir = PageDir::new().unwrap();
    // 页目录项缺失
    assert!(dir.translate(VirtAddr(0x1234_5678)).is_none());
    assert!(dir.entry(VirtAddr(0x1234_5678)).is_none());
}

#[test]
fn empty_pte_is_not_mapped() {
    let _g = LOCK.lock();
    setup();
    let mut dir = PageDir::new().unwrap();
    let frame = kalloc(None).unwrap();
    dir.map(VirtAddr(0x1000), frame, PteFlags::PRESENT | PteFlags::USER)
        .unwrap();
    // 同一页表覆盖的另一页没有表项
    assert!(dir.translate(VirtAddr(0x2000)).is_none());
    kfree(frame);
}

#[test]
fn soft_mapping_translates_without_present() {
    let _g = LOCK.lock();
    setup();
    let mut dir = PageDir::new().unwrap();
    let frame = kalloc(None).unwrap();
    dir.map(VirtAddr(0x5000), frame, PteFlags::SOFT | PteFlags::USER)
        .unwrap();
    let (pa, flags) = dir.translate(VirtAddr(0x5000)).unwrap();
    assert_eq!(pa, frame);
    assert!(flags.contains(PteFlags::SOFT));
    assert!(!flags.contains(PteFlags::PRESENT));
    kfree(frame);
}

#[test]
fn rewrite_and_unmap_take_effect() {
    let _g = LOCK.lock();
    setup();
    let mut dir = PageDir::new().unwrap();
    let a = kalloc(None).unwrap();
    let b = kalloc(None).unwrap();
    let va = VirtAddr(0x9000);
    dir.map(va, a, PteFlags::PRESENT | PteFlags::USER).unwrap();
    dir.set_entry(va, Pte::build(b, PteFlags::SOFT | PteFlags::USER))
        .unwrap();
    assert_eq!(dir.translate(va).unwrap().0, b);
    dir.unmap(va);
    assert!(dir.translate(va).is_none());
    kfree(a);
    kfree(b);
}

#[test]
fn mappings_enumerates_in_order() {
    let _g = LOCK.lock();
    setup();
    let mut dir = PageDir::new().unwrap();
    let frames: Vec<_> = (0..3).map(|_| kalloc(None).unwrap()).collect();
    let vas = [VirtAddr(0x0080_0000), VirtAddr(0x3000), VirtAddr(0x1000)];
    for (&va, &pa) in vas.iter().zip(&frames) {
        dir.map(va, pa, PteFlags::SOFT | PteFlags::USER).unwrap();
    }
    let listed: Vec<_> = dir.mappings().into_iter().map(|(va, _)| va).collect();
    assert_eq!(listed, [VirtAddr(0x1000), VirtAddr(0x3000), VirtAddr(0x0080_0000)]);
    for pa in frames {
        kfree(pa);
    }
}

#[test]
fn drop_returns_table_frames() {
    let _g = LOCK.lock();
    setup();
    let before = free_frames();
    {
        let mut dir = PageDir::new().unwrap();
        let frame = kalloc(None).unwrap();
        dir.map(VirtAddr(0x1000), frame, PteFlags::PRESENT).unwrap();
        dir.map(VirtAddr(0x0080_0000), frame, PteFlags::PRESENT)
            .unwrap();
        frame_tracker::share(frame);
        kfree(frame);
        kfree(frame);
    }
    assert_eq!(free_frames(), before);
}
