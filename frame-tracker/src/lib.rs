//! 物理页帧跟踪：分配、回收和每帧元数据。
//!
//! 每个物理帧带一条元数据记录（是否分配、属主进程、分配时刻、共享计数）。
//! 共享计数大于 1 时 [`kfree`] 只做递减，归零才真正回到空闲链。

#![no_std]
#![deny(warnings)]

use core::ptr::NonNull;
use spin::{Mutex, Once};

/// 页大小。
pub const PAGE_SIZE: usize = 4096;
/// 可跟踪的物理帧总数。
pub const PFNNUM: usize = 60000;

/// 一个对齐到页边界的页。托管区以它为单位交给 [`init`]。
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    /// 全零页。
    pub const ZERO: Self = Self([0; PAGE_SIZE]);
}

/// 物理地址。
///
/// 托管区内的偏移，即帧号 × 页大小加页内偏移。通过 [`phys_ptr`] 换算回指针。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    /// 所在帧号。
    #[inline]
    pub const fn pfn(self) -> usize {
        self.0 as usize / PAGE_SIZE
    }

    /// 页内偏移。
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 as usize % PAGE_SIZE
    }

    /// 对齐到页边界。
    #[inline]
    pub const fn floor(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    /// 由帧号构造。
    #[inline]
    pub const fn from_pfn(pfn: usize) -> Self {
        Self((pfn * PAGE_SIZE) as u32)
    }
}

/// 一帧的元数据记录。
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo {
    /// 帧号。
    pub frame_index: u32,
    /// 是否已分配。
    pub allocated: bool,
    /// 属主进程号，空闲或内核持有时为 -1。
    pub pid: i32,
    /// 当前属主取得该帧的时刻。
    pub start_tick: u32,
    /// 共享计数。
    pub refcnt: u32,
}

impl FrameInfo {
    const FREE: Self = Self {
        frame_index: 0,
        allocated: false,
        pid: -1,
        start_tick: 0,
        refcnt: 0,
    };
}

/// 时刻来源。分配时记录 `start_tick` 用。
pub trait Clock: Sync {
    /// 当前时钟滴答数。
    fn ticks(&self) -> u32;
}

static CLOCK: Once<&'static dyn Clock> = Once::new();

/// 设置时刻来源。未设置时 `start_tick` 记 0。
pub fn init_clock(clock: &'static dyn Clock) {
    CLOCK.call_once(|| clock);
}

#[inline]
fn now() -> u32 {
    CLOCK.get().map_or(0, |c| c.ticks())
}

struct FrameTracker {
    /// 托管区基址，物理地址 0 对应这里。
    base: usize,
    /// 已托管的帧数。
    frames: usize,
    /// 空闲链头的帧号。
    free_head: Option<u32>,
    info: [FrameInfo; PFNNUM],
}

// 空闲链下一项记在空闲页自身的头四个字节里，只经 TRACKER 锁访问。
unsafe impl Send for FrameTracker {}

static TRACKER: Mutex<FrameTracker> = Mutex::new(FrameTracker {
    base: 0,
    frames: 0,
    free_head: None,
    info: [FrameInfo::FREE; PFNNUM],
});

impl FrameTracker {
    #[inline]
    fn page_ptr(&self, pfn: usize) -> *mut u8 {
        (self.base + pfn * PAGE_SIZE) as *mut u8
    }

    /// 把一段页挂到空闲链上。
    fn free_range(&mut self, first_pfn: usize, count: usize) {
        for pfn in first_pfn..first_pfn + count {
            assert!(pfn < PFNNUM, "frame-tracker: out of range");
            self.info[pfn] = FrameInfo::FREE;
            self.push_free(pfn);
        }
        self.frames = self.frames.max(first_pfn + count);
    }

    fn push_free(&mut self, pfn: usize) {
        let next = self.free_head.map_or(0u32, |n| n + 1);
        unsafe { (self.page_ptr(pfn) as *mut u32).write(next) };
        self.free_head = Some(pfn as u32);
    }

    fn pop_free(&mut self) -> Option<usize> {
        let pfn = self.free_head? as usize;
        let next = unsafe { (self.page_ptr(pfn) as *const u32).read() };
        self.free_head = if next == 0 { None } else { Some(next - 1) };
        Some(pfn)
    }
}

/// 初始化：登记托管区基址并把这些页挂到空闲链。
///
/// 对应启动早期只托管一小段内存的第一阶段，其余内存之后由 [`transfer`] 补入。
pub fn init(region: &'static mut [Page]) {
    let mut t = TRACKER.lock();
    assert_eq!(t.frames, 0, "frame-tracker: already initialized");
    t.base = region.as_ptr() as usize;
    let count = region.len();
    t.free_range(0, count);
    log::info!("frame-tracker: managing {count} frames");
}

/// 第二阶段：把紧随其后的一段页补入托管区。
pub fn transfer(region: &'static mut [Page]) {
    let mut t = TRACKER.lock();
    assert_ne!(t.frames, 0, "frame-tracker: init first");
    let first = (region.as_ptr() as usize - t.base) / PAGE_SIZE;
    assert_eq!(first, t.frames, "frame-tracker: region not contiguous");
    t.free_range(first, region.len());
}

/// 分配一帧。
///
/// 记录分配时刻；`owner` 给出时记为属主，否则视作内核持有（pid = -1）。
/// 内存耗尽返回 `None`。页内容不清零，调用者按需清理。
pub fn kalloc(owner: Option<i32>) -> Option<PhysAddr> {
    let tick = now();
    let mut t = TRACKER.lock();
    let pfn = t.pop_free()?;
    t.info[pfn] = FrameInfo {
        frame_index: pfn as u32,
        allocated: true,
        pid: owner.unwrap_or(-1),
        start_tick: tick,
        refcnt: 1,
    };
    Some(PhysAddr::from_pfn(pfn))
}

/// 释放一帧：递减共享计数，归零时才回到空闲链并重置元数据。
///
/// # Panics
///
/// 地址不是本跟踪器托管的帧时 panic。
pub fn kfree(pa: PhysAddr) {
    let mut t = TRACKER.lock();
    let pfn = pa.pfn();
    if pa.offset() != 0 || pfn >= t.frames {
        panic!("kfree");
    }
    if !t.info[pfn].allocated {
        panic!("kfree: freeing free frame");
    }
    if t.info[pfn].refcnt > 0 {
        t.info[pfn].refcnt -= 1;
    }
    if t.info[pfn].refcnt == 0 {
        // 填入垃圾字节以暴露悬垂引用
        unsafe { core::ptr::write_bytes(t.page_ptr(pfn), 1, PAGE_SIZE) };
        t.info[pfn] = FrameInfo::FREE;
        t.push_free(pfn);
    }
}

/// 增加一帧的共享计数（fork 共享页时用）。
///
/// # Panics
///
/// 帧未分配时 panic。
pub fn share(pa: PhysAddr) {
    let mut t = TRACKER.lock();
    let pfn = pa.pfn();
    assert!(pfn < t.frames && t.info[pfn].allocated, "share: bad frame");
    t.info[pfn].refcnt += 1;
}

/// 当前共享计数。未托管的帧返回 0。
pub fn refcnt(pa: PhysAddr) -> u32 {
    let t = TRACKER.lock();
    let pfn = pa.pfn();
    if pfn < t.frames {
        t.info[pfn].refcnt
    } else {
        0
    }
}

/// 按帧号升序拷贝元数据记录，至多 `out.len()` 条，返回条数。
///
/// 整个快照在锁内完成，对 [`kalloc`]/[`kfree`] 原子。
pub fn dump(out: &mut [FrameInfo]) -> usize {
    let t = TRACKER.lock();
    let n = out.len().min(t.frames);
    for (pfn, slot) in out[..n].iter_mut().enumerate() {
        *slot = t.info[pfn];
        slot.frame_index = pfn as u32;
    }
    n
}

/// 物理地址换算成当前地址空间中的指针。
///
/// # Panics
///
/// 地址超出托管区时 panic。
pub fn phys_ptr(pa: PhysAddr) -> NonNull<u8> {
    let t = TRACKER.lock();
    assert!(pa.pfn() < t.frames, "phys_ptr: out of range");
    NonNull::new((t.base + pa.0 as usize) as *mut u8).unwrap()
}

/// 当前空闲帧数。
pub fn free_frames() -> usize {
    let t = TRACKER.lock();
    let mut n = 0;
    let mut head = t.free_head;
    while let Some(pfn) = head {
        n += 1;
        let next = unsafe { (t.page_ptr(pfn as usize) as *const u32).read() };
        head = if next == 0 { None } else { Some(next - 1) };
    }
    n
}
