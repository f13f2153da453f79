//! 时钟滴答。
//!
//! 真机上由时钟中断驱动；这里由 `sleep` 与测试推进。

use core::sync::atomic::{AtomicU32, Ordering::Relaxed};

static TICKS: AtomicU32 = AtomicU32::new(0);

/// 当前滴答数。
#[inline]
pub fn ticks() -> u32 {
    TICKS.load(Relaxed)
}

/// 推进 `n` 个滴答。
#[inline]
pub fn advance(n: u32) {
    TICKS.fetch_add(n, Relaxed);
}

/// 帧跟踪器用的时刻来源。
pub struct Ticks;

impl frame_tracker::Clock for Ticks {
    #[inline]
    fn ticks(&self) -> u32 {
        ticks()
    }
}
