//! 记录被缺页处理临时置上存在位的虚地址。
//!
//! 置上存在位的页不再触发缺页，命中缺失就观测不到了；
//! 所以要把这些地址记下来，在合适的时机撤掉存在位迫使重新陷入。

use alloc::vec::Vec;
use page_walk::VirtAddr;

/// 每个进程最多跟踪的虚地址数。
pub const MAX_TRACKERS: usize = 32;

#[derive(Clone, Copy)]
struct TrackedVa {
    va: VirtAddr,
    valid: bool,
}

/// 每进程的虚地址跟踪器。
pub struct VaTracker {
    slots: [TrackedVa; MAX_TRACKERS],
    idx: usize,
}

impl VaTracker {
    /// 空跟踪器。
    pub const fn new() -> Self {
        Self {
            slots: [TrackedVa {
                va: VirtAddr(0),
                valid: false,
            }; MAX_TRACKERS],
            idx: 0,
        }
    }

    /// 该页是否已在跟踪中。重复的虚地址不再记录。
    pub fn contains(&self, va: VirtAddr) -> bool {
        let va = va.floor();
        self.slots[..self.idx]
            .iter()
            .any(|t| t.valid && t.va == va)
    }

    /// 写满了吗。满了就该整体撤销后重置。
    #[inline]
    pub fn is_full(&self) -> bool {
        self.idx >= MAX_TRACKERS
    }

    /// 记录一页。调用者先保证未满且不重复。
    pub fn push(&mut self, va: VirtAddr) {
        debug_assert!(!self.is_full());
        self.slots[self.idx] = TrackedVa {
            va: va.floor(),
            valid: true,
        };
        self.idx += 1;
    }

    /// 取走全部有效记录并重置。
    pub fn drain(&mut self) -> Vec<VirtAddr> {
        let out = self.slots[..self.idx]
            .iter()
            .filter(|t| t.valid)
            .map(|t| t.va)
            .collect();
        self.idx = 0;
        for t in self.slots.iter_mut() {
            t.valid = false;
        }
        out
    }

    /// 当前记录条数。
    pub fn len(&self) -> usize {
        self.slots[..self.idx].iter().filter(|t| t.valid).count()
    }

    /// 有没有记录。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
