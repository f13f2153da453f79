//! 软件地址翻译的反向结构。
//!
//! 三件东西配合模拟硬件 TLB：倒排页表（物理帧到全部虚映射的反查），
//! 直接映射的软件 TLB（带命中/缺失计数），以及记录被临时置存在位的
//! 虚地址的跟踪器。

#![no_std]
#![deny(warnings)]

extern crate alloc;

pub mod ipt;
pub mod tlb;

mod tracker;

pub use tracker::{VaTracker, MAX_TRACKERS};

#[cfg(test)]
mod tests;
