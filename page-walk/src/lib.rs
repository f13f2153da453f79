//! 两级页表的纯软件描述与遍历。
//!
//! 页目录和页表都是从帧跟踪器分配的整帧，表项布局为 `帧地址 | 标志位`。
//! 这里的遍历完全不经过硬件，硬件遍历器只是它的镜像。

#![no_std]
#![deny(warnings)]

extern crate alloc;

use alloc::vec::Vec;
use bitflags::bitflags;
use frame_tracker::{kalloc, kfree, phys_ptr, PhysAddr, PAGE_SIZE};

/// 每个页目录的表项数。
pub const NPDENTRIES: usize = 1024;
/// 每个页表的表项数。
pub const NPTENTRIES: usize = 1024;
/// 内核空间起始虚地址。用户映射都在它之下。
pub const KERNBASE: u32 = 0x8000_0000;

bitflags! {
    /// 页表项标志位。
    ///
    /// 低三位与硬件一致；`SOFT` 与 `COW` 放在硬件忽略的可用位上。
    pub struct PteFlags: u32 {
        /// 存在位。
        const PRESENT  = 1 << 0;
        /// 可写。
        const WRITABLE = 1 << 1;
        /// 用户可访问。
        const USER     = 1 << 2;
        /// 暂由软件 TLB 托管：可翻译但故意不置存在位，使下次访问触发缺页。
        const SOFT     = 1 << 9;
        /// 写时复制挂起：映射只读且底层帧被共享。
        const COW      = 1 << 10;
    }
}

/// 虚地址。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    /// 页目录索引。
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 as usize >> 22) & (NPDENTRIES - 1)
    }

    /// 页表索引。
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 as usize >> 12) & (NPTENTRIES - 1)
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

    /// 是否落在用户空间。
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < KERNBASE
    }
}

/// 一条页表项。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Pte(pub u32);

impl Pte {
    /// 空表项。
    pub const EMPTY: Self = Self(0);

    /// 由帧地址和标志位组装。
    #[inline]
    pub fn build(pa: PhysAddr, flags: PteFlags) -> Self {
        Self(pa.floor().0 | flags.bits())
    }

    /// 表项指向的帧地址。
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    /// 表项的标志位。
    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & (PAGE_SIZE as u32 - 1))
    }

    /// 是否记录了任何映射。
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

/// 页表操作错误。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapError {
    /// 帧耗尽，无法为页表分配。
    NoFrame,
}

/// 一个进程的页目录。
///
/// 持有根帧和按需分配的页表帧；释放时这些帧一并归还，
/// 数据帧归属调用者，须在销毁前自行回收。
pub struct PageDir {
    root: PhysAddr,
}

// 页目录只经属主进程的锁修改。
unsafe impl Send for PageDir {}

fn alloc_zeroed_table() -> Result<PhysAddr, MapError> {
    let pa = kalloc(None).ok_or(MapError::NoFrame)?;
    unsafe { core::ptr::write_bytes(phys_ptr(pa).as_ptr(), 0, PAGE_SIZE) };
    Ok(pa)
}

#[inline]
unsafe fn table_slot(table: PhysAddr, index: usize) -> *mut u32 {
    (phys_ptr(table).as_ptr() as *mut u32).add(index)
}

impl PageDir {
    /// 创建空页目录。
    pub fn new() -> Result<Self, MapError> {
        Ok(Self {
            root: alloc_zeroed_table()?,
        })
    }

    /// 根帧地址。
    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// 找到 `va` 对应的页表项所在的页表帧，`alloc` 时缺页表则补。
    fn pt_of(&self, va: VirtAddr, alloc: bool) -> Result<Option<PhysAddr>, MapError> {
        let pde = unsafe { table_slot(self.root, va.pdx()).read() };
        if Pte(pde).flags().contains(PteFlags::PRESENT) {
            return Ok(Some(Pte(pde).addr()));
        }
        if !alloc {
            return Ok(None);
        }
        let table = alloc_zeroed_table()?;
        let pde = Pte::build(
            table,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
        );
        unsafe { table_slot(self.root, va.pdx()).write(pde.0) };
        Ok(Some(table))
    }

    /// 读出 `va` 的页表项。页表缺失时返回 `None`。
    pub fn entry(&self, va: VirtAddr) -> Option<Pte> {
        let table = self.pt_of(va, false).ok().flatten()?;
        let raw = unsafe { table_slot(table, va.ptx()).read() };
        Some(Pte(raw))
    }

    /// 写入 `va` 的页表项，页表缺失则分配。
    pub fn set_entry(&mut self, va: VirtAddr, pte: Pte) -> Result<(), MapError> {
        let table = self.pt_of(va, true)?.unwrap();
        unsafe { table_slot(table, va.ptx()).write(pte.0) };
        Ok(())
    }

    /// 建立 `va` 到 `pa` 的映射。
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> Result<(), MapError> {
        self.set_entry(va, Pte::build(pa, flags))
    }

    /// 抹去 `va` 的页表项。
    pub fn unmap(&mut self, va: VirtAddr) {
        if let Ok(Some(table)) = self.pt_of(va, false) {
            unsafe { table_slot(table, va.ptx()).write(0) };
        }
    }

    /// 软件遍历：不触碰硬件遍历器，算出 `va` 对应的物理地址和标志位。
    ///
    /// 任何一级缺失都返回 `None`。
    pub fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
        let pte = self.entry(va)?;
        if !pte.is_some() {
            return None;
        }
        Some((PhysAddr(pte.addr().0 | va.offset() as u32), pte.flags()))
    }

    /// 收集全部已记录的映射，按虚地址升序。
    pub fn mappings(&self) -> Vec<(VirtAddr, Pte)> {
        let mut out = Vec::new();
        for pdx in 0..NPDENTRIES {
            let pde = Pte(unsafe { table_slot(self.root, pdx).read() });
            if !pde.flags().contains(PteFlags::PRESENT) {
                continue;
            }
            let table = pde.addr();
            for ptx in 0..NPTENTRIES {
                let pte = Pte(unsafe { table_slot(table, ptx).read() });
                if pte.is_some() {
                    let va = VirtAddr(((pdx << 22) | (ptx << 12)) as u32);
                    out.push((va, pte));
                }
            }
        }
        out
    }
}

impl Drop for PageDir {
    fn drop(&mut self) {
        for pdx in 0..NPDENTRIES {
            let pde = Pte(unsafe { table_slot(self.root, pdx).read() });
            if pde.flags().contains(PteFlags::PRESENT) {
                kfree(pde.addr());
            }
        }
        kfree(self.root);
    }
}

#[cfg(test)]
mod tests;
