//! 倒排页表：物理帧到 `(pid, va, flags)` 映射集合的反查。
//!
//! 表项按帧号散列到桶里，同帧的表项经 `next` 连成链；
//! 表项本身从整帧切出的池子里取，空闲的经 `cnext` 串起来。
//! 表的锁和池的锁分开，先表后池。

use alloc::vec::Vec;
use core::ptr::{self, addr_of_mut, NonNull};
use frame_tracker::{kalloc, phys_ptr, PhysAddr, PAGE_SIZE};
use page_walk::{PteFlags, VirtAddr};
use spin::Mutex;

/// 桶数，每个可能的物理帧一个。
pub const IPT_BUCKETS: usize = 60000;

#[repr(C)]
struct IptEntry {
    pfn: u32,
    pid: i32,
    va: u32,
    flags: PteFlags,
    /// 链头专用：同链其余表项的数目。
    refcnt: u32,
    next: *mut IptEntry,
    cnext: *mut IptEntry,
}

/// 倒排页表操作错误。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IptError {
    /// 池子空了而且无法再分配整帧扩充。
    OutOfMemory,
}

/// 一条反查记录。
#[derive(Clone, Copy, Debug)]
pub struct IptRecord {
    /// 属主进程。
    pub pid: i32,
    /// 虚地址（页对齐）。
    pub va: VirtAddr,
    /// 记录的标志位。
    pub flags: PteFlags,
}

struct Slab {
    free: *mut IptEntry,
}

unsafe impl Send for Slab {}

struct Table {
    buckets: [*mut IptEntry; IPT_BUCKETS],
}

unsafe impl Send for Table {}

static SLAB: Mutex<Slab> = Mutex::new(Slab {
    free: ptr::null_mut(),
});

static TABLE: Mutex<Table> = Mutex::new(Table {
    buckets: [ptr::null_mut(); IPT_BUCKETS],
});

/// 从池里取一个表项；池空时分配一整帧切成表项补进去。
///
/// 事先算不出会用多少表项，所以只能这样动态扩充。
fn cell_alloc() -> Option<NonNull<IptEntry>> {
    let mut slab = SLAB.lock();
    if slab.free.is_null() {
        let pa = kalloc(None)?;
        let base = phys_ptr(pa).as_ptr();
        let size = core::mem::size_of::<IptEntry>();
        let mut offset = 0;
        while offset + size <= PAGE_SIZE {
            let cell = unsafe { base.add(offset) } as *mut IptEntry;
            unsafe { addr_of_mut!((*cell).cnext).write(slab.free) };
            slab.free = cell;
            offset += size;
        }
    }
    let cell = slab.free;
    slab.free = unsafe { (*cell).cnext };
    NonNull::new(cell)
}

/// 表项归还池子。承载它的帧不回收。
fn cell_free(cell: *mut IptEntry) {
    unsafe { ptr::write_bytes(cell as *mut u8, 0, core::mem::size_of::<IptEntry>()) };
    let mut slab = SLAB.lock();
    unsafe { addr_of_mut!((*cell).cnext).write(slab.free) };
    slab.free = cell;
}

/// 登记一条 `(va, pid)` 到 `pa` 的映射。
///
/// 同键表项已存在时只更新标志位，否则取新表项接到链尾。
/// 存下的标志位总是带存在位。完成后失效对应的软件 TLB 槽。
///
/// # Panics
///
/// 帧号超出桶范围时 panic。
pub fn insert(va: VirtAddr, pa: PhysAddr, flags: PteFlags, pid: i32) -> Result<(), IptError> {
    let idx = pa.pfn();
    assert!(idx < IPT_BUCKETS, "ipt: out of range");
    let va = va.floor();
    {
        let mut table = TABLE.lock();
        let head = table.buckets[idx];
        let mut t = head;
        let mut last: *mut IptEntry = ptr::null_mut();
        unsafe {
            while !t.is_null() {
                if (*t).va == va.0 && (*t).pid == pid {
                    break;
                }
                last = t;
                t = (*t).next;
            }
            if !t.is_null() {
                (*t).flags = flags | PteFlags::PRESENT;
            } else {
                let cell = match cell_alloc() {
                    Some(cell) => cell.as_ptr(),
                    None => return Err(IptError::OutOfMemory),
                };
                cell.write(IptEntry {
                    pfn: idx as u32,
                    pid,
                    va: va.0,
                    flags: flags | PteFlags::PRESENT,
                    refcnt: 0,
                    next: ptr::null_mut(),
                    cnext: ptr::null_mut(),
                });
                if !last.is_null() {
                    (*last).next = cell;
                    (*head).refcnt += 1;
                } else {
                    table.buckets[idx] = cell;
                }
            }
        }
    }
    crate::tlb::invalidate(pid, va);
    Ok(())
}

/// 摘除 `(va, pid)` 对应的表项并归还池子。找到并摘除返回 `true`。
pub fn remove(va: VirtAddr, pa: PhysAddr, pid: i32) -> bool {
    let idx = pa.pfn();
    if idx >= IPT_BUCKETS {
        return false;
    }
    let va = va.floor();
    let cell;
    {
        let mut table = TABLE.lock();
        let head = table.buckets[idx];
        let mut t = head;
        let mut prev: *mut IptEntry = ptr::null_mut();
        unsafe {
            while !t.is_null() {
                if (*t).va == va.0 && (*t).pid == pid {
                    break;
                }
                prev = t;
                t = (*t).next;
            }
            if t.is_null() {
                return false;
            }
            if !prev.is_null() {
                (*prev).next = (*t).next;
                (*head).refcnt -= 1;
            } else {
                // 摘的是链头，链上剩余计数转给新链头
                let next = (*t).next;
                if !next.is_null() {
                    (*next).refcnt = (*t).refcnt - 1;
                }
                table.buckets[idx] = next;
            }
            cell = t;
        }
    }
    cell_free(cell);
    true
}

/// 拷出 `pa` 所在链的前 `max` 条记录。整个拷贝在表锁内完成。
pub fn chain(pa: PhysAddr, max: usize) -> Vec<IptRecord> {
    let idx = pa.pfn();
    let mut out = Vec::new();
    if idx >= IPT_BUCKETS {
        return out;
    }
    let table = TABLE.lock();
    let mut t = table.buckets[idx];
    unsafe {
        while !t.is_null() && out.len() < max {
            out.push(IptRecord {
                pid: (*t).pid,
                va: VirtAddr((*t).va),
                flags: (*t).flags,
            });
            t = (*t).next;
        }
    }
    out
}

/// `pa` 所在链的长度。
pub fn chain_len(pa: PhysAddr) -> usize {
    let idx = pa.pfn();
    if idx >= IPT_BUCKETS {
        return 0;
    }
    let table = TABLE.lock();
    let mut n = 0;
    let mut t = table.buckets[idx];
    unsafe {
        while !t.is_null() {
            n += 1;
            t = (*t).next;
        }
    }
    n
}
