//! 缺页处理。
//!
//! 一次缺页按序做三件事：写时复制（挂起位且是写访问）、给两个位都
//! 没有的用户页补上软件托管位、软件 TLB 重填并临时置上存在位。
//! 哪一步都不适用就是致命缺页，杀掉进程。

use crate::{mmu, process::Process};
use frame_tracker::{kalloc, kfree, phys_ptr, refcnt, PAGE_SIZE};
use page_walk::{Pte, PteFlags, VirtAddr};
use sw_tlb::{ipt, tlb};

/// 缺页处理的结局。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultOutcome {
    /// 状态修好了，重试访问。
    Handled,
    /// 无法挽救，进程已标记为杀死。
    Killed,
}

fn kill(p: &mut Process, va: VirtAddr, why: &str) -> FaultOutcome {
    log::error!(
        "page fault - pid {} {}: addr {:#x} {why} -- kill proc",
        p.pid,
        p.name,
        va.0
    );
    p.killed = true;
    FaultOutcome::Killed
}

/// 缺页入口。`is_write` 是故障访问的方向。
pub fn handle_page_fault(p: &mut Process, va: VirtAddr, is_write: bool) -> FaultOutcome {
    let pg = va.floor();
    let pte = match p.pgdir.entry(pg) {
        Some(pte) if pte.is_some() => pte,
        _ => return kill(p, va, "<no pte>"),
    };
    let mut handled = false;

    // 写时复制：帧还有别的共享者就先复制一份，只剩自己就直接收回写权
    if is_write && pte.flags().contains(PteFlags::COW) {
        let pa = pte.addr();
        let mut flags = pte.flags();
        flags.remove(PteFlags::COW);
        flags.insert(PteFlags::WRITABLE);
        if refcnt(pa) > 1 {
            let mem = match kalloc(Some(p.pid)) {
                Some(mem) => mem,
                None => return kill(p, va, "cow: out of memory"),
            };
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_ptr(pa).as_ptr(),
                    phys_ptr(mem).as_ptr(),
                    PAGE_SIZE,
                );
            }
            if p.pgdir.set_entry(pg, Pte::build(mem, flags)).is_err() {
                kfree(mem);
                return kill(p, va, "cow: out of memory");
            }
            // 映射指向了新帧，反查记录跟着搬家
            ipt::remove(pg, pa, p.pid);
            let _ = ipt::insert(pg, mem, flags, p.pid);
            kfree(pa);
        } else if p.pgdir.set_entry(pg, Pte::build(pa, flags)).is_err() {
            return kill(p, va, "cow: out of memory");
        }
        mmu::flush_hw_tlb(p.pid);
        handled = true;
    }

    // 抢救：表项存在但两个位都没有，用户页补上软件托管位
    let pte = p.pgdir.entry(pg).unwrap();
    if !pte.flags().intersects(PteFlags::SOFT | PteFlags::PRESENT) {
        if pg.is_user() {
            let flags = pte.flags() | PteFlags::SOFT | PteFlags::USER;
            if p.pgdir.set_entry(pg, Pte::build(pte.addr(), flags)).is_err() {
                return kill(p, va, "rescue: out of memory");
            }
            mmu::flush_hw_tlb(p.pid);
        } else {
            return kill(p, va, "kernel range");
        }
    }

    // 软件 TLB 重填，顺带记录这页并临时置上存在位
    let pte = p.pgdir.entry(pg).unwrap();
    let flags = pte.flags();
    if flags.contains(PteFlags::SOFT) && !flags.contains(PteFlags::PRESENT) {
        let pa = pte.addr();
        match tlb::lookup(p.pid, pg) {
            // 缓存的物理页对不上就重装
            Some((cached, _)) if cached.floor() != pa => tlb::alloc(p.pid, pg, pa, flags),
            Some(_) => {}
            None => tlb::alloc(p.pid, pg, pa, flags),
        }
        track_va(p, pg);
        let promoted = (flags - PteFlags::SOFT) | PteFlags::PRESENT;
        if p.pgdir.set_entry(pg, Pte::build(pa, promoted)).is_err() {
            return kill(p, va, "refill: out of memory");
        }
        mmu::flush_hw_tlb(p.pid);
        handled = true;
    }

    if handled {
        FaultOutcome::Handled
    } else {
        kill(p, va, "unexpected state")
    }
}

/// 记录一页到跟踪器。重复的不再记；记满了先整体撤销再记。
fn track_va(p: &mut Process, pg: VirtAddr) {
    if p.tracked.contains(pg) {
        return;
    }
    if p.tracked.is_full() {
        demote_tracked(p);
    }
    p.tracked.push(pg);
}

/// 撤掉所有被跟踪页的存在位，恢复软件托管位，让它们重新陷入缺页。
/// 不这样做的话所有表项迟早都带上存在位，软件 TLB 就再也观测不到
/// 命中和缺失了。
pub fn demote_tracked(p: &mut Process) {
    for va in p.tracked.drain() {
        if let Some(pte) = p.pgdir.entry(va) {
            if pte.is_some() {
                let flags = (pte.flags() - PteFlags::PRESENT) | PteFlags::SOFT;
                let _ = p.pgdir.set_entry(va, Pte::build(pte.addr(), flags));
            }
        }
    }
    mmu::flush_hw_tlb(p.pid);
}
