//! 访存路径。
//!
//! 真机上这是 MMU 和硬件 TLB 干的事。这里照硬件的语义模拟：按表项
//! 的存在位和权限位裁决访问，已裁决过的翻译缓存在一张“硬件” TLB 里，
//! 直到被冲刷；不可访问就进入缺页处理再重试。
//! 另有几条内核读写用户内存的通道（copyin/copyout），它们走软件遍历，
//! 软件托管态（非存在）的页一样可达。

use crate::{fault, process::Process};
use alloc::{collections::BTreeMap, string::String, vec::Vec};
use frame_tracker::{phys_ptr, PAGE_SIZE};
use page_walk::{PageDir, Pte, PteFlags, VirtAddr};
use spin::Mutex;

/// “硬件” TLB：每个 (pid, 虚页) 缓存一条裁决过的存在态表项。
static HW_TLB: Mutex<BTreeMap<(i32, u32), Pte>> = Mutex::new(BTreeMap::new());

/// 冲刷某进程的硬件翻译。页表或权限改动之后调用。
pub fn flush_hw_tlb(pid: i32) {
    HW_TLB.lock().retain(|(p, _), _| *p != pid);
}

/// 访存失败：进程已被杀死。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Killed;

fn hw_walk(p: &Process, va: VirtAddr, is_write: bool) -> Option<*mut u8> {
    let key = (p.pid, va.0 >> 12);
    let pte = match HW_TLB.lock().get(&key).copied() {
        Some(pte) => pte,
        None => {
            let pte = p.pgdir.entry(va.floor())?;
            if !pte
                .flags()
                .contains(PteFlags::PRESENT | PteFlags::USER)
            {
                return None;
            }
            HW_TLB.lock().insert(key, pte);
            pte
        }
    };
    if is_write && !pte.flags().contains(PteFlags::WRITABLE) {
        return None;
    }
    Some(unsafe { phys_ptr(pte.addr()).as_ptr().add(va.offset()) })
}

fn access(p: &mut Process, va: VirtAddr, is_write: bool) -> Result<*mut u8, Killed> {
    for _ in 0..3 {
        if let Some(ptr) = hw_walk(p, va, is_write) {
            return Ok(ptr);
        }
        match fault::handle_page_fault(p, va, is_write) {
            fault::FaultOutcome::Handled => continue,
            fault::FaultOutcome::Killed => return Err(Killed),
        }
    }
    panic!("mmu: access not resolved after fault");
}

/// 用户态读一个字节，必要时走缺页处理。
pub fn read_user_byte(p: &mut Process, va: VirtAddr) -> Result<u8, Killed> {
    access(p, va, false).map(|ptr| unsafe { ptr.read() })
}

/// 用户态写一个字节，必要时走缺页处理。
pub fn write_user_byte(p: &mut Process, va: VirtAddr, value: u8) -> Result<(), Killed> {
    access(p, va, true).map(|ptr| unsafe { ptr.write(value) })
}

fn user_page_ptr(pgdir: &PageDir, va: VirtAddr) -> Option<*mut u8> {
    let (pa, flags) = pgdir.translate(va)?;
    if !flags.contains(PteFlags::USER) {
        return None;
    }
    Some(phys_ptr(pa).as_ptr())
}

/// 内核向用户空间拷贝。软件遍历页表，软件托管的页一样可写。
pub fn copyout(pgdir: &PageDir, dst: VirtAddr, src: &[u8]) -> Result<(), ()> {
    let mut off = 0;
    while off < src.len() {
        let va = VirtAddr(dst.0.wrapping_add(off as u32));
        let ptr = user_page_ptr(pgdir, va).ok_or(())?;
        let n = (PAGE_SIZE - va.offset()).min(src.len() - off);
        unsafe { core::ptr::copy_nonoverlapping(src[off..].as_ptr(), ptr, n) };
        off += n;
    }
    Ok(())
}

/// 内核从用户空间拷贝。
pub fn copyin(pgdir: &PageDir, src: VirtAddr, dst: &mut [u8]) -> Result<(), ()> {
    let mut off = 0;
    while off < dst.len() {
        let va = VirtAddr(src.0.wrapping_add(off as u32));
        let ptr = user_page_ptr(pgdir, va).ok_or(())?;
        let n = (PAGE_SIZE - va.offset()).min(dst.len() - off);
        unsafe { core::ptr::copy_nonoverlapping(ptr, dst[off..].as_mut_ptr(), n) };
        off += n;
    }
    Ok(())
}

/// 读用户空间的 NUL 结尾字符串，至多 `max` 字节。
pub fn copy_str_in(pgdir: &PageDir, src: VirtAddr, max: usize) -> Option<String> {
    let mut bytes = Vec::new();
    for i in 0..max {
        let mut b = [0u8];
        copyin(pgdir, VirtAddr(src.0 + i as u32), &mut b).ok()?;
        if b[0] == 0 {
            break;
        }
        bytes.push(b[0]);
    }
    String::from_utf8(bytes).ok()
}

/// 把一段用户缓冲区按页切成内核可直接读写的切片。
pub fn user_buffer(pgdir: &PageDir, va: VirtAddr, len: usize) -> Option<snap_fs::UserBuffer> {
    let mut buffers: Vec<&'static mut [u8]> = Vec::new();
    let mut off = 0;
    while off < len {
        let cur = VirtAddr(va.0 + off as u32);
        let ptr = user_page_ptr(pgdir, cur)?;
        let n = (PAGE_SIZE - cur.offset()).min(len - off);
        buffers.push(unsafe { core::slice::from_raw_parts_mut(ptr, n) });
        off += n;
    }
    Some(snap_fs::UserBuffer::new(buffers))
}
