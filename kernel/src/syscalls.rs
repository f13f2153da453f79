//! 各种接口库的实现。
//!
//! 系统调用只是翻译层：校验用户指针，取出参数，调到对应子系统，
//! 把结果折回约定的 `isize` 错误码。

use crate::{
    clock,
    fs::FS,
    mmu,
    process::USER_HEAP_BASE,
    processor::PROCESSOR,
};
use alloc::vec;
use core::mem::size_of;
use frame_tracker::{FrameInfo, PhysAddr};
use page_walk::{PteFlags, VirtAddr};
use snap_fs::{FSManager, File, OpenFlags, SnapshotError, NDIRECT, NINDIRECT};
use sw_tlb::{ipt, tlb};
use syscall::{Caller, FrameRecord, ProcInfo, VirtMapRecord};

/// 标准输出的文件描述符。
pub const STDOUT: usize = 1;

/// 系统调用的实现载体。
pub struct SyscallContext;

fn struct_bytes<T>(v: &T) -> &[u8] {
    unsafe { core::slice::from_raw_parts(v as *const T as *const u8, size_of::<T>()) }
}

impl syscall::Process for SyscallContext {
    fn exit(&self, _caller: Caller, status: usize) -> isize {
        PROCESSOR.lock().make_current_exited(status as i32);
        0
    }

    fn fork(&self, _caller: Caller) -> isize {
        PROCESSOR
            .lock()
            .fork_current()
            .map_or(-1, |pid| pid as isize)
    }

    fn wait(&self, _caller: Caller, _pid: isize, exit_code_ptr: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(parent) = manager.current_pid() else {
            return -1;
        };
        let Some((pid, code)) = manager.reap_child(parent) else {
            return -1;
        };
        if exit_code_ptr != 0 {
            let Some(current) = manager.current_mut() else {
                return -1;
            };
            if mmu::copyout(
                &current.pgdir,
                VirtAddr(exit_code_ptr as u32),
                &code.to_le_bytes(),
            )
            .is_err()
            {
                return -1;
            }
        }
        pid as isize
    }

    fn getpid(&self, _caller: Caller) -> isize {
        PROCESSOR.lock().current_pid().map_or(-1, |pid| pid as isize)
    }

    fn sbrk(&self, _caller: Caller, delta: isize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        match current.grow(delta as i32) {
            Some(old) => (USER_HEAP_BASE + old) as isize,
            None => -1,
        }
    }

    fn sleep(&self, _caller: Caller, ticks: usize) -> isize {
        clock::advance(ticks as u32);
        0
    }

    fn uptime(&self, _caller: Caller) -> isize {
        clock::ticks() as isize
    }

    fn kill(&self, _caller: Caller, pid: isize) -> isize {
        match PROCESSOR.lock().get_mut(pid as i32) {
            Some(p) => {
                p.killed = true;
                0
            }
            None => -1,
        }
    }

    fn hello_number(&self, _caller: Caller, n: usize) -> isize {
        println!("Hello, xv6! Your number is {}", n as i32);
        (n as isize) * 2
    }

    fn get_procinfo(&self, _caller: Caller, pid: isize, out: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let pid = if pid <= 0 {
            match manager.current_pid() {
                Some(pid) => pid,
                None => return -1,
            }
        } else {
            pid as i32
        };
        let info = match manager.get_mut(pid) {
            Some(p) => ProcInfo {
                pid: p.pid,
                ppid: p.ppid,
                state: p.state as i32,
                sz: p.sz,
                name: p.name_bytes(),
            },
            None => return -1,
        };
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        match mmu::copyout(&current.pgdir, VirtAddr(out as u32), struct_bytes(&info)) {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }
}

impl syscall::IO for SyscallContext {
    fn write(&self, _caller: Caller, fd: usize, buf: usize, count: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        if fd == STDOUT {
            let mut data = vec![0u8; count];
            if mmu::copyin(&current.pgdir, VirtAddr(buf as u32), &mut data).is_err() {
                log::error!("ptr not readable");
                return -1;
            }
            print!("{}", core::str::from_utf8(&data).unwrap_or(""));
            return count as isize;
        }
        let Some(user) = mmu::user_buffer(&current.pgdir, VirtAddr(buf as u32), count) else {
            log::error!("ptr not readable");
            return -1;
        };
        match current.fd_table.get(fd).and_then(|slot| slot.as_ref()) {
            Some(file) => {
                let mut file = file.lock();
                if file.writable() {
                    file.write(user) as isize
                } else {
                    log::error!("file not writable");
                    -1
                }
            }
            None => {
                log::error!("unsupported fd: {fd}");
                -1
            }
        }
    }

    fn read(&self, _caller: Caller, fd: usize, buf: usize, count: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        let Some(user) = mmu::user_buffer(&current.pgdir, VirtAddr(buf as u32), count) else {
            log::error!("ptr not writeable");
            return -1;
        };
        match current.fd_table.get(fd).and_then(|slot| slot.as_ref()) {
            Some(file) => {
                let mut file = file.lock();
                if file.readable() {
                    file.read(user) as isize
                } else {
                    log::error!("file not readable");
                    -1
                }
            }
            None => {
                log::error!("unsupported fd: {fd}");
                -1
            }
        }
    }

    fn open(&self, _caller: Caller, path: usize, flags: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        let Some(path) = mmu::copy_str_in(&current.pgdir, VirtAddr(path as u32), 128) else {
            return -1;
        };
        let Some(flags) = OpenFlags::from_bits(flags as u32) else {
            return -1;
        };
        match FS.open(&path, flags) {
            Some(handle) => current.push_file((*handle).clone()) as isize,
            None => -1,
        }
    }

    fn close(&self, _caller: Caller, fd: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        if fd >= current.fd_table.len() || current.fd_table[fd].is_none() {
            return -1;
        }
        current.fd_table[fd].take();
        0
    }

    fn unlink(&self, _caller: Caller, path: usize) -> isize {
        let path = {
            let mut manager = PROCESSOR.lock();
            let Some(current) = manager.current_mut() else {
                return -1;
            };
            match mmu::copy_str_in(&current.pgdir, VirtAddr(path as u32), 128) {
                Some(path) => path,
                None => return -1,
            }
        };
        FS.unlink(&path)
    }

    fn mkdir(&self, _caller: Caller, path: usize) -> isize {
        let path = {
            let mut manager = PROCESSOR.lock();
            let Some(current) = manager.current_mut() else {
                return -1;
            };
            match mmu::copy_str_in(&current.pgdir, VirtAddr(path as u32), 128) {
                Some(path) => path,
                None => return -1,
            }
        };
        FS.mkdir(&path)
    }
}

impl syscall::Translation for SyscallContext {
    fn vtop(&self, _caller: Caller, va: usize, pa_out: usize, flags_out: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        if pa_out == 0 || flags_out == 0 {
            return -1;
        }
        let Some((pa, flags)) = current.pgdir.translate(VirtAddr(va as u32)) else {
            return 0;
        };
        // 软件托管位只在内核内部有意义，对用户报告成存在位
        let mut flags = flags;
        if flags.contains(PteFlags::SOFT) {
            flags.remove(PteFlags::SOFT);
            flags.insert(PteFlags::PRESENT);
        }
        let pgdir = &current.pgdir;
        if mmu::copyout(pgdir, VirtAddr(pa_out as u32), &pa.0.to_le_bytes()).is_err() {
            return -1;
        }
        if mmu::copyout(pgdir, VirtAddr(flags_out as u32), &flags.bits().to_le_bytes()).is_err() {
            return -1;
        }
        1
    }

    fn phys2virt(&self, _caller: Caller, pa: usize, out: usize, max: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        let records = ipt::chain(PhysAddr(pa as u32), max);
        for (i, record) in records.iter().enumerate() {
            let mut flags = record.flags;
            if flags.contains(PteFlags::SOFT) {
                flags.remove(PteFlags::SOFT);
                flags.insert(PteFlags::PRESENT);
            }
            let rec = VirtMapRecord {
                pid: record.pid as u32,
                va: record.va.0,
                flags: (flags.bits() & 0x1f) as u16,
            };
            let dst = VirtAddr((out + i * size_of::<VirtMapRecord>()) as u32);
            if mmu::copyout(&current.pgdir, dst, struct_bytes(&rec)).is_err() {
                return -1;
            }
        }
        records.len() as isize
    }

    fn dump_physmem_info(&self, _caller: Caller, out: usize, max: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        if max == 0 {
            return -1;
        }
        let max = max.min(frame_tracker::PFNNUM);
        let mut infos = vec![
            FrameInfo {
                frame_index: 0,
                allocated: false,
                pid: -1,
                start_tick: 0,
                refcnt: 0,
            };
            max
        ];
        let count = frame_tracker::dump(&mut infos);
        for (i, info) in infos[..count].iter().enumerate() {
            let rec = FrameRecord {
                frame_index: info.frame_index,
                allocated: info.allocated as i32,
                pid: info.pid,
                start_tick: info.start_tick,
            };
            let dst = VirtAddr((out + i * size_of::<FrameRecord>()) as u32);
            if mmu::copyout(&current.pgdir, dst, struct_bytes(&rec)).is_err() {
                return -1;
            }
        }
        count as isize
    }

    fn tlbinfo(&self, _caller: Caller, hits_out: usize, misses_out: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        // 两个指针都先校验再写出
        let pgdir = &current.pgdir;
        if pgdir.translate(VirtAddr(hits_out as u32)).is_none()
            || pgdir.translate(VirtAddr(misses_out as u32)).is_none()
        {
            return -1;
        }
        let (hits, misses) = tlb::info();
        if mmu::copyout(pgdir, VirtAddr(hits_out as u32), &hits.to_le_bytes()).is_err() {
            return -1;
        }
        if mmu::copyout(pgdir, VirtAddr(misses_out as u32), &misses.to_le_bytes()).is_err() {
            return -1;
        }
        0
    }
}

impl syscall::Snapshot for SyscallContext {
    fn snapshot_create(&self, _caller: Caller) -> isize {
        match FS.fs().snapshot_create() {
            Ok(id) => id as isize,
            Err(SnapshotError::OutOfInodes) => -2,
            Err(_) => -1,
        }
    }

    fn snapshot_rollback(&self, _caller: Caller, id: isize) -> isize {
        if id <= 0 {
            return -1;
        }
        match FS.fs().snapshot_rollback(id as u32) {
            Ok(()) => 0,
            Err(SnapshotError::OutOfInodes) => -2,
            Err(_) => -1,
        }
    }

    fn snapshot_delete(&self, _caller: Caller, id: isize) -> isize {
        if id <= 0 {
            return -1;
        }
        match FS.fs().snapshot_delete(id as u32) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }

    fn get_addrs(&self, _caller: Caller, path: usize, out: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        let Some(path) = mmu::copy_str_in(&current.pgdir, VirtAddr(path as u32), 128) else {
            return -1;
        };
        let Some(ip) = FS.find(&path) else {
            return -1;
        };
        let addrs = { *ip.lock().addrs() };
        for (i, addr) in addrs.iter().enumerate() {
            let dst = VirtAddr((out + i * size_of::<u32>()) as u32);
            if mmu::copyout(&current.pgdir, dst, &addr.to_le_bytes()).is_err() {
                return -1;
            }
        }
        0
    }

    fn get_indirect_addrs(&self, _caller: Caller, path: usize, out: usize) -> isize {
        let mut manager = PROCESSOR.lock();
        let Some(current) = manager.current_mut() else {
            return -1;
        };
        let Some(path) = mmu::copy_str_in(&current.pgdir, VirtAddr(path as u32), 128) else {
            return -1;
        };
        let Some(ip) = FS.find(&path) else {
            return -1;
        };
        let table = {
            let guard = ip.lock();
            if guard.addrs()[NDIRECT] == 0 {
                return -1;
            }
            let mut table = [0u32; NINDIRECT];
            for (i, slot) in table.iter_mut().enumerate() {
                *slot = guard.bmmap(NDIRECT + i);
            }
            table
        };
        for (i, addr) in table.iter().enumerate() {
            let dst = VirtAddr((out + i * size_of::<u32>()) as u32);
            if mmu::copyout(&current.pgdir, dst, &addr.to_le_bytes()).is_err() {
                return -1;
            }
        }
        0
    }
}
