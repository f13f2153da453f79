#![allow(unused_variables)]

use crate::SyscallId;
use spin::Once;

/// 系统调用的发起者信息。
///
/// 两个 `usize` 对一个类 UNIX 的宏内核足够了。
pub struct Caller {
    /// 发起者拥有的资源集的标记，相当于进程号。
    pub entity: usize,
    /// 发起者的控制流的标记，相当于线程号。
    pub flow: usize,
}

pub trait Process: Sync {
    fn exit(&self, caller: Caller, status: usize) -> isize {
        unimplemented!()
    }
    fn fork(&self, caller: Caller) -> isize {
        unimplemented!()
    }
    fn wait(&self, caller: Caller, pid: isize, exit_code_ptr: usize) -> isize {
        unimplemented!()
    }
    fn getpid(&self, caller: Caller) -> isize {
        unimplemented!()
    }
    fn sbrk(&self, caller: Caller, delta: isize) -> isize {
        unimplemented!()
    }
    fn sleep(&self, caller: Caller, ticks: usize) -> isize {
        unimplemented!()
    }
    fn uptime(&self, caller: Caller) -> isize {
        unimplemented!()
    }
    fn kill(&self, caller: Caller, pid: isize) -> isize {
        unimplemented!()
    }
    fn hello_number(&self, caller: Caller, n: usize) -> isize {
        unimplemented!()
    }
    fn get_procinfo(&self, caller: Caller, pid: isize, out: usize) -> isize {
        unimplemented!()
    }
}

pub trait IO: Sync {
    fn read(&self, caller: Caller, fd: usize, buf: usize, count: usize) -> isize {
        unimplemented!()
    }
    fn write(&self, caller: Caller, fd: usize, buf: usize, count: usize) -> isize {
        unimplemented!()
    }
    fn open(&self, caller: Caller, path: usize, flags: usize) -> isize {
        unimplemented!()
    }
    fn close(&self, caller: Caller, fd: usize) -> isize {
        unimplemented!()
    }
    fn unlink(&self, caller: Caller, path: usize) -> isize {
        unimplemented!()
    }
    fn mkdir(&self, caller: Caller, path: usize) -> isize {
        unimplemented!()
    }
}

/// 软件地址翻译的观测接口。
pub trait Translation: Sync {
    fn vtop(&self, caller: Caller, va: usize, pa_out: usize, flags_out: usize) -> isize {
        unimplemented!()
    }
    fn phys2virt(&self, caller: Caller, pa: usize, out: usize, max: usize) -> isize {
        unimplemented!()
    }
    fn dump_physmem_info(&self, caller: Caller, out: usize, max: usize) -> isize {
        unimplemented!()
    }
    fn tlbinfo(&self, caller: Caller, hits_out: usize, misses_out: usize) -> isize {
        unimplemented!()
    }
}

/// 文件系统快照接口。
pub trait Snapshot: Sync {
    fn snapshot_create(&self, caller: Caller) -> isize {
        unimplemented!()
    }
    fn snapshot_rollback(&self, caller: Caller, id: isize) -> isize {
        unimplemented!()
    }
    fn snapshot_delete(&self, caller: Caller, id: isize) -> isize {
        unimplemented!()
    }
    fn get_addrs(&self, caller: Caller, path: usize, out: usize) -> isize {
        unimplemented!()
    }
    fn get_indirect_addrs(&self, caller: Caller, path: usize, out: usize) -> isize {
        unimplemented!()
    }
}

static PROCESS: Container<dyn Process> = Container::new();
static IO: Container<dyn IO> = Container::new();
static TRANSLATION: Container<dyn Translation> = Container::new();
static SNAPSHOT: Container<dyn Snapshot> = Container::new();

#[inline]
pub fn init_process(process: &'static dyn Process) {
    PROCESS.init(process);
}

#[inline]
pub fn init_io(io: &'static dyn IO) {
    IO.init(io);
}

#[inline]
pub fn init_translation(translation: &'static dyn Translation) {
    TRANSLATION.init(translation);
}

#[inline]
pub fn init_snapshot(snapshot: &'static dyn Snapshot) {
    SNAPSHOT.init(snapshot);
}

pub enum SyscallResult {
    Done(isize),
    Unsupported(SyscallId),
}

pub fn handle(caller: Caller, id: SyscallId, args: [usize; 6]) -> SyscallResult {
    use SyscallId as Id;
    match id {
        Id::WRITE => IO.call(id, |io| io.write(caller, args[0], args[1], args[2])),
        Id::READ => IO.call(id, |io| io.read(caller, args[0], args[1], args[2])),
        Id::OPEN => IO.call(id, |io| io.open(caller, args[0], args[1])),
        Id::CLOSE => IO.call(id, |io| io.close(caller, args[0])),
        Id::UNLINK => IO.call(id, |io| io.unlink(caller, args[0])),
        Id::MKDIR => IO.call(id, |io| io.mkdir(caller, args[0])),
        Id::EXIT => PROCESS.call(id, |proc| proc.exit(caller, args[0])),
        Id::FORK => PROCESS.call(id, |proc| proc.fork(caller)),
        Id::WAIT => PROCESS.call(id, |proc| proc.wait(caller, args[0] as _, args[1])),
        Id::GETPID => PROCESS.call(id, |proc| proc.getpid(caller)),
        Id::SBRK => PROCESS.call(id, |proc| proc.sbrk(caller, args[0] as _)),
        Id::SLEEP => PROCESS.call(id, |proc| proc.sleep(caller, args[0])),
        Id::UPTIME => PROCESS.call(id, |proc| proc.uptime(caller)),
        Id::KILL => PROCESS.call(id, |proc| proc.kill(caller, args[0] as _)),
        Id::HELLO_NUMBER => PROCESS.call(id, |proc| proc.hello_number(caller, args[0])),
        Id::GET_PROCINFO => {
            PROCESS.call(id, |proc| proc.get_procinfo(caller, args[0] as _, args[1]))
        }
        Id::VTOP => TRANSLATION.call(id, |t| t.vtop(caller, args[0], args[1], args[2])),
        Id::PHYS2VIRT => TRANSLATION.call(id, |t| t.phys2virt(caller, args[0], args[1], args[2])),
        Id::DUMP_PHYSMEM_INFO => {
            TRANSLATION.call(id, |t| t.dump_physmem_info(caller, args[0], args[1]))
        }
        Id::TLBINFO => TRANSLATION.call(id, |t| t.tlbinfo(caller, args[0], args[1])),
        Id::SNAPSHOT_CREATE => SNAPSHOT.call(id, |s| s.snapshot_create(caller)),
        Id::SNAPSHOT_ROLLBACK => SNAPSHOT.call(id, |s| s.snapshot_rollback(caller, args[0] as _)),
        Id::SNAPSHOT_DELETE => SNAPSHOT.call(id, |s| s.snapshot_delete(caller, args[0] as _)),
        Id::GET_ADDRS => SNAPSHOT.call(id, |s| s.get_addrs(caller, args[0], args[1])),
        Id::GET_INDIRECT_ADDRS => {
            SNAPSHOT.call(id, |s| s.get_indirect_addrs(caller, args[0], args[1]))
        }
        _ => SyscallResult::Unsupported(id),
    }
}

struct Container<T: 'static + ?Sized>(spin::Once<&'static T>);

impl<T: 'static + ?Sized> Container<T> {
    #[inline]
    const fn new() -> Self {
        Self(Once::new())
    }

    #[inline]
    fn init(&self, val: &'static T) {
        self.0.call_once(|| val);
    }

    #[inline]
    fn call(&self, id: SyscallId, f: impl FnOnce(&T) -> isize) -> SyscallResult {
        self.0
            .get()
            .map_or(SyscallResult::Unsupported(id), |imp| {
                SyscallResult::Done(f(imp))
            })
    }
}
