#![no_std]

#[cfg(all(feature = "supervisor", feature = "user"))]
compile_error!("You can only use one of `supervisor` or `user` features at a time");

#[cfg(feature = "supervisor")]
mod kernel;

#[cfg(feature = "supervisor")]
pub use kernel::*;

#[cfg(all(feature = "user", target_arch = "riscv64"))]
mod user;

#[cfg(all(feature = "user", target_arch = "riscv64"))]
pub use user::*;

/// 系统调用号。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SyscallId(pub usize);

#[allow(missing_docs)]
impl SyscallId {
    pub const FORK: Self = Self(1);
    pub const EXIT: Self = Self(2);
    pub const WAIT: Self = Self(3);
    pub const READ: Self = Self(5);
    pub const KILL: Self = Self(6);
    pub const GETPID: Self = Self(11);
    pub const SBRK: Self = Self(12);
    pub const SLEEP: Self = Self(13);
    pub const UPTIME: Self = Self(14);
    pub const OPEN: Self = Self(15);
    pub const WRITE: Self = Self(16);
    pub const UNLINK: Self = Self(18);
    pub const MKDIR: Self = Self(20);
    pub const CLOSE: Self = Self(21);
    pub const HELLO_NUMBER: Self = Self(22);
    pub const GET_PROCINFO: Self = Self(23);
    pub const VTOP: Self = Self(24);
    pub const PHYS2VIRT: Self = Self(25);
    pub const DUMP_PHYSMEM_INFO: Self = Self(26);
    pub const TLBINFO: Self = Self(27);
    pub const SNAPSHOT_CREATE: Self = Self(28);
    pub const SNAPSHOT_ROLLBACK: Self = Self(29);
    pub const SNAPSHOT_DELETE: Self = Self(30);
    pub const GET_ADDRS: Self = Self(31);
    pub const GET_INDIRECT_ADDRS: Self = Self(32);
}

impl From<usize> for SyscallId {
    #[inline]
    fn from(v: usize) -> Self {
        Self(v)
    }
}

/// `get_procinfo` 返回的进程信息。内核和用户两侧布局一致。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ProcInfo {
    /// 进程号。
    pub pid: i32,
    /// 父进程号。
    pub ppid: i32,
    /// 调度状态。
    pub state: i32,
    /// 已用地址空间字节数。
    pub sz: u32,
    /// 进程名。
    pub name: [u8; 16],
}

/// `phys2virt` 返回的一条反查记录。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VirtMapRecord {
    /// 属主进程号。
    pub pid: u32,
    /// 虚地址（页对齐）。
    pub va: u32,
    /// 表项标志位。
    pub flags: u16,
}

/// `dump_physmem_info` 返回的一条帧记录。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameRecord {
    /// 帧号。
    pub frame_index: u32,
    /// 是否已分配。
    pub allocated: i32,
    /// 属主进程号。
    pub pid: i32,
    /// 分配时刻。
    pub start_tick: u32,
}
