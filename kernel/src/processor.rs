//! 进程管理器。
//!
//! `procs` 中保存所有的进程实体，`current` 是正在内核里执行的那个。

use crate::process::{ProcState, Process};
use alloc::collections::BTreeMap;
use spin::Mutex;

/// 全局进程管理器。
pub static PROCESSOR: Mutex<ProcManager> = Mutex::new(ProcManager::new());

/// 进程管理器。
pub struct ProcManager {
    procs: BTreeMap<i32, Process>,
    current: Option<i32>,
}

impl ProcManager {
    /// 新建进程管理器。
    pub const fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            current: None,
        }
    }

    /// 创建一个进程，父进程是当前进程（没有则记 0）。
    pub fn spawn(&mut self, name: &str) -> Option<i32> {
        let ppid = self.current.unwrap_or(0);
        let p = Process::new(name, ppid).ok()?;
        let pid = p.pid;
        self.procs.insert(pid, p);
        Some(pid)
    }

    /// 切换当前进程。
    pub fn make_current(&mut self, pid: i32) -> bool {
        if !self.procs.contains_key(&pid) {
            return false;
        }
        if let Some(old) = self.current.take() {
            if let Some(p) = self.procs.get_mut(&old) {
                if p.state == ProcState::Running {
                    p.state = ProcState::Runnable;
                }
            }
        }
        self.procs.get_mut(&pid).unwrap().state = ProcState::Running;
        self.current = Some(pid);
        true
    }

    /// 当前进程号。
    pub fn current_pid(&self) -> Option<i32> {
        self.current
    }

    /// 当前进程。
    pub fn current_mut(&mut self) -> Option<&mut Process> {
        let pid = self.current?;
        self.procs.get_mut(&pid)
    }

    /// 按进程号取进程。
    pub fn get_mut(&mut self, pid: i32) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    /// 派生当前进程，返回子进程号。
    pub fn fork_current(&mut self) -> Option<i32> {
        let cur = self.current?;
        let child = {
            let parent = self.procs.get_mut(&cur)?;
            parent.fork().ok()?
        };
        let pid = child.pid;
        self.procs.insert(pid, child);
        Some(pid)
    }

    /// 结束当前进程：回收翻译资源，留下僵尸等父进程收尸。
    pub fn make_current_exited(&mut self, exit_code: i32) {
        if let Some(pid) = self.current.take() {
            if let Some(p) = self.procs.get_mut(&pid) {
                p.release_translation();
                p.state = ProcState::Zombie;
                p.exit_code = exit_code;
            }
        }
    }

    /// 收一个已退出的子进程，返回 (进程号, 退出码)。
    pub fn reap_child(&mut self, parent: i32) -> Option<(i32, i32)> {
        let pid = self
            .procs
            .iter()
            .find(|(_, p)| p.ppid == parent && p.state == ProcState::Zombie)
            .map(|(pid, _)| *pid)?;
        let p = self.procs.remove(&pid)?;
        Some((pid, p.exit_code))
    }
}
