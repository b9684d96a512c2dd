//! Process control blocks.

use alloc::{sync::Arc, vec::Vec};

use mm::AddressSpace;

use crate::{FileTable, Notification, SigAction, Signal, ThreadHandle};

pub type Pid = u32;

/// The kernel's own process; owns kernel and idle threads.
pub const KERNEL_PID: Pid = 0;

/// The first user process. Orphans are reparented to it and it must never exit.
pub const INIT_PID: Pid = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials { uid: 0, gid: 0 };

    /// Whether a holder of `self` may signal a process owned by `target`.
    pub fn may_signal(&self, target: &Credentials) -> bool {
        self.uid == 0 || self.uid == target.uid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    /// The status word reported by `wait4`.
    pub fn wait_status(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => (code & 0xFF) << 8,
            ExitStatus::Signaled(signal) => i32::from(signal.number()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    /// Every thread has stopped; the parent has not reaped it yet.
    Zombie(ExitStatus),
}

#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub threads: Vec<ThreadHandle>,
    pub space: Arc<AddressSpace>,
    pub files: FileTable,
    pub credentials: Credentials,
    pub pgid: Pid,
    pub state: ProcessState,
    /// Dispositions indexed by signal number; slot 0 is unused.
    pub actions: [SigAction; Signal::MAX as usize + 1],
    /// Bumped whenever a child turns into a zombie.
    pub child_exit: Arc<Notification>,
}

impl Process {
    pub fn new(pid: Pid, parent: Option<Pid>, space: Arc<AddressSpace>) -> Self {
        Self {
            pid,
            parent,
            children: Vec::new(),
            threads: Vec::new(),
            space,
            files: FileTable::new(),
            credentials: Credentials::ROOT,
            pgid: pid,
            state: ProcessState::Alive,
            actions: [SigAction::default(); Signal::MAX as usize + 1],
            child_exit: Arc::new(Notification::new()),
        }
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self.state, ProcessState::Zombie(_))
    }

    pub fn action(&self, signal: Signal) -> &SigAction {
        &self.actions[usize::from(signal.number())]
    }

    /// Resets caught signals to their default disposition; ignored signals stay ignored.
    pub fn reset_handlers(&mut self) {
        for action in &mut self.actions {
            if matches!(action.handler, crate::SigHandler::Handler(_)) {
                *action = SigAction::default();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_encoding() {
        assert_eq!(ExitStatus::Exited(3).wait_status(), 0x300);
        assert_eq!(ExitStatus::Exited(-1).wait_status(), 0xFF00);
        assert_eq!(ExitStatus::Signaled(Signal::SIGKILL).wait_status(), 9);
    }

    #[test]
    fn root_may_signal_anyone() {
        let user = Credentials { uid: 1000, gid: 1000 };
        let other = Credentials { uid: 1001, gid: 1000 };
        assert!(Credentials::ROOT.may_signal(&user));
        assert!(user.may_signal(&user));
        assert!(!user.may_signal(&other));
    }
}
