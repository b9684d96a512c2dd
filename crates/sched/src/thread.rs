//! Thread control blocks and their kernel stacks.

use alloc::{boxed::Box, vec::Vec};

use crate::{Pid, RegisterFrame, SignalSet};

pub type Tid = u32;

/// Size of every thread's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On exactly one CPU's ready queue.
    Ready,
    /// Current on a CPU.
    Running,
    /// Sleeping or waiting on notifications; on no queue.
    Blocked,
    /// Exited; waits for the parent to reap the process.
    Stopped,
}

/// A kernel stack. The trap stub saves the interrupted context on it, so the
/// saved stack pointer of a descheduled thread always lies inside it.
pub struct KernelStack {
    words: Box<[u64]>,
}

impl KernelStack {
    pub fn new() -> Self {
        Self {
            words: alloc::vec![0u64; KERNEL_STACK_SIZE / 8].into_boxed_slice(),
        }
    }

    pub fn bottom(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// Initial stack pointer, 16-byte aligned.
    pub fn top(&self) -> usize {
        (self.bottom() + KERNEL_STACK_SIZE) & !0xF
    }

    pub fn contains(&self, sp: usize) -> bool {
        (self.bottom()..=self.top()).contains(&sp)
    }

    /// Writes `frame` just below the top and returns its address, ready to
    /// be popped by the return path.
    pub fn push_frame(&mut self, frame: RegisterFrame) -> usize {
        let slot = (self.top() - size_of::<RegisterFrame>()) & !0xF;
        // SAFETY: the frame fits in the stack and `slot` is aligned.
        unsafe { (slot as *mut RegisterFrame).write(frame) };
        slot
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KernelStack({:#x}..{:#x})", self.bottom(), self.top())
    }
}

#[derive(Debug)]
pub struct Thread {
    pub tid: Tid,
    pub pid: Pid,
    pub state: ThreadState,
    /// The CPU whose queue the thread joins when it becomes ready.
    pub cpu: usize,
    pub pending: SignalSet,
    pub blocked: SignalSet,
    pub(crate) stack: KernelStack,
    /// Address of the saved [`RegisterFrame`] while descheduled.
    pub(crate) saved_sp: usize,
    /// Set when a wake arrives while the thread is still running, so a
    /// subsequent block returns immediately instead of losing the wake.
    pub(crate) wakeup_pending: bool,
    /// Whether a CPU is still executing on this thread's kernel stack.
    pub(crate) on_cpu: bool,
    /// Interrupted frames of running signal handlers, with the blocked set to restore.
    pub(crate) signal_frames: Vec<(RegisterFrame, SignalSet)>,
    pub(crate) idle: bool,
}

impl Thread {
    /// `build_frame` receives the top of the new kernel stack.
    pub(crate) fn new(tid: Tid, pid: Pid, build_frame: impl FnOnce(usize) -> RegisterFrame) -> Self {
        let mut stack = KernelStack::new();
        let frame = build_frame(stack.top());
        let saved_sp = stack.push_frame(frame);
        Self {
            tid,
            pid,
            state: ThreadState::Ready,
            cpu: 0,
            pending: SignalSet::EMPTY,
            blocked: SignalSet::EMPTY,
            stack,
            saved_sp,
            wakeup_pending: false,
            on_cpu: false,
            signal_frames: Vec::new(),
            idle: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn kernel_stack_top(&self) -> usize {
        self.stack.top()
    }

    /// Signals that are pending and not blocked. SIGKILL and SIGSTOP are
    /// never blocked.
    pub fn deliverable(&self) -> SignalSet {
        self.pending.difference(self.blocked)
    }

    /// Records the frame the trap stub saved at `sp`.
    ///
    /// # Panics
    ///
    /// Panics if `sp` is not on this thread's kernel stack.
    pub(crate) fn save_context(&mut self, sp: usize) {
        assert!(
            self.stack.contains(sp),
            "saved frame {sp:#x} of thread {} is outside its kernel stack {:?}",
            self.tid,
            self.stack
        );
        self.saved_sp = sp;
    }

    pub fn frame(&self) -> &RegisterFrame {
        // SAFETY: `saved_sp` always points at a frame on this thread's own stack.
        unsafe { &*(self.saved_sp as *const RegisterFrame) }
    }

    pub fn frame_mut(&mut self) -> &mut RegisterFrame {
        // SAFETY: as in `frame`; `&mut self` makes the access exclusive.
        unsafe { &mut *(self.saved_sp as *mut RegisterFrame) }
    }
}
