#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Tern Scheduler
//!
//! Threads, processes and everything that decides which of them runs:
//!
//! - Per-CPU ready queues with round-robin preemption and per-CPU idle threads.
//! - Process trees with fork, exit, zombies and `wait4`.
//! - POSIX-style signals, including user handlers and `sigreturn`.
//! - Notification objects for blocking waits with deadlines.
//! - Per-process descriptor tables over block and character devices.
//! - The system-call table.
//!
//! Nothing here touches hardware. The kernel saves a [`RegisterFrame`] on the
//! current thread's kernel stack, calls [`Scheduler::schedule`] and resumes
//! whatever stack pointer comes back.

extern crate alloc;

mod arena;
mod device;
mod errno;
mod files;
mod frame;
mod notification;
mod process;
mod scheduler;
mod signal;
mod syscall;
mod thread;
pub mod uaccess;
mod user_stack;

pub use arena::{Arena, Handle};
pub use device::{BlockDevice, CharDevice, Device, RamDisk, RingBuffer};
pub use errno::Errno;
pub use files::{Fd, FdError, FileTable, MAX_FILES, OpenFile, OpenFlags};
pub use frame::{
    GPR_OFFSET, IRET_OFFSET, KERNEL_CS, KERNEL_DS, RegisterFrame, STACK_CANARY, USER_CS, USER_DS,
};
pub use notification::{Notification, Waker};
pub use process::{Credentials, ExitStatus, INIT_PID, KERNEL_PID, Pid, Process, ProcessState};
pub use scheduler::{Scheduler, Switch, WaitOptions, WaitOutcome, WaitPid};
pub use signal::{DefaultAction, Delivery, SigAction, SigHandler, Signal, SignalSet, resolve};
pub use syscall::{
    MMAP_REGION_START, NO_TIMEOUT, SYSCALL_COUNT, SyscallContext, SyscallHandler, SyscallTable,
    nr, prot,
};
pub use thread::{KERNEL_STACK_SIZE, KernelStack, Thread, ThreadState, Tid};
pub use user_stack::{STACK_REGION_START, UserStack, build_user_stack};

/// Identifies a thread in the scheduler's table.
pub type ThreadHandle = Handle;
