//! Single-waiter notification objects.
//!
//! A producer bumps the value and wakes the registered waiter; the waiter
//! consumes the value once it runs again. Only one thread may wait on an
//! object at a time. Multi-object waits register the same thread on several
//! objects and look at which value moved after waking.

use ksync::IrqSpinlock;

use crate::{Errno, ThreadHandle};

/// Something that can make a blocked thread runnable again.
pub trait Waker {
    fn wake(&self, thread: ThreadHandle);
}

#[derive(Debug, Default)]
struct State {
    value: u64,
    waiter: Option<ThreadHandle>,
}

#[derive(Debug, Default)]
pub struct Notification {
    state: IrqSpinlock<State>,
}

impl Notification {
    pub const fn new() -> Self {
        Self {
            state: IrqSpinlock::new(State {
                value: 0,
                waiter: None,
            }),
        }
    }

    /// # Panics
    ///
    /// Panics if a different thread is already waiting.
    pub fn register(&self, thread: ThreadHandle) {
        let mut state = self.state.lock();
        match state.waiter {
            Some(waiter) if waiter != thread => {
                panic!("notification already has a waiter ({waiter:?}, {thread:?} tried to wait)")
            }
            _ => state.waiter = Some(thread),
        }
    }

    /// Like [`register`](Self::register), for waits user space asked for:
    /// a second waiter gets `EBUSY` instead of bringing the kernel down.
    pub fn try_register(&self, thread: ThreadHandle) -> Result<(), Errno> {
        let mut state = self.state.lock();
        match state.waiter {
            Some(waiter) if waiter != thread => Err(Errno::EBUSY),
            _ => {
                state.waiter = Some(thread);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, thread: ThreadHandle) {
        let mut state = self.state.lock();
        if state.waiter == Some(thread) {
            state.waiter = None;
        }
    }

    pub fn waiter(&self) -> Option<ThreadHandle> {
        self.state.lock().waiter
    }

    /// Increments the value and wakes the waiter, if any.
    pub fn signal(&self, waker: &dyn Waker) {
        let waiter = {
            let mut state = self.state.lock();
            state.value += 1;
            state.waiter
        };
        if let Some(thread) = waiter {
            waker.wake(thread);
        }
    }

    pub fn value(&self) -> u64 {
        self.state.lock().value
    }

    /// Takes the whole value, leaving zero.
    pub fn consume(&self) -> u64 {
        core::mem::take(&mut self.state.lock().value)
    }
}
