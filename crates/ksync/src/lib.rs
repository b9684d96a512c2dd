#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Kernel synchronization primitives
//!
//! Every lock that kernel code can take from both thread context and an
//! interrupt handler must mask interrupts on the local CPU for as long as it is
//! held, otherwise a handler that fires on the same CPU spins on a lock its own
//! interrupted context owns. This crate provides:
//!
//! - [`IrqGuard`]: saves the interrupt flag, disables interrupts, restores on drop.
//! - [`IrqSpinlock`]: a `spin::Mutex` whose guard also holds an [`IrqGuard`].
//!
//! Under `test` or the `software-emulation` feature the interrupt flag is a
//! per-thread emulated bit so the primitives can be exercised on a host.

mod irq;
mod spinlock;

pub use irq::{IrqGuard, interrupts_enabled, without_interrupts};
pub use spinlock::{IrqSpinlock, IrqSpinlockGuard};

/// Raw interrupt flag control, for the few call sites (idle loop, context
/// switch) that must manipulate it without a guard.
pub mod raw {
    pub use crate::irq::{disable, enable};
}
