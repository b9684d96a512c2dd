//! A spinlock that masks local interrupts while held.

use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::IrqGuard;

/// A spinlock that disables interrupts on the local CPU for as long as it is held.
///
/// The interrupt flag is saved before the lock is acquired and restored only
/// after the lock has been released, so a handler can never observe the lock
/// held by the context it interrupted.
pub struct IrqSpinlock<T: ?Sized> {
    inner: spin::Mutex<T>,
}

/// Guard returned by [`IrqSpinlock::lock`].
pub struct IrqSpinlockGuard<'a, T: ?Sized + 'a> {
    // Field order matters: the lock is released before the interrupt flag is restored.
    guard: spin::MutexGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> IrqSpinlock<T> {
    /// Disables interrupts, then spins until the lock is acquired.
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let irq = IrqGuard::new();
        IrqSpinlockGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<IrqSpinlockGuard<'_, T>> {
        let irq = IrqGuard::new();
        self.inner.try_lock().map(|guard| IrqSpinlockGuard { guard, _irq: irq })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for IrqSpinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for IrqSpinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqSpinlock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
