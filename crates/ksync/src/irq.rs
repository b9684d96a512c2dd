//! Saving and restoring the local interrupt flag.

use core::marker::PhantomData;

#[cfg(all(target_arch = "x86_64", not(any(test, feature = "software-emulation"))))]
mod flag {
    use x86_64::instructions::interrupts;

    #[inline]
    pub fn get() -> bool {
        interrupts::are_enabled()
    }

    #[inline]
    pub fn set(enabled: bool) {
        if enabled {
            interrupts::enable();
        } else {
            interrupts::disable();
        }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
mod flag {
    use core::cell::Cell;

    std::thread_local! {
        static INTERRUPT_FLAG: Cell<bool> = const { Cell::new(true) };
    }

    pub fn get() -> bool {
        INTERRUPT_FLAG.with(Cell::get)
    }

    pub fn set(enabled: bool) {
        INTERRUPT_FLAG.with(|f| f.set(enabled));
    }
}

/// Returns whether interrupts are currently enabled on this CPU.
#[inline]
pub fn interrupts_enabled() -> bool {
    flag::get()
}

/// Enables interrupts on this CPU.
///
/// # Safety
///
/// The caller must not hold any lock that an interrupt handler may take.
#[inline]
pub unsafe fn enable() {
    flag::set(true);
}

/// Disables interrupts on this CPU.
#[inline]
pub fn disable() {
    flag::set(false);
}

/// Disables interrupts for its lifetime and restores the previous state on drop.
///
/// Guards nest: only the outermost guard re-enables interrupts, because inner
/// guards observe the flag already cleared.
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct IrqGuard {
    was_enabled: bool,
    // The saved flag belongs to this CPU; the guard must not migrate.
    _not_send: PhantomData<*mut ()>,
}

impl IrqGuard {
    pub fn new() -> Self {
        let was_enabled = flag::get();
        if was_enabled {
            flag::set(false);
        }
        Self {
            was_enabled,
            _not_send: PhantomData,
        }
    }

    /// Returns whether interrupts were enabled when this guard was taken.
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            flag::set(true);
        }
    }
}

/// Runs `f` with interrupts disabled, restoring the previous state afterwards.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_disables_and_restores() {
        assert!(interrupts_enabled());
        {
            let guard = IrqGuard::new();
            assert!(guard.was_enabled());
            assert!(!interrupts_enabled());
        }
        assert!(interrupts_enabled());
    }

    #[test]
    fn nested_guards_restore_only_at_outermost() {
        let outer = IrqGuard::new();
        let inner = IrqGuard::new();
        assert!(!inner.was_enabled());
        drop(inner);
        assert!(!interrupts_enabled());
        drop(outer);
        assert!(interrupts_enabled());
    }

    #[test]
    fn guard_taken_with_interrupts_off_leaves_them_off() {
        disable();
        {
            let _guard = IrqGuard::new();
        }
        assert!(!interrupts_enabled());
        unsafe { enable() };
    }

    #[test]
    fn without_interrupts_returns_value() {
        let value = without_interrupts(|| {
            assert!(!interrupts_enabled());
            42
        });
        assert_eq!(value, 42);
        assert!(interrupts_enabled());
    }
}
