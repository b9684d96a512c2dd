#[cfg(target_arch = "x86_64")]
pub(crate) mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

/// Stops the calling CPU for good.
pub fn park() -> ! {
    disable_interrupts();
    loop {
        // SAFETY: with interrupts off only an NMI can wake the CPU, and the
        // NMI path parks again.
        unsafe { core::arch::asm!("hlt") };
    }
}
