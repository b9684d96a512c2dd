use bootinfo::BootInfo;
use x86_64::{
    instructions::tables::{sgdt, sidt},
    registers::control::Cr2,
};

mod apic;
mod gdt;
mod interrupts;
mod percpu;
mod pit;
mod port;
mod trampoline;

pub use apic::{Lapic, MmioIoApic, lapic_physical_base};
pub use interrupts::yield_now;
pub use percpu::PerCpu;
pub use port::Ports;
pub use trampoline::trampoline_code;

/// The architecture-specific entry point.
///
/// The loader enters here on its own stack, with interrupts disabled and the
/// boot info pointer (a direct-mapped address) in `rdi`.
#[unsafe(no_mangle)]
pub extern "C" fn kenter(boot_info: *const BootInfo) -> ! {
    crate::kernel_main(boot_info)
}

/// Loads the calling CPU's GDT, TSS and the shared IDT, and points GS at
/// its per-CPU data.
pub fn init_cpu(index: usize, apic_id: u8) -> &'static PerCpu {
    let cpu = PerCpu::install(index, apic_id);
    interrupts::idt().load();
    cpu
}

/// Enables interrupts and halts until the next one arrives.
pub fn wait_for_interrupt() {
    x86_64::instructions::interrupts::enable_and_hlt();
}

pub fn disable_interrupts() {
    x86_64::instructions::interrupts::disable();
}

/// The faulting linear address of the last page fault on this CPU.
pub fn page_fault_address() -> u64 {
    Cr2::read_raw()
}

/// The caller's frame pointer.
#[inline(always)]
pub fn frame_pointer() -> usize {
    let rbp: usize;
    // SAFETY: reads a register.
    unsafe { core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags)) };
    rbp
}

/// The calling CPU's GDTR and IDTR as `(base, limit)` pairs.
pub fn descriptor_tables() -> ((u64, u16), (u64, u16)) {
    let gdt = sgdt();
    let idt = sidt();
    ((gdt.base.as_u64(), gdt.limit), (idt.base.as_u64(), idt.limit))
}
