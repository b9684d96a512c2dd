//! Per-CPU data reached through the GS base.
//!
//! Kernel code always runs with GS pointing at its CPU's [`PerCpu`]; the
//! trap stubs `swapgs` on every transition to and from ring 3.

use alloc::boxed::Box;
use core::{
    arch::asm,
    cell::UnsafeCell,
    sync::atomic::{AtomicU64, Ordering},
};

use x86_64::{
    VirtAddr,
    registers::model_specific::{GsBase, KernelGsBase},
    structures::{gdt::GlobalDescriptorTable, tss::TaskStateSegment},
};

use super::gdt;

#[repr(C, align(64))]
pub struct PerCpu {
    /// Points back at this structure so `gs:[0]` yields it.
    this: *const PerCpu,
    index: usize,
    apic_id: u8,
    ticks: AtomicU64,
    tss: UnsafeCell<TaskStateSegment>,
    gdt: GlobalDescriptorTable,
}

// SAFETY: the TSS is only written by the CPU that owns the structure.
unsafe impl Sync for PerCpu {}

impl PerCpu {
    /// Creates the structure for the calling CPU, loads its GDT and TSS and
    /// points GS at it. Runs once per CPU.
    pub fn install(index: usize, apic_id: u8) -> &'static PerCpu {
        let cpu: &'static mut PerCpu = Box::leak(Box::new(PerCpu {
            this: core::ptr::null(),
            index,
            apic_id,
            ticks: AtomicU64::new(0),
            tss: UnsafeCell::new(TaskStateSegment::new()),
            gdt: GlobalDescriptorTable::new(),
        }));
        cpu.this = cpu as *const PerCpu;
        gdt::init_tss(cpu.tss.get_mut());

        // SAFETY: the TSS is leaked together with the GDT that refers to it.
        let (table, selectors) = unsafe { gdt::build(cpu.tss.get()) };
        cpu.gdt = table;

        let cpu: &'static PerCpu = cpu;
        // SAFETY: the selectors were built for this table.
        unsafe { gdt::load(&cpu.gdt, &selectors) };
        GsBase::write(VirtAddr::from_ptr(cpu));
        KernelGsBase::write(VirtAddr::zero());
        log::debug!("CPU {index}: per-CPU data at {:p}", cpu);
        cpu
    }

    /// The calling CPU's structure.
    ///
    /// Only valid after [`install`](Self::install) ran on this CPU.
    pub fn current() -> &'static PerCpu {
        let this: *const PerCpu;
        // SAFETY: GS points at an installed, leaked `PerCpu` in kernel mode.
        unsafe {
            asm!("mov {}, gs:[0]", out(reg) this, options(nostack, preserves_flags, readonly));
            &*this
        }
    }

    pub fn try_current() -> Option<&'static PerCpu> {
        (!GsBase::read().is_null()).then(Self::current)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn apic_id(&self) -> u8 {
        self.apic_id
    }

    /// Counts one timer tick and returns the new total.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The stack the CPU switches to on a trap from ring 3.
    pub fn set_kernel_stack(&self, top: u64) {
        // SAFETY: only this CPU touches its TSS, with interrupts disabled.
        unsafe { (*self.tss.get()).privilege_stack_table[0] = VirtAddr::new(top) };
    }
}
