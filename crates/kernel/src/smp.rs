//! Application processor bring-up.
//!
//! Processors are started one at a time through a single parameter block
//! at [`STARTUP_PARAMETERS_ADDRESS`]. Each AP copies what it needs out of
//! the block and reports ready before the next one is woken.

use alloc::vec;

use irq::{
    IpiCommand, LocalApic, STARTUP_PARAMETERS_ADDRESS, StartupParameters, TRAMPOLINE_ADDRESS,
    start_processor,
};
use mm::{AddressTranslator, PhysicalAddress, VirtualAddress};

use crate::{Kernel, arch, mem};

const AP_BOOT_STACK_SIZE: usize = 16 * 1024;
/// Polls of 10 µs each: 100 ms for an AP to report ready.
const READY_POLLS: u32 = 10_000;
/// The trampoline loads CR3 while still in 32-bit mode.
const TRAMPOLINE_CR3_LIMIT: u64 = 1 << 32;

pub fn start_application_processors(kernel: &'static Kernel, apic_ids: &[u8]) {
    if apic_ids.is_empty() {
        return;
    }
    let root = kernel.kernel_space.root();
    if root.as_u64() >= TRAMPOLINE_CR3_LIMIT {
        log::error!("kernel page tables at {root} are out of the trampoline's reach");
        for cpu in 1..=apic_ids.len() {
            kernel.scheduler.set_offline(cpu);
        }
        return;
    }

    let low_pages = [TRAMPOLINE_ADDRESS, STARTUP_PARAMETERS_ADDRESS]
        .map(|addr| PhysicalAddress::new(addr as usize));
    let mapped = low_pages.map(|page| mem::identity_map_low(kernel.mm, &kernel.kernel_space, page));

    let translator = AddressTranslator::current();
    let code = arch::trampoline_code();
    // SAFETY: the trampoline page is below 1 MiB, which the frame allocator
    // never hands out, and no AP is running from it yet.
    unsafe {
        core::ptr::copy_nonoverlapping(
            code.as_ptr(),
            translator.phys_to_ptr::<u8>(low_pages[0]),
            code.len(),
        );
    }
    let block = translator.phys_to_ptr::<StartupParameters>(low_pages[1]);
    let ((gdt_base, gdt_limit), (idt_base, idt_limit)) = arch::descriptor_tables();

    let mut lapic = kernel.lapic;
    for (i, &apic_id) in apic_ids.iter().enumerate() {
        let cpu = i + 1;
        let stack = vec![0u8; AP_BOOT_STACK_SIZE].leak();
        let stack_top = (stack.as_ptr() as u64 + AP_BOOT_STACK_SIZE as u64) & !0xF;

        // SAFETY: the block is reserved low memory, and the previous AP
        // stopped reading it when it reported ready.
        let params = unsafe {
            block.write(StartupParameters {
                cpu_index: cpu as u32,
                page_table_root: root.as_u64(),
                stack_top,
                entry: crate::ap_main as usize as u64,
                gdt_base,
                idt_base,
                gdt_limit,
                idt_limit,
                ..Default::default()
            });
            &*block
        };

        match start_processor(&mut lapic, apic_id, params, READY_POLLS) {
            Ok(()) => log::debug!("CPU {cpu}: started with APIC ID {apic_id}"),
            Err(err) => {
                log::error!("{err}, CPU {cpu} stays offline");
                // Back into wait-for-SIPI, so a late start cannot pick up
                // the next processor's parameters.
                lapic.send_ipi(IpiCommand::init(apic_id));
                kernel.scheduler.set_offline(cpu);
            }
        }
    }

    for (page, mapped) in low_pages.into_iter().zip(mapped) {
        if mapped {
            kernel
                .kernel_space
                .unmap_single(kernel.mm, VirtualAddress::new(page.as_usize()));
        }
    }
}
