use x86_64::{
    PrivilegeLevel, VirtAddr,
    structures::idt::InterruptDescriptorTable,
};

use irq::{SYSCALL_VECTOR, YIELD_VECTOR};
use sched::RegisterFrame;

use super::gdt::{DOUBLE_FAULT_IST_INDEX, NMI_IST_INDEX};

mod stubs;

static IDT: spin::Once<InterruptDescriptorTable> = spin::Once::new();

unsafe extern "C" {
    static isr_stubs: [u8; 256 * stubs::STUB_SIZE];
}

fn stub(vector: usize) -> VirtAddr {
    VirtAddr::from_ptr(&raw const isr_stubs) + (vector * stubs::STUB_SIZE) as u64
}

/// One table shared by every CPU; every gate points at its trap stub.
pub fn idt() -> &'static InterruptDescriptorTable {
    IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: each stub is a valid trap entry for its vector, and the IST
        // indices have stacks in every CPU's TSS.
        unsafe {
            idt.divide_error.set_handler_addr(stub(0));
            idt.debug.set_handler_addr(stub(1));
            idt.non_maskable_interrupt
                .set_handler_addr(stub(2))
                .set_stack_index(NMI_IST_INDEX);
            idt.breakpoint
                .set_handler_addr(stub(3))
                .set_privilege_level(PrivilegeLevel::Ring3);
            idt.overflow.set_handler_addr(stub(4));
            idt.bound_range_exceeded.set_handler_addr(stub(5));
            idt.invalid_opcode.set_handler_addr(stub(6));
            idt.device_not_available.set_handler_addr(stub(7));
            idt.double_fault
                .set_handler_addr(stub(8))
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.invalid_tss.set_handler_addr(stub(10));
            idt.segment_not_present.set_handler_addr(stub(11));
            idt.stack_segment_fault.set_handler_addr(stub(12));
            idt.general_protection_fault.set_handler_addr(stub(13));
            idt.page_fault.set_handler_addr(stub(14));
            idt.x87_floating_point.set_handler_addr(stub(16));
            idt.alignment_check.set_handler_addr(stub(17));
            idt.machine_check.set_handler_addr(stub(18));
            idt.simd_floating_point.set_handler_addr(stub(19));
            idt.virtualization.set_handler_addr(stub(20));
            idt.cp_protection_exception.set_handler_addr(stub(21));
            idt.hv_injection_exception.set_handler_addr(stub(28));
            idt.vmm_communication_exception.set_handler_addr(stub(29));
            idt.security_exception.set_handler_addr(stub(30));

            for vector in 32..=u8::MAX {
                let options = idt[vector].set_handler_addr(stub(usize::from(vector)));
                if vector == SYSCALL_VECTOR {
                    options.set_privilege_level(PrivilegeLevel::Ring3);
                }
            }
        }
        idt
    })
}

/// Gives up the CPU from kernel code. Returns once the scheduler picks the
/// calling thread again.
pub fn yield_now() {
    // SAFETY: the yield gate saves and restores the full register file.
    unsafe { core::arch::asm!("int {vector}", vector = const YIELD_VECTOR) };
}

#[unsafe(no_mangle)]
extern "C" fn trap_dispatch(frame: *mut RegisterFrame) -> *mut RegisterFrame {
    crate::interrupts::dispatch(frame)
}

#[unsafe(no_mangle)]
extern "C" fn trap_canary_smashed(frame: &RegisterFrame) -> ! {
    frame.check_canary();
    panic!("stack canary corrupted below the frame at {:p}", frame);
}
