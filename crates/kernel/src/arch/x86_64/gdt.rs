//! Segment descriptors and the task-state segment.
//!
//! The descriptor order is fixed so the selectors match the ones the
//! scheduler writes into fresh register frames.

use alloc::vec;

use sched::{KERNEL_CS, KERNEL_DS, USER_CS, USER_DS};
use x86_64::{
    VirtAddr,
    instructions::tables::load_tss,
    registers::segmentation::{CS, DS, ES, SS, Segment},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const NMI_IST_INDEX: u16 = 1;
const IST_STACK_SIZE: usize = 4096 * 5;

pub struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
}

/// Gives the TSS its own stacks for double faults and NMIs.
pub fn init_tss(tss: &mut TaskStateSegment) {
    for index in [DOUBLE_FAULT_IST_INDEX, NMI_IST_INDEX] {
        let stack = vec![0u8; IST_STACK_SIZE].leak();
        let start = VirtAddr::from_ptr(stack.as_ptr());
        tss.interrupt_stack_table[index as usize] = (start + IST_STACK_SIZE as u64).align_down(16u64);
    }
}

/// Builds a GDT whose TSS descriptor points at `tss`.
///
/// # Safety
///
/// `tss` must stay valid and at the same address for as long as the GDT is
/// loaded on any CPU.
pub unsafe fn build(tss: *const TaskStateSegment) -> (GlobalDescriptorTable, Selectors) {
    let mut gdt = GlobalDescriptorTable::new();
    let kernel_code = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data = gdt.append(Descriptor::kernel_data_segment());
    let user_data = gdt.append(Descriptor::user_data_segment());
    let user_code = gdt.append(Descriptor::user_code_segment());
    let tss = gdt.append(unsafe { Descriptor::tss_segment_unchecked(tss) });

    assert_eq!(u64::from(kernel_code.0), KERNEL_CS, "kernel code selector moved");
    assert_eq!(u64::from(kernel_data.0), KERNEL_DS, "kernel data selector moved");
    assert_eq!(u64::from(user_data.0), USER_DS, "user data selector moved");
    assert_eq!(u64::from(user_code.0), USER_CS, "user code selector moved");

    (
        gdt,
        Selectors {
            kernel_code,
            kernel_data,
            tss,
        },
    )
}

/// Loads `gdt` and reloads every segment register from it.
///
/// # Safety
///
/// `selectors` must come from [`build`] for this `gdt`.
pub unsafe fn load(gdt: &'static GlobalDescriptorTable, selectors: &Selectors) {
    gdt.load();
    unsafe {
        CS::set_reg(selectors.kernel_code);
        SS::set_reg(selectors.kernel_data);
        DS::set_reg(selectors.kernel_data);
        ES::set_reg(selectors.kernel_data);
        load_tss(selectors.tss);
    }
}
