//! Hardware paging operations.

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress};

/// Loads `root` into CR3.
///
/// # Safety
///
/// `root` must be a PML4 that maps the currently executing code and stack.
pub unsafe fn activate(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

/// Returns the PML4 currently loaded in CR3.
pub fn active_root() -> PhysicalAddress {
    let (frame, _) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64() as usize)
}

/// Invalidates the local TLB entry for one page.
pub fn flush(virt: VirtualAddress) {
    tlb::flush(VirtAddr::new(virt.as_usize() as u64));
}

/// Invalidates every non-global TLB entry on this CPU.
pub fn flush_all() {
    tlb::flush_all();
}
