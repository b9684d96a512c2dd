//! What the kernel needs to know about the machine's processors and
//! interrupt hardware.

use alloc::vec::Vec;

use bootinfo::BootInfo;
use irq::InterruptSourceOverride;

#[derive(Debug, Clone, Copy)]
pub struct IoApicInfo {
    pub id: u8,
    pub address: u64,
    pub gsi_base: u32,
}

#[derive(Debug, Clone)]
pub struct Platform {
    pub lapic_address: u64,
    pub io_apics: Vec<IoApicInfo>,
    pub overrides: Vec<InterruptSourceOverride>,
    /// APIC IDs of the usable application processors, in MADT order.
    pub application_processors: Vec<u8>,
}

impl Platform {
    /// A lone bootstrap processor with only the legacy PIC.
    pub fn uniprocessor(lapic_address: u64) -> Self {
        Self {
            lapic_address,
            io_apics: Vec::new(),
            overrides: Vec::new(),
            application_processors: Vec::new(),
        }
    }

    pub fn cpu_count(&self) -> usize {
        1 + self.application_processors.len()
    }

    pub fn has_io_apic(&self) -> bool {
        !self.io_apics.is_empty()
    }
}

/// Reads the MADT when ACPI support is built in and the loader found an
/// RSDP; falls back to a uniprocessor PIC machine otherwise.
pub fn discover(boot_info: &BootInfo, lapic_address: u64) -> Platform {
    #[cfg(feature = "acpi")]
    if boot_info.rsdp != 0 {
        match crate::acpi::discover(boot_info.rsdp) {
            Ok(platform) => return platform,
            Err(err) => log::warn!("{err}; assuming a uniprocessor PIC machine"),
        }
    }
    #[cfg(not(feature = "acpi"))]
    let _ = boot_info;
    Platform::uniprocessor(lapic_address)
}
