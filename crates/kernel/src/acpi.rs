use core::ptr::NonNull;

use acpi::{
    AcpiError, AcpiHandler, AcpiTables, PhysicalMapping,
    platform::{
        ProcessorState,
        interrupt::{InterruptModel, Polarity as AcpiPolarity, TriggerMode as AcpiTriggerMode},
    },
};
use irq::{InterruptSourceOverride, Polarity, TriggerMode};
use mm::{AddressTranslator, PhysicalAddress};

use crate::platform::{IoApicInfo, Platform};

/// Reaches ACPI tables through the direct map.
#[derive(Clone)]
struct AddressTranslatorHandler(&'static AddressTranslator);

impl core::fmt::Debug for AddressTranslatorHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressTranslatorHandler").finish()
    }
}

impl AcpiHandler for AddressTranslatorHandler {
    unsafe fn map_physical_region<T>(
        &self,
        physical_address: usize,
        size: usize,
    ) -> PhysicalMapping<Self, T> {
        let virt = self.0.phys_to_ptr::<T>(PhysicalAddress::new(physical_address));
        let Some(virt) = NonNull::new(virt) else {
            panic!("ACPI table at {physical_address:#x} has no direct-mapped alias");
        };
        unsafe { PhysicalMapping::new(physical_address, virt, size, size, self.clone()) }
    }

    fn unmap_physical_region<T>(_region: &PhysicalMapping<Self, T>) {
        // The direct map is permanent.
    }
}

fn polarity(p: AcpiPolarity) -> Polarity {
    match p {
        AcpiPolarity::SameAsBus => Polarity::ConformsToBus,
        AcpiPolarity::ActiveHigh => Polarity::ActiveHigh,
        AcpiPolarity::ActiveLow => Polarity::ActiveLow,
    }
}

fn trigger(t: AcpiTriggerMode) -> TriggerMode {
    match t {
        AcpiTriggerMode::SameAsBus => TriggerMode::ConformsToBus,
        AcpiTriggerMode::Edge => TriggerMode::Edge,
        AcpiTriggerMode::Level => TriggerMode::Level,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("ACPI tables unreadable: {0:?}")]
    Tables(AcpiError),
    #[error("the MADT describes no APIC interrupt model")]
    NoApic,
}

impl From<AcpiError> for DiscoveryError {
    fn from(err: AcpiError) -> Self {
        Self::Tables(err)
    }
}

/// Collects I/O APICs, ISA overrides and processors from the MADT.
pub fn discover(rsdp: u64) -> Result<Platform, DiscoveryError> {
    // SAFETY: the loader hands over the physical address of a valid RSDP.
    let tables = unsafe {
        AcpiTables::from_rsdp(
            AddressTranslatorHandler(AddressTranslator::current()),
            rsdp as usize,
        )?
    };
    let info = tables.platform_info()?;

    let InterruptModel::Apic(apic) = info.interrupt_model else {
        return Err(DiscoveryError::NoApic);
    };

    let mut platform = Platform::uniprocessor(apic.local_apic_address);
    platform.io_apics = apic
        .io_apics
        .iter()
        .map(|io| IoApicInfo {
            id: io.id,
            address: u64::from(io.address),
            gsi_base: io.global_system_interrupt_base,
        })
        .collect();
    platform.overrides = apic
        .interrupt_source_overrides
        .iter()
        .map(|o| InterruptSourceOverride {
            isa_irq: o.isa_source,
            gsi: o.global_system_interrupt,
            polarity: polarity(o.polarity),
            trigger: trigger(o.trigger_mode),
        })
        .collect();

    if let Some(processors) = info.processor_info {
        platform.application_processors = processors
            .application_processors
            .iter()
            .filter(|p| p.state != ProcessorState::Disabled)
            .filter_map(|p| u8::try_from(p.local_apic_id).ok())
            .collect();
    }

    log::info!(
        "ACPI: {} CPUs, {} I/O APICs, {} ISA overrides",
        platform.cpu_count(),
        platform.io_apics.len(),
        platform.overrides.len()
    );
    Ok(platform)
}
