#![cfg_attr(not(test), no_std)]

//! # Tern interrupt routing
//!
//! Hardware-independent interrupt plumbing for the kernel:
//!
//! - The vector map and a bitmap allocator for device vectors.
//! - Shared-vector handler chains and the GSI router that owns them.
//! - The legacy 8259 PIC and I/O APIC redirection programming.
//! - MSI vector allocation and message composition.
//! - PCI configuration access and `_PRT`-style pin routing.
//! - Local APIC command encoding and application-processor startup.
//!
//! Register access is always behind a trait ([`PortIo`], [`IoApicRegisters`],
//! [`LocalApic`]) so the kernel supplies the MMIO and port implementations and
//! tests supply fakes.

extern crate alloc;

mod controller;
mod handlers;
mod ioapic;
mod ipi;
mod msi;
mod pci;
mod pic;
mod port;
mod router;
mod vector;

pub use controller::IrqController;
pub use handlers::{Dispatch, Handler, HandlerChain, HandlerTable, IrqReturn, MAX_SHARED};
pub use ioapic::{
    DeliveryMode, IOREGSEL, IOWIN, InterruptSourceOverride, IoApic, IoApicController,
    IoApicRegisters, Polarity, RedirectionEntry, RedirectionFlags, TriggerMode,
};
pub use ipi::{
    Destination, INIT_DELAY_US, IpiCommand, LocalApic, STARTUP_DELAY_US,
    STARTUP_PARAMETERS_ADDRESS, StartupError, StartupParameters, TRAMPOLINE_ADDRESS,
    offsets as startup_offsets, start_processor,
};
pub use msi::{MsiMessage, MsiTable};
pub use pci::{
    CONFIG_ADDRESS, CONFIG_DATA, PciAddress, PciConfigSpace, PciIrq, PciPin, PciRoute,
    PciRoutingTable, PinRoute, RouteTarget, RoutingError,
};
pub use pic::{PIC_IRQS, Pic8259};
pub use port::{PortIo, WidthError, read_port, write_port};
pub use router::IrqRouter;
pub use vector::{
    IRQ_VECTOR_BASE, IRQ_VECTORS, LEGACY_VECTOR_BASE, LEGACY_VECTORS, MSI_VECTOR_BASE,
    MSI_VECTORS, SPURIOUS_VECTOR, SYSCALL_VECTOR, TIMER_VECTOR, VectorAllocator, YIELD_VECTOR,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IrqError {
    #[error("no free interrupt vector")]
    Exhausted,
    #[error("too many handlers share GSI {0}")]
    SharedLineFull(u32),
    #[error("no interrupt controller input for GSI {0}")]
    NoRoute(u32),
}
