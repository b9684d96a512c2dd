//! Services device drivers and the ACPI interpreter call back into: port
//! and PCI configuration access, interrupt handler installation and a
//! monotonic clock.

use alloc::vec::Vec;
use core::fmt;

use irq::{IrqError, IrqReturn, PciAddress, PciPin, PciRoutingTable, PinRoute};

pub use irq::WidthError;

use crate::{arch::Ports, kernel, try_kernel};

const VENDOR_ID: u16 = 0x00;
const DEVICE_ID: u16 = 0x02;
const CLASS_REVISION: u16 = 0x08;
const HEADER_TYPE: u16 = 0x0E;
const INTERRUPT_LINE: u16 = 0x3C;

const NO_DEVICE: u32 = 0xFFFF;
const MULTI_FUNCTION: u32 = 0x80;
/// Interrupt Line value firmware uses for "not connected".
const NO_LINE: u32 = 0xFF;

pub fn read_port(port: u16, bits: u32) -> Result<u32, WidthError> {
    irq::read_port(&Ports, port, bits)
}

pub fn write_port(port: u16, bits: u32, value: u32) -> Result<(), WidthError> {
    irq::write_port(&Ports, port, bits, value)
}

pub fn read_pci_config(address: PciAddress, offset: u16, bits: u32) -> Result<u32, WidthError> {
    kernel().pci.lock().read(address, offset, bits)
}

pub fn write_pci_config(
    address: PciAddress,
    offset: u16,
    bits: u32,
    value: u32,
) -> Result<(), WidthError> {
    kernel().pci.lock().write(address, offset, bits, value)
}

/// Attaches `handler(ctx)` to `gsi` and returns the vector it arrives on.
pub fn install_interrupt_handler(
    gsi: u32,
    handler: fn(usize) -> IrqReturn,
    ctx: usize,
) -> Result<u8, IrqError> {
    kernel().router.irq_add_handler(gsi, handler, ctx)
}

/// Detaches a handler installed with the same `handler` and `ctx`. Returns
/// whether one was found.
pub fn remove_interrupt_handler(gsi: u32, handler: fn(usize) -> IrqReturn, ctx: usize) -> bool {
    kernel().router.irq_remove_handler(gsi, handler, ctx)
}

/// Nanoseconds since the timer started; zero before boot got that far.
pub fn monotonic_ns() -> u64 {
    try_kernel().map_or(0, |kernel| kernel.scheduler.now())
}

/// Replaces the PCI interrupt routing with what the interpreter read from
/// `_PRT` and the link devices.
pub fn set_pci_routing(table: PciRoutingTable) {
    *kernel().pci_routes.lock() = table;
}

/// One function found by [`scan_pci_bus`].
#[derive(Debug, Clone, Copy)]
pub struct PciFunction {
    pub address: PciAddress,
    pub vendor: u16,
    pub device: u16,
    pub class: u8,
    pub subclass: u8,
    pub pin: Option<(PciPin, PinRoute)>,
}

impl fmt::Display for PciFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let PciAddress { bus, device, function } = self.address;
        write!(
            f,
            "pci {bus:02x}:{device:02x}.{function}: {:04x}:{:04x} class {:02x}.{:02x}",
            self.vendor, self.device, self.class, self.subclass
        )?;
        match self.pin {
            Some((pin, PinRoute::Gsi(gsi))) => write!(f, " {pin:?} on GSI {gsi}"),
            Some((pin, PinRoute::NoRouteYet)) => write!(f, " {pin:?} link not configured"),
            Some((pin, PinRoute::Unrouted)) => write!(f, " {pin:?} unrouted"),
            None => Ok(()),
        }
    }
}

/// Enumerates every function on `bus`, routing each interrupt pin.
pub fn scan_pci_bus(bus: u8) -> Vec<PciFunction> {
    let mut found = Vec::new();
    for device in 0..32 {
        for function in 0..8 {
            let address = PciAddress::new(bus, device, function);
            let Some(info) = probe(address) else {
                if function == 0 {
                    break;
                }
                continue;
            };
            found.push(info);
            if function == 0 && !is_multi_function(address) {
                break;
            }
        }
    }
    found
}

fn config(address: PciAddress, offset: u16, bits: u32) -> u32 {
    match read_pci_config(address, offset, bits) {
        Ok(value) => value,
        Err(err) => panic!("PCI probe used a bad width: {err}"),
    }
}

fn probe(address: PciAddress) -> Option<PciFunction> {
    let vendor = config(address, VENDOR_ID, 16);
    if vendor == NO_DEVICE {
        return None;
    }
    let class = config(address, CLASS_REVISION, 32);
    let pin = kernel().pci.lock().interrupt_pin(address);
    Some(PciFunction {
        address,
        vendor: vendor as u16,
        device: config(address, DEVICE_ID, 16) as u16,
        class: (class >> 24) as u8,
        subclass: (class >> 16) as u8,
        pin: pin.map(|pin| (pin, route_pin(address, pin))),
    })
}

/// Resolves `pin` through the routing table, which falls back to the
/// Interrupt Line firmware programmed. A routed pin has its Interrupt Line
/// updated to match.
fn route_pin(address: PciAddress, pin: PciPin) -> PinRoute {
    let line = config(address, INTERRUPT_LINE, 8);
    let resolved = kernel()
        .pci_routes
        .lock()
        .route(address.bus, address.device, pin, line as u8);
    let route = resolved.unwrap_or_else(|err| {
        log::warn!("pci {address:?}: {err}");
        PinRoute::Unrouted
    });
    match route {
        PinRoute::Gsi(gsi) if gsi < NO_LINE && gsi != line => {
            if let Err(err) = write_pci_config(address, INTERRUPT_LINE, 8, gsi) {
                panic!("PCI routing used a bad width: {err}");
            }
        }
        _ => {}
    }
    route
}

fn is_multi_function(address: PciAddress) -> bool {
    config(address, HEADER_TYPE, 8) & MULTI_FUNCTION != 0
}
