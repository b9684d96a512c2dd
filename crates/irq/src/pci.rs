//! PCI configuration space access and interrupt pin routing.

use alloc::{string::String, vec::Vec};

use crate::{PortIo, WidthError};

pub const CONFIG_ADDRESS: u16 = 0xCF8;
pub const CONFIG_DATA: u16 = 0xCFC;

const INTERRUPT_LINE: u16 = 0x3C;
const INTERRUPT_PIN: u16 = 0x3D;
/// Interrupt Line value firmware uses for "not connected".
const NO_LINE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self { bus, device, function }
    }
}

/// Mechanism #1 configuration access through ports 0xCF8/0xCFC.
///
/// Narrow accesses are done as an aligned dword access plus shift and mask,
/// which every chipset supports.
pub struct PciConfigSpace<P> {
    ports: P,
}

impl<P: PortIo> PciConfigSpace<P> {
    pub const fn new(ports: P) -> Self {
        Self { ports }
    }

    /// The value written to CONFIG_ADDRESS for `offset`'s dword.
    pub fn config_address(address: PciAddress, offset: u16) -> u32 {
        assert!(address.device < 32, "PCI device number {} out of range", address.device);
        assert!(address.function < 8, "PCI function number {} out of range", address.function);
        assert!(offset < 256, "PCI config offset {offset:#x} out of range");
        1 << 31
            | u32::from(address.bus) << 16
            | u32::from(address.device) << 11
            | u32::from(address.function) << 8
            | u32::from(offset & 0xFC)
    }

    pub fn read_u32(&mut self, address: PciAddress, offset: u16) -> u32 {
        self.ports.write_u32(CONFIG_ADDRESS, Self::config_address(address, offset));
        self.ports.read_u32(CONFIG_DATA)
    }

    pub fn read_u16(&mut self, address: PciAddress, offset: u16) -> u16 {
        (self.read_u32(address, offset) >> ((offset & 2) * 8)) as u16
    }

    pub fn read_u8(&mut self, address: PciAddress, offset: u16) -> u8 {
        (self.read_u32(address, offset) >> ((offset & 3) * 8)) as u8
    }

    pub fn write_u32(&mut self, address: PciAddress, offset: u16, value: u32) {
        self.ports.write_u32(CONFIG_ADDRESS, Self::config_address(address, offset));
        self.ports.write_u32(CONFIG_DATA, value);
    }

    pub fn write_u16(&mut self, address: PciAddress, offset: u16, value: u16) {
        let shift = (offset & 2) * 8;
        let old = self.read_u32(address, offset);
        let new = old & !(0xFFFF << shift) | u32::from(value) << shift;
        self.write_u32(address, offset, new);
    }

    pub fn write_u8(&mut self, address: PciAddress, offset: u16, value: u8) {
        let shift = (offset & 3) * 8;
        let old = self.read_u32(address, offset);
        let new = old & !(0xFF << shift) | u32::from(value) << shift;
        self.write_u32(address, offset, new);
    }

    /// A byte, word or dword read selected by `bits`.
    pub fn read(&mut self, address: PciAddress, offset: u16, bits: u32) -> Result<u32, WidthError> {
        match bits {
            8 => Ok(self.read_u8(address, offset).into()),
            16 => Ok(self.read_u16(address, offset).into()),
            32 => Ok(self.read_u32(address, offset)),
            _ => Err(WidthError(bits)),
        }
    }

    /// A byte, word or dword write selected by `bits`.
    pub fn write(
        &mut self,
        address: PciAddress,
        offset: u16,
        bits: u32,
        value: u32,
    ) -> Result<(), WidthError> {
        match bits {
            8 => self.write_u8(address, offset, value as u8),
            16 => self.write_u16(address, offset, value as u16),
            32 => self.write_u32(address, offset, value),
            _ => return Err(WidthError(bits)),
        }
        Ok(())
    }

    pub fn interrupt_pin(&mut self, address: PciAddress) -> Option<PciPin> {
        PciPin::from_register(self.read_u8(address, INTERRUPT_PIN))
    }

    pub fn set_interrupt_line(&mut self, address: PciAddress, line: u8) {
        self.write_u8(address, INTERRUPT_LINE, line);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciPin {
    IntA,
    IntB,
    IntC,
    IntD,
}

impl PciPin {
    /// Interrupt Pin register: 0 means none, 1..=4 are INTA#..INTD#.
    pub fn from_register(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::IntA),
            2 => Some(Self::IntB),
            3 => Some(Self::IntC),
            4 => Some(Self::IntD),
            _ => None,
        }
    }

    /// `_PRT` numbering, 0..=3.
    pub fn from_prt(value: u8) -> Option<Self> {
        value.checked_add(1).and_then(Self::from_register)
    }
}

/// Where one `_PRT` entry sends its pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Gsi(u32),
    /// A PCI interrupt link device (`\_SB.LNKA` and friends).
    Link(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciRoute {
    pub bus: u8,
    pub device: u8,
    pub pin: PciPin,
    pub target: RouteTarget,
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciIrq {
    Gsi(u32),
    /// The link exists but has no interrupt configured yet.
    NoRouteYet,
}

/// Where a function's interrupt pin ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRoute {
    Gsi(u32),
    /// Its link device has no interrupt configured yet.
    NoRouteYet,
    Unrouted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no routing entry for {bus:02x}:{device:02x} {pin:?}")]
    NoEntry { bus: u8, device: u8, pin: PciPin },
    #[error("routing entry names unknown link device {0}")]
    UnknownLink(String),
    #[error("link device {link} cannot use GSI {gsi}")]
    InvalidLinkIrq { link: String, gsi: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkDevice {
    name: String,
    current: Option<u32>,
    possible: Vec<u32>,
}

/// PCI interrupt routing as discovered from ACPI (`_PRT`, `_CRS`, `_PRS`).
#[derive(Debug, Default)]
pub struct PciRoutingTable {
    routes: Vec<PciRoute>,
    links: Vec<LinkDevice>,
}

impl PciRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, route: PciRoute) {
        self.routes.push(route);
    }

    /// Registers a link device with its current setting and the GSIs it may
    /// be switched to.
    pub fn add_link(&mut self, name: &str, current: Option<u32>, possible: &[u32]) {
        self.links.push(LinkDevice {
            name: name.into(),
            current,
            possible: possible.to_vec(),
        });
    }

    /// Points a link device at `gsi`, as `_SRS` would.
    pub fn configure_link(&mut self, name: &str, gsi: u32) -> Result<(), RoutingError> {
        let link = self
            .links
            .iter_mut()
            .find(|l| l.name == name)
            .ok_or_else(|| RoutingError::UnknownLink(name.into()))?;
        if !link.possible.contains(&gsi) {
            return Err(RoutingError::InvalidLinkIrq {
                link: name.into(),
                gsi,
            });
        }
        link.current = Some(gsi);
        Ok(())
    }

    /// Like [`resolve`](Self::resolve), but a pin the table does not cover
    /// falls back to the Interrupt Line register value `line` firmware left.
    pub fn route(
        &self,
        bus: u8,
        device: u8,
        pin: PciPin,
        line: u8,
    ) -> Result<PinRoute, RoutingError> {
        match self.resolve(bus, device, pin) {
            Ok(PciIrq::Gsi(gsi)) => Ok(PinRoute::Gsi(gsi)),
            Ok(PciIrq::NoRouteYet) => Ok(PinRoute::NoRouteYet),
            Err(RoutingError::NoEntry { .. }) if line != NO_LINE => Ok(PinRoute::Gsi(line.into())),
            Err(RoutingError::NoEntry { .. }) => Ok(PinRoute::Unrouted),
            Err(err) => Err(err),
        }
    }

    pub fn resolve(&self, bus: u8, device: u8, pin: PciPin) -> Result<PciIrq, RoutingError> {
        let route = self
            .routes
            .iter()
            .find(|r| r.bus == bus && r.device == device && r.pin == pin)
            .ok_or(RoutingError::NoEntry { bus, device, pin })?;
        match &route.target {
            RouteTarget::Gsi(gsi) => Ok(PciIrq::Gsi(*gsi)),
            RouteTarget::Link(name) => {
                let link = self
                    .links
                    .iter()
                    .find(|l| l.name == *name)
                    .ok_or_else(|| RoutingError::UnknownLink(name.clone()))?;
                Ok(link.current.map_or(PciIrq::NoRouteYet, PciIrq::Gsi))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::FakePorts;

    mod config_space {
        use super::*;

        const DEV: PciAddress = PciAddress::new(0, 3, 0);

        #[test]
        fn address_encoding() {
            let addr = PciConfigSpace::<&FakePorts>::config_address(PciAddress::new(1, 2, 3), 0x3D);
            assert_eq!(addr, 0x8001_133C);
        }

        #[test]
        fn narrow_reads_shift_and_mask() {
            let ports = FakePorts::default();
            ports.set(CONFIG_DATA, 0x0000_010B);
            let mut pci = PciConfigSpace::new(&ports);
            assert_eq!(pci.read_u8(DEV, INTERRUPT_LINE), 0x0B);
            assert_eq!(pci.read_u8(DEV, INTERRUPT_PIN), 0x01);
            assert_eq!(pci.interrupt_pin(DEV), Some(PciPin::IntA));

            ports.set(CONFIG_DATA, 0xABCD_1234);
            assert_eq!(pci.read_u16(DEV, 0x02), 0xABCD);
            assert_eq!(pci.read_u16(DEV, 0x00), 0x1234);
            assert_eq!(pci.read_u8(DEV, 0x03), 0xAB);
        }

        #[test]
        fn narrow_writes_preserve_neighbours() {
            let ports = FakePorts::default();
            ports.set(CONFIG_DATA, 0x0000_01FF);
            let mut pci = PciConfigSpace::new(&ports);
            pci.set_interrupt_line(DEV, 0x0A);
            assert_eq!(ports.writes_to(CONFIG_DATA).last(), Some(&0x0000_010A));

            ports.set(CONFIG_DATA, 0x1111_2222);
            pci.write_u16(DEV, 0x06, 0xBEEF);
            assert_eq!(ports.writes_to(CONFIG_DATA).last(), Some(&0xBEEF_2222));
        }

        #[test]
        fn width_selected_access() {
            let ports = FakePorts::default();
            ports.set(CONFIG_DATA, 0x1122_3344);
            let mut pci = PciConfigSpace::new(&ports);
            assert_eq!(pci.read(DEV, 0x01, 8), Ok(0x33));
            assert_eq!(pci.read(DEV, 0x02, 16), Ok(0x1122));
            assert_eq!(pci.read(DEV, 0x00, 32), Ok(0x1122_3344));
            assert_eq!(pci.read(DEV, 0x00, 24), Err(WidthError(24)));

            pci.write(DEV, 0x3C, 8, 0x0B).unwrap();
            assert_eq!(ports.writes_to(CONFIG_DATA).last(), Some(&0x1122_330B));
            let before = ports.writes.borrow().len();
            assert_eq!(pci.write(DEV, 0x3C, 0, 0), Err(WidthError(0)));
            assert_eq!(ports.writes.borrow().len(), before);
        }

        #[test]
        #[should_panic(expected = "PCI device number 32 out of range")]
        fn bad_device_number_panics() {
            PciConfigSpace::<&FakePorts>::config_address(PciAddress::new(0, 32, 0), 0);
        }
    }

    mod routing {
        use super::*;

        fn table() -> PciRoutingTable {
            let mut table = PciRoutingTable::new();
            table.add_route(PciRoute {
                bus: 0,
                device: 1,
                pin: PciPin::IntA,
                target: RouteTarget::Gsi(16),
            });
            table.add_route(PciRoute {
                bus: 0,
                device: 2,
                pin: PciPin::IntA,
                target: RouteTarget::Link("LNKA".into()),
            });
            table.add_route(PciRoute {
                bus: 0,
                device: 2,
                pin: PciPin::IntB,
                target: RouteTarget::Link("LNKB".into()),
            });
            table.add_route(PciRoute {
                bus: 0,
                device: 3,
                pin: PciPin::IntA,
                target: RouteTarget::Link("LNKZ".into()),
            });
            table.add_link("LNKA", Some(11), &[10, 11]);
            table.add_link("LNKB", None, &[5, 10, 11]);
            table
        }

        #[test]
        fn direct_and_linked_routes() {
            let table = table();
            assert_eq!(table.resolve(0, 1, PciPin::IntA), Ok(PciIrq::Gsi(16)));
            assert_eq!(table.resolve(0, 2, PciPin::IntA), Ok(PciIrq::Gsi(11)));
        }

        #[test]
        fn route_falls_back_to_the_firmware_line() {
            let table = table();
            assert_eq!(table.route(0, 1, PciPin::IntA, 9), Ok(PinRoute::Gsi(16)));
            assert_eq!(table.route(0, 2, PciPin::IntB, 9), Ok(PinRoute::NoRouteYet));
            assert_eq!(table.route(0, 9, PciPin::IntA, 9), Ok(PinRoute::Gsi(9)));
            assert_eq!(table.route(0, 9, PciPin::IntA, 0xFF), Ok(PinRoute::Unrouted));
            assert_eq!(
                table.route(0, 3, PciPin::IntA, 9),
                Err(RoutingError::UnknownLink("LNKZ".into()))
            );
            assert_eq!(
                PciRoutingTable::new().route(0, 1, PciPin::IntA, 11),
                Ok(PinRoute::Gsi(11))
            );
        }

        #[test]
        fn unconfigured_link_differs_from_unknown_link() {
            let table = table();
            assert_eq!(table.resolve(0, 2, PciPin::IntB), Ok(PciIrq::NoRouteYet));
            assert_eq!(
                table.resolve(0, 3, PciPin::IntA),
                Err(RoutingError::UnknownLink("LNKZ".into()))
            );
            assert_eq!(
                table.resolve(0, 9, PciPin::IntC),
                Err(RoutingError::NoEntry {
                    bus: 0,
                    device: 9,
                    pin: PciPin::IntC
                })
            );
        }

        #[test]
        fn configuring_a_link_routes_it() {
            let mut table = table();
            assert!(matches!(
                table.configure_link("LNKB", 7),
                Err(RoutingError::InvalidLinkIrq { gsi: 7, .. })
            ));
            table.configure_link("LNKB", 10).unwrap();
            assert_eq!(table.resolve(0, 2, PciPin::IntB), Ok(PciIrq::Gsi(10)));
        }

        #[test]
        fn prt_pins_are_zero_based() {
            assert_eq!(PciPin::from_prt(0), Some(PciPin::IntA));
            assert_eq!(PciPin::from_prt(3), Some(PciPin::IntD));
            assert_eq!(PciPin::from_register(0), None);
        }
    }
}
