//! I/O APIC redirection programming.
//!
//! Each I/O APIC exposes two MMIO registers: IOREGSEL at offset 0x00 selects
//! an internal register and IOWIN at 0x10 reads or writes it. Redirection
//! entry `n` is the register pair `0x10 + 2n` (low) and `0x11 + 2n` (high).

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::{IrqController, IrqError, LocalApic};

pub const IOREGSEL: usize = 0x00;
pub const IOWIN: usize = 0x10;

const REG_ID: u32 = 0x00;
const REG_VERSION: u32 = 0x01;
const REG_REDIRECTION_BASE: u32 = 0x10;

/// Selected-register access to one I/O APIC.
pub trait IoApicRegisters {
    fn read(&mut self, index: u32) -> u32;
    fn write(&mut self, index: u32, value: u32);
}

/// Delivery mode field shared by redirection entries and the local APIC ICR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    Fixed = 0b000,
    LowestPriority = 0b001,
    Smi = 0b010,
    Nmi = 0b100,
    Init = 0b101,
    Startup = 0b110,
    ExtInt = 0b111,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RedirectionFlags: u64 {
        const LOGICAL = 1 << 11;
        const DELIVERY_PENDING = 1 << 12;
        const ACTIVE_LOW = 1 << 13;
        const REMOTE_IRR = 1 << 14;
        const LEVEL = 1 << 15;
        const MASKED = 1 << 16;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ConformsToBus,
    ActiveHigh,
    ActiveLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    ConformsToBus,
    Edge,
    Level,
}

/// One 64-bit redirection table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RedirectionEntry(u64);

impl RedirectionEntry {
    /// Fixed delivery, physical destination 0, active high, edge, unmasked.
    pub const fn new(vector: u8) -> Self {
        Self(vector as u64)
    }

    pub const fn from_parts(low: u32, high: u32) -> Self {
        Self((high as u64) << 32 | low as u64)
    }

    pub const fn masked() -> Self {
        Self(RedirectionFlags::MASKED.bits())
    }

    pub fn with_destination(self, apic_id: u8) -> Self {
        Self(self.0 & !(0xFF << 56) | (apic_id as u64) << 56)
    }

    pub fn with_delivery(self, mode: DeliveryMode) -> Self {
        Self(self.0 & !(0b111 << 8) | (mode as u64) << 8)
    }

    pub fn with_flags(self, flags: RedirectionFlags, set: bool) -> Self {
        if set {
            Self(self.0 | flags.bits())
        } else {
            Self(self.0 & !flags.bits())
        }
    }

    pub fn with_polarity(self, polarity: Polarity) -> Self {
        self.with_flags(RedirectionFlags::ACTIVE_LOW, polarity == Polarity::ActiveLow)
    }

    pub fn with_trigger(self, trigger: TriggerMode) -> Self {
        self.with_flags(RedirectionFlags::LEVEL, trigger == TriggerMode::Level)
    }

    pub const fn vector(&self) -> u8 {
        self.0 as u8
    }

    pub const fn destination(&self) -> u8 {
        (self.0 >> 56) as u8
    }

    pub fn flags(&self) -> RedirectionFlags {
        RedirectionFlags::from_bits_truncate(self.0)
    }

    pub fn is_masked(&self) -> bool {
        self.flags().contains(RedirectionFlags::MASKED)
    }

    pub const fn low(&self) -> u32 {
        self.0 as u32
    }

    pub const fn high(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for RedirectionEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedirectionEntry")
            .field("vector", &format_args!("{:#x}", self.vector()))
            .field("destination", &self.destination())
            .field("flags", &self.flags())
            .finish()
    }
}

/// An ISA IRQ that the firmware wired to a different GSI or with
/// non-default polarity and trigger mode (MADT type 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptSourceOverride {
    pub isa_irq: u8,
    pub gsi: u32,
    pub polarity: Polarity,
    pub trigger: TriggerMode,
}

pub struct IoApic<R> {
    regs: R,
    id: u8,
    gsi_base: u32,
    pins: u32,
}

impl<R: IoApicRegisters> IoApic<R> {
    pub fn new(mut regs: R, gsi_base: u32) -> Self {
        let id = ((regs.read(REG_ID) >> 24) & 0x0F) as u8;
        let pins = ((regs.read(REG_VERSION) >> 16) & 0xFF) + 1;
        log::debug!("I/O APIC {id}: {pins} pins from GSI {gsi_base}");
        Self {
            regs,
            id,
            gsi_base,
            pins,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    pub fn pins(&self) -> u32 {
        self.pins
    }

    pub fn handles(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi - self.gsi_base < self.pins
    }

    pub fn read_entry(&mut self, pin: u32) -> RedirectionEntry {
        assert!(pin < self.pins, "I/O APIC {} has no pin {pin}", self.id);
        let index = REG_REDIRECTION_BASE + 2 * pin;
        let low = self.regs.read(index);
        let high = self.regs.read(index + 1);
        RedirectionEntry::from_parts(low, high)
    }

    /// Masks the pin while the destination half is rewritten so a half
    /// programmed entry never delivers.
    pub fn write_entry(&mut self, pin: u32, entry: RedirectionEntry) {
        assert!(pin < self.pins, "I/O APIC {} has no pin {pin}", self.id);
        let index = REG_REDIRECTION_BASE + 2 * pin;
        self.regs.write(index, entry.low() | RedirectionFlags::MASKED.bits() as u32);
        self.regs.write(index + 1, entry.high());
        self.regs.write(index, entry.low());
    }

    pub fn mask(&mut self, pin: u32) {
        let entry = self.read_entry(pin);
        self.write_entry(pin, entry.with_flags(RedirectionFlags::MASKED, true));
    }

    pub fn mask_all(&mut self) {
        for pin in 0..self.pins {
            self.write_entry(pin, RedirectionEntry::masked());
        }
    }
}

/// Every I/O APIC in the system plus the ISA overrides from the MADT.
pub struct IoApicController<R, A> {
    apics: Vec<IoApic<R>>,
    overrides: Vec<InterruptSourceOverride>,
    lapic: A,
    destination: u8,
}

impl<R: IoApicRegisters, A: LocalApic> IoApicController<R, A> {
    /// Interrupts are delivered to `destination`, the bootstrap processor's
    /// APIC ID. EOIs go to `lapic`.
    pub fn new(lapic: A, destination: u8) -> Self {
        Self {
            apics: Vec::new(),
            overrides: Vec::new(),
            lapic,
            destination,
        }
    }

    pub fn add_ioapic(&mut self, mut apic: IoApic<R>) {
        apic.mask_all();
        self.apics.push(apic);
    }

    pub fn add_override(&mut self, iso: InterruptSourceOverride) {
        log::debug!(
            "ISA IRQ {} -> GSI {} ({:?}, {:?})",
            iso.isa_irq,
            iso.gsi,
            iso.polarity,
            iso.trigger
        );
        self.overrides.push(iso);
    }

    pub fn lapic(&mut self) -> &mut A {
        &mut self.lapic
    }

    /// Numbers below 16 are ISA IRQs and go through the override table;
    /// ISA lines default to active-high edge, everything else to PCI's
    /// active-low level.
    pub fn resolve(&self, irq: u32) -> (u32, Polarity, TriggerMode) {
        if irq < 16 {
            match self.overrides.iter().find(|o| u32::from(o.isa_irq) == irq) {
                Some(o) => (
                    o.gsi,
                    match o.polarity {
                        Polarity::ConformsToBus => Polarity::ActiveHigh,
                        p => p,
                    },
                    match o.trigger {
                        TriggerMode::ConformsToBus => TriggerMode::Edge,
                        t => t,
                    },
                ),
                None => (irq, Polarity::ActiveHigh, TriggerMode::Edge),
            }
        } else {
            (irq, Polarity::ActiveLow, TriggerMode::Level)
        }
    }

    fn apic_for(&mut self, gsi: u32) -> Option<&mut IoApic<R>> {
        self.apics.iter_mut().find(|a| a.handles(gsi))
    }

    pub fn entry(&mut self, irq: u32) -> Option<RedirectionEntry> {
        let (gsi, ..) = self.resolve(irq);
        let apic = self.apic_for(gsi)?;
        let pin = gsi - apic.gsi_base();
        Some(apic.read_entry(pin))
    }
}

impl<R: IoApicRegisters, A: LocalApic> IrqController for IoApicController<R, A> {
    fn fixed_vector(&self, _gsi: u32) -> Option<u8> {
        None
    }

    fn route(&mut self, irq: u32, vector: u8) -> Result<(), IrqError> {
        let (gsi, polarity, trigger) = self.resolve(irq);
        let destination = self.destination;
        let apic = self.apic_for(gsi).ok_or(IrqError::NoRoute(irq))?;
        let pin = gsi - apic.gsi_base();
        let entry = RedirectionEntry::new(vector)
            .with_destination(destination)
            .with_polarity(polarity)
            .with_trigger(trigger);
        apic.write_entry(pin, entry);
        log::trace!("I/O APIC {} pin {pin}: {entry:?}", apic.id());
        Ok(())
    }

    fn unroute(&mut self, irq: u32) {
        let (gsi, ..) = self.resolve(irq);
        if let Some(apic) = self.apic_for(gsi) {
            let pin = gsi - apic.gsi_base();
            apic.mask(pin);
        }
    }

    fn eoi(&mut self, _vector: u8) {
        self.lapic.eoi();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ipi::tests::FakeApic;

    /// Register file of a fake I/O APIC with `pins` redirection entries.
    pub struct FakeIoApic {
        pub id: u8,
        pub registers: Vec<u32>,
        pub writes: Vec<(u32, u32)>,
    }

    impl FakeIoApic {
        pub fn new(id: u8, pins: u32) -> Self {
            let mut registers = vec![0; (REG_REDIRECTION_BASE + 2 * pins) as usize];
            registers[REG_ID as usize] = u32::from(id) << 24;
            registers[REG_VERSION as usize] = (pins - 1) << 16 | 0x20;
            Self {
                id,
                registers,
                writes: Vec::new(),
            }
        }
    }

    impl IoApicRegisters for FakeIoApic {
        fn read(&mut self, index: u32) -> u32 {
            self.registers[index as usize]
        }

        fn write(&mut self, index: u32, value: u32) {
            self.writes.push((index, value));
            self.registers[index as usize] = value;
        }
    }

    fn controller() -> IoApicController<FakeIoApic, FakeApic<'static>> {
        let mut controller = IoApicController::new(FakeApic::new(0), 0);
        controller.add_ioapic(IoApic::new(FakeIoApic::new(0, 24), 0));
        controller.add_ioapic(IoApic::new(FakeIoApic::new(1, 8), 24));
        controller
    }

    #[test]
    fn entry_bit_layout() {
        let entry = RedirectionEntry::new(0x31)
            .with_destination(3)
            .with_polarity(Polarity::ActiveLow)
            .with_trigger(TriggerMode::Level);
        assert_eq!(entry.raw(), 0x0300_0000_0000_A031);
        assert_eq!(entry.low(), 0xA031);
        assert_eq!(entry.high(), 0x0300_0000);
        assert!(!entry.is_masked());
        assert!(RedirectionEntry::masked().is_masked());
        assert_eq!(
            RedirectionEntry::new(0).with_delivery(DeliveryMode::ExtInt).raw(),
            0x700
        );
    }

    #[test]
    fn reads_identity_and_size() {
        let apic = IoApic::new(FakeIoApic::new(5, 24), 48);
        assert_eq!(apic.id(), 5);
        assert_eq!(apic.pins(), 24);
        assert!(apic.handles(48));
        assert!(apic.handles(71));
        assert!(!apic.handles(72));
    }

    #[test]
    fn write_entry_masks_before_switching_destination() {
        let mut apic = IoApic::new(FakeIoApic::new(0, 24), 0);
        apic.write_entry(2, RedirectionEntry::new(0x40).with_destination(1));
        assert_eq!(
            apic.regs.writes,
            [(0x14, 0x1_0040), (0x15, 0x0100_0000), (0x14, 0x40)]
        );
    }

    #[test]
    fn adding_an_ioapic_masks_every_pin() {
        let mut c = controller();
        for irq in 16..24 {
            assert!(c.entry(irq).unwrap().is_masked());
        }
    }

    #[test]
    fn isa_override_redirects_and_keeps_flags() {
        let mut c = controller();
        c.add_override(InterruptSourceOverride {
            isa_irq: 0,
            gsi: 2,
            polarity: Polarity::ConformsToBus,
            trigger: TriggerMode::ConformsToBus,
        });
        c.add_override(InterruptSourceOverride {
            isa_irq: 9,
            gsi: 9,
            polarity: Polarity::ActiveLow,
            trigger: TriggerMode::Level,
        });

        c.route(0, 0x30).unwrap();
        let timer = c.apics[0].read_entry(2);
        assert_eq!(timer.vector(), 0x30);
        assert!(!timer.flags().contains(RedirectionFlags::LEVEL));

        c.route(9, 0x31).unwrap();
        let sci = c.apics[0].read_entry(9);
        assert!(sci.flags().contains(RedirectionFlags::LEVEL | RedirectionFlags::ACTIVE_LOW));

        c.route(1, 0x32).unwrap();
        assert_eq!(c.apics[0].read_entry(1).vector(), 0x32);
    }

    #[test]
    fn picks_ioapic_by_gsi_base() {
        let mut c = controller();
        c.route(26, 0x33).unwrap();
        let entry = c.apics[1].read_entry(2);
        assert_eq!(entry.vector(), 0x33);
        assert!(entry.flags().contains(RedirectionFlags::LEVEL | RedirectionFlags::ACTIVE_LOW));
        assert_eq!(c.route(40, 0x34), Err(IrqError::NoRoute(40)));
    }

    #[test]
    fn unroute_masks_and_eoi_hits_the_local_apic() {
        let mut c = controller();
        c.route(20, 0x35).unwrap();
        c.unroute(20);
        assert!(c.entry(20).unwrap().is_masked());
        c.eoi(0x35);
        assert_eq!(c.lapic().eois, 1);
    }
}
