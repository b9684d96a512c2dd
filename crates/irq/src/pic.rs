//! The legacy 8259 pair, used when no I/O APIC is available or `pic` is on
//! the command line.

use crate::{IrqController, IrqError, LEGACY_VECTOR_BASE, PortIo};

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
/// Unused port; writing it gives the PICs time to settle between ICWs.
const IO_WAIT_PORT: u16 = 0x80;

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const OCW3_READ_ISR: u8 = 0x0B;
const EOI: u8 = 0x20;

const CASCADE_IRQ: u8 = 2;
pub const PIC_IRQS: u8 = 16;

pub struct Pic8259<P: PortIo> {
    ports: P,
    offset: u8,
    /// Bit set = masked. Master in the low byte.
    masks: u16,
}

impl<P: PortIo> Pic8259<P> {
    pub fn new(ports: P) -> Self {
        Self {
            ports,
            offset: LEGACY_VECTOR_BASE,
            masks: 0xFFFF,
        }
    }

    /// Remaps IRQ 0..16 to `offset..offset + 16` and masks every line except
    /// the cascade.
    pub fn init(&mut self, offset: u8) {
        self.offset = offset;
        let p = &self.ports;
        p.write_u8(PIC1_COMMAND, ICW1_INIT);
        p.write_u8(IO_WAIT_PORT, 0);
        p.write_u8(PIC2_COMMAND, ICW1_INIT);
        p.write_u8(IO_WAIT_PORT, 0);
        p.write_u8(PIC1_DATA, offset);
        p.write_u8(IO_WAIT_PORT, 0);
        p.write_u8(PIC2_DATA, offset + 8);
        p.write_u8(IO_WAIT_PORT, 0);
        // master has the slave on IRQ2, slave's cascade identity is 2
        p.write_u8(PIC1_DATA, 1 << CASCADE_IRQ);
        p.write_u8(IO_WAIT_PORT, 0);
        p.write_u8(PIC2_DATA, CASCADE_IRQ);
        p.write_u8(IO_WAIT_PORT, 0);
        p.write_u8(PIC1_DATA, ICW4_8086);
        p.write_u8(IO_WAIT_PORT, 0);
        p.write_u8(PIC2_DATA, ICW4_8086);
        p.write_u8(IO_WAIT_PORT, 0);

        self.masks = !(1 << CASCADE_IRQ);
        self.write_masks();
        log::debug!("8259 PIC remapped to vectors {:#x}..{:#x}", offset, offset + PIC_IRQS);
    }

    /// Masks every line, leaving the chips remapped so a stray interrupt
    /// never lands on an exception vector.
    pub fn disable(&mut self) {
        self.masks = 0xFFFF;
        self.write_masks();
    }

    pub fn mask(&mut self, irq: u8) {
        assert!(irq < PIC_IRQS, "8259 has no IRQ {irq}");
        self.masks |= 1 << irq;
        self.write_masks();
    }

    pub fn unmask(&mut self, irq: u8) {
        assert!(irq < PIC_IRQS, "8259 has no IRQ {irq}");
        self.masks &= !(1 << irq);
        if irq >= 8 {
            self.masks &= !(1 << CASCADE_IRQ);
        }
        self.write_masks();
    }

    pub fn masks(&self) -> u16 {
        self.masks
    }

    /// IRQ 7 and 15 fire spuriously when a line drops before the CPU
    /// acknowledges it; the in-service register tells the two apart.
    pub fn is_spurious(&self, irq: u8) -> bool {
        match irq {
            7 => self.in_service(PIC1_COMMAND) & 0x80 == 0,
            15 => self.in_service(PIC2_COMMAND) & 0x80 == 0,
            _ => false,
        }
    }

    pub fn eoi(&mut self, irq: u8) {
        if irq >= 8 {
            // A spurious IRQ 15 still went through the master's cascade line.
            if !self.is_spurious(irq) {
                self.ports.write_u8(PIC2_COMMAND, EOI);
            }
            self.ports.write_u8(PIC1_COMMAND, EOI);
        } else if !self.is_spurious(irq) {
            self.ports.write_u8(PIC1_COMMAND, EOI);
        }
    }

    fn in_service(&self, command: u16) -> u8 {
        self.ports.write_u8(command, OCW3_READ_ISR);
        self.ports.read_u8(command)
    }

    fn write_masks(&self) {
        self.ports.write_u8(PIC1_DATA, self.masks as u8);
        self.ports.write_u8(PIC2_DATA, (self.masks >> 8) as u8);
    }
}

impl<P: PortIo> IrqController for Pic8259<P> {
    fn fixed_vector(&self, gsi: u32) -> Option<u8> {
        (gsi < u32::from(PIC_IRQS)).then(|| self.offset + gsi as u8)
    }

    fn route(&mut self, gsi: u32, vector: u8) -> Result<(), IrqError> {
        match self.fixed_vector(gsi) {
            Some(fixed) if fixed == vector => {
                self.unmask(gsi as u8);
                Ok(())
            }
            _ => Err(IrqError::NoRoute(gsi)),
        }
    }

    fn unroute(&mut self, gsi: u32) {
        if gsi < u32::from(PIC_IRQS) {
            self.mask(gsi as u8);
        }
    }

    fn eoi(&mut self, vector: u8) {
        if let Some(irq) = vector.checked_sub(self.offset).filter(|irq| *irq < PIC_IRQS) {
            Pic8259::eoi(self, irq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::FakePorts;

    fn pic(ports: &FakePorts) -> Pic8259<&FakePorts> {
        let mut pic = Pic8259::new(ports);
        pic.init(LEGACY_VECTOR_BASE);
        pic
    }

    #[test]
    fn init_sends_the_icw_sequence() {
        let ports = FakePorts::default();
        pic(&ports);
        assert_eq!(ports.writes_to(PIC1_COMMAND), [0x11]);
        assert_eq!(ports.writes_to(PIC2_COMMAND), [0x11]);
        assert_eq!(ports.writes_to(PIC1_DATA), [0x20, 0x04, 0x01, 0xFB]);
        assert_eq!(ports.writes_to(PIC2_DATA), [0x28, 0x02, 0x01, 0xFF]);
    }

    #[test]
    fn unmasking_a_slave_line_opens_the_cascade() {
        let ports = FakePorts::default();
        let mut pic = Pic8259::new(&ports);
        pic.disable();
        pic.unmask(12);
        assert_eq!(pic.masks(), 0xFFFF & !(1 << 12) & !(1 << 2));
        pic.mask(12);
        assert_eq!(pic.masks() & (1 << 12), 1 << 12);
    }

    #[test]
    fn routes_only_to_fixed_vectors() {
        let ports = FakePorts::default();
        let mut pic = pic(&ports);
        assert_eq!(pic.fixed_vector(1), Some(0x21));
        assert_eq!(pic.fixed_vector(16), None);
        assert_eq!(pic.route(1, 0x21), Ok(()));
        assert_eq!(pic.masks() & 0b10, 0);
        assert_eq!(pic.route(1, 0x35), Err(IrqError::NoRoute(1)));
    }

    #[test]
    fn eoi_goes_to_both_chips_for_slave_lines() {
        let ports = FakePorts::default();
        let mut pic = pic(&ports);
        ports.writes.borrow_mut().clear();

        IrqController::eoi(&mut pic, 0x2C);
        let eois: Vec<_> = ports.writes.borrow().iter().filter(|(_, v)| *v == 0x20).copied().collect();
        assert_eq!(eois, [(PIC2_COMMAND, 0x20), (PIC1_COMMAND, 0x20)]);
    }

    #[test]
    fn spurious_irq7_gets_no_eoi() {
        let ports = FakePorts::default();
        let mut pic = pic(&ports);
        ports.writes.borrow_mut().clear();
        // ISR reads back as zero: nothing in service
        pic.eoi(7);
        assert!(!ports.writes.borrow().contains(&(PIC1_COMMAND, 0x20)));
        pic.eoi(3);
        assert!(ports.writes.borrow().contains(&(PIC1_COMMAND, 0x20)));
    }
}
