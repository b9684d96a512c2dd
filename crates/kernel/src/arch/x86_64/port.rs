use irq::PortIo;
use x86_64::instructions::port::Port;

/// The CPU's I/O port space.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ports;

// SAFETY (all methods): `PortIo` leaves the port protocol to its callers.
impl PortIo for Ports {
    fn read_u8(&self, port: u16) -> u8 {
        unsafe { Port::<u8>::new(port).read() }
    }

    fn read_u16(&self, port: u16) -> u16 {
        unsafe { Port::<u16>::new(port).read() }
    }

    fn read_u32(&self, port: u16) -> u32 {
        unsafe { Port::<u32>::new(port).read() }
    }

    fn write_u8(&self, port: u16, value: u8) {
        unsafe { Port::<u8>::new(port).write(value) }
    }

    fn write_u16(&self, port: u16, value: u16) {
        unsafe { Port::<u16>::new(port).write(value) }
    }

    fn write_u32(&self, port: u16, value: u32) {
        unsafe { Port::<u32>::new(port).write(value) }
    }
}
