//! Port I/O as seen by the PIC, PCI configuration space and the ACPI layer.

/// x86 `in`/`out` instructions.
///
/// Implementations must not assume anything about the ports they are given;
/// callers are responsible for serialising multi-port protocols such as the
/// PCI address/data pair.
pub trait PortIo {
    fn read_u8(&self, port: u16) -> u8;
    fn read_u16(&self, port: u16) -> u16;
    fn read_u32(&self, port: u16) -> u32;
    fn write_u8(&self, port: u16, value: u8);
    fn write_u16(&self, port: u16, value: u16);
    fn write_u32(&self, port: u16, value: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported access width of {0} bits")]
pub struct WidthError(pub u32);

/// An 8, 16 or 32-bit read, zero-extended.
pub fn read_port(ports: &impl PortIo, port: u16, bits: u32) -> Result<u32, WidthError> {
    match bits {
        8 => Ok(ports.read_u8(port).into()),
        16 => Ok(ports.read_u16(port).into()),
        32 => Ok(ports.read_u32(port)),
        _ => Err(WidthError(bits)),
    }
}

/// An 8, 16 or 32-bit write of the low bits of `value`.
pub fn write_port(ports: &impl PortIo, port: u16, bits: u32, value: u32) -> Result<(), WidthError> {
    match bits {
        8 => ports.write_u8(port, value as u8),
        16 => ports.write_u16(port, value as u16),
        32 => ports.write_u32(port, value),
        _ => return Err(WidthError(bits)),
    }
    Ok(())
}

impl<P: PortIo + ?Sized> PortIo for &P {
    fn read_u8(&self, port: u16) -> u8 {
        (**self).read_u8(port)
    }
    fn read_u16(&self, port: u16) -> u16 {
        (**self).read_u16(port)
    }
    fn read_u32(&self, port: u16) -> u32 {
        (**self).read_u32(port)
    }
    fn write_u8(&self, port: u16, value: u8) {
        (**self).write_u8(port, value)
    }
    fn write_u16(&self, port: u16, value: u16) {
        (**self).write_u16(port, value)
    }
    fn write_u32(&self, port: u16, value: u32) {
        (**self).write_u32(port, value)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::FakePorts;
    use super::*;

    #[test]
    fn sized_accesses_truncate_and_extend() {
        let ports = FakePorts::default();
        ports.set(0x60, 0xDEAD_BEEF);
        assert_eq!(read_port(&ports, 0x60, 8), Ok(0xEF));
        assert_eq!(read_port(&ports, 0x60, 16), Ok(0xBEEF));
        assert_eq!(read_port(&ports, 0x60, 32), Ok(0xDEAD_BEEF));

        write_port(&ports, 0x64, 8, 0x1234).unwrap();
        write_port(&ports, 0x64, 16, 0x1_5678).unwrap();
        write_port(&ports, 0x64, 32, 0x9ABC_DEF0).unwrap();
        assert_eq!(ports.writes_to(0x64), [0x34u32, 0x5678, 0x9ABC_DEF0]);
    }

    #[test]
    fn other_widths_are_rejected() {
        let ports = FakePorts::default();
        assert_eq!(read_port(&ports, 0x60, 64), Err(WidthError(64)));
        assert_eq!(write_port(&ports, 0x60, 12, 0), Err(WidthError(12)));
        assert!(ports.writes.borrow().is_empty());
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::PortIo;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Records writes and serves reads from a per-port register value.
    #[derive(Default)]
    pub struct FakePorts {
        pub writes: RefCell<Vec<(u16, u32)>>,
        pub registers: RefCell<HashMap<u16, u32>>,
    }

    impl FakePorts {
        pub fn set(&self, port: u16, value: u32) {
            self.registers.borrow_mut().insert(port, value);
        }

        pub fn writes_to(&self, port: u16) -> Vec<u32> {
            self.writes
                .borrow()
                .iter()
                .filter(|(p, _)| *p == port)
                .map(|(_, v)| *v)
                .collect()
        }

        fn read(&self, port: u16) -> u32 {
            self.registers.borrow().get(&port).copied().unwrap_or(0)
        }

        fn write(&self, port: u16, value: u32) {
            self.writes.borrow_mut().push((port, value));
            self.registers.borrow_mut().insert(port, value);
        }
    }

    impl PortIo for FakePorts {
        fn read_u8(&self, port: u16) -> u8 {
            self.read(port) as u8
        }
        fn read_u16(&self, port: u16) -> u16 {
            self.read(port) as u16
        }
        fn read_u32(&self, port: u16) -> u32 {
            self.read(port)
        }
        fn write_u8(&self, port: u16, value: u8) {
            self.write(port, value.into())
        }
        fn write_u16(&self, port: u16, value: u16) {
            self.write(port, value.into())
        }
        fn write_u32(&self, port: u16, value: u32) {
            self.write(port, value)
        }
    }
}
