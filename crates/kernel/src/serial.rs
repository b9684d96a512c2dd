use irq::IrqReturn;

use crate::{console::Console, os_services::read_port};

/// COM1.
pub const SERIAL_PORT: u16 = 0x3F8;

pub struct SerialWriter {
    port: uart_16550::SerialPort,
}

impl SerialWriter {
    /// Another handle on an already initialized port, bypassing the console
    /// lock. Output may interleave with whoever holds the lock.
    ///
    /// # Safety
    ///
    /// Only for the panic path, after [`init`] ran.
    pub unsafe fn steal() -> Self {
        Self {
            port: unsafe { uart_16550::SerialPort::new(SERIAL_PORT) },
        }
    }
}

impl core::fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.port.write_str(s)
    }
}

// cSpell:ignore uart
pub fn init(console: &Console) {
    // SAFETY: COM1 is a standard 16550 on every machine this kernel boots.
    let mut port = unsafe { uart_16550::SerialPort::new(SERIAL_PORT) };
    port.init();
    console.attach_serial(SerialWriter { port });
}

/// ISA IRQ line of COM1.
pub const SERIAL_IRQ: u32 = 4;

const LINE_STATUS: u16 = SERIAL_PORT + 5;
const DATA_READY: u32 = 1;
const FIFO_DEPTH: usize = 16;

/// Drains the receive FIFO into the console input buffer and wakes
/// whoever waits on it.
pub fn receive_interrupt(_ctx: usize) -> IrqReturn {
    let mut bytes = [0u8; FIFO_DEPTH];
    let mut count = 0;
    while count < FIFO_DEPTH
        && matches!(read_port(LINE_STATUS, 8), Ok(status) if status & DATA_READY != 0)
    {
        match read_port(SERIAL_PORT, 8) {
            Ok(byte) => bytes[count] = byte as u8,
            Err(_) => break,
        }
        count += 1;
    }
    if count == 0 {
        return IrqReturn::Unhandled;
    }
    let kernel = crate::kernel();
    kernel.console_input.push(&bytes[..count], &kernel.scheduler);
    IrqReturn::Handled
}
