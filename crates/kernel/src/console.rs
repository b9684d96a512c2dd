//! Defines the kernel console, which sends log records to the serial port.

use core::{
    fmt::Write,
    sync::atomic::{AtomicBool, Ordering},
};

use ksync::IrqSpinlock;
use log::LevelFilter;
use spin::Once;

use crate::serial::SerialWriter;

pub struct Console {
    has_output: AtomicBool,
    serial: IrqSpinlock<Option<SerialWriter>>,
}

static DEFAULT: Once<Console> = Once::new();

#[cfg(debug_assertions)]
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Trace;
#[cfg(not(debug_assertions))]
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

impl Console {
    pub fn init() -> &'static Self {
        let console = Self::default();
        console.install();
        console
    }

    pub fn default() -> &'static Self {
        DEFAULT.call_once(|| Console {
            has_output: AtomicBool::new(false),
            serial: IrqSpinlock::new(None),
        })
    }

    pub fn install(&'static self) {
        // Only fails if a logger is already set, which means `init` ran twice.
        if log::set_logger(self).is_ok() {
            log::set_max_level(DEFAULT_LEVEL);
        }
    }

    /// Applies `loglevel=` from the command line, if it was given.
    pub fn set_level(&self, level: Option<LevelFilter>) {
        if let Some(level) = level {
            log::set_max_level(level);
        }
    }

    pub fn has_output(&self) -> bool {
        self.has_output.load(Ordering::SeqCst)
    }

    pub fn attach_serial(&self, serial: SerialWriter) {
        *self.serial.lock() = Some(serial);
        self.has_output.store(true, Ordering::SeqCst);
    }
}

impl log::Log for Console {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if let Some(serial) = &mut *self.serial.lock() {
            // Nowhere to report a failing serial port.
            let _ = write_log_entry_to(serial, record);
        }
    }

    fn flush(&self) {}
}

fn write_log_entry_to(
    writer: &mut impl core::fmt::Write,
    record: &log::Record,
) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
