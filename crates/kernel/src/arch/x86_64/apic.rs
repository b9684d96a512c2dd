//! Local APIC and I/O APIC register access.

use core::sync::atomic::{AtomicU32, Ordering};

use irq::{IOREGSEL, IOWIN, IoApicRegisters, IpiCommand, LocalApic, SPURIOUS_VECTOR, TIMER_VECTOR};
use mm::VirtualAddress;
use x86_64::registers::model_specific::Msr;

use super::pit;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;

const REG_ID: usize = 0x020;
const REG_TPR: usize = 0x080;
const REG_EOI: usize = 0x0B0;
const REG_SVR: usize = 0x0F0;
const REG_ESR: usize = 0x280;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TICR: usize = 0x380;
const REG_TCCR: usize = 0x390;
const REG_TDCR: usize = 0x3E0;

const SVR_SOFT_ENABLE: u32 = 1 << 8;
const ICR_PENDING: u32 = 1 << 12;
const LVT_MASKED: u32 = 1 << 16;
const LVT_PERIODIC: u32 = 1 << 17;
const DIVIDE_BY_16: u32 = 0b0011;

const CALIBRATION_MS: u32 = 10;

/// Timer ticks per millisecond at divide-by-16, measured once by the BSP.
static TICKS_PER_MS: AtomicU32 = AtomicU32::new(0);

/// Physical base of the local APIC register page, from `IA32_APIC_BASE`.
pub fn lapic_physical_base() -> u64 {
    // SAFETY: the MSR exists on every x86_64 CPU.
    unsafe { Msr::new(IA32_APIC_BASE).read() & 0x000F_FFFF_FFFF_F000 }
}

/// The calling CPU's local APIC.
///
/// Every CPU sees its own APIC at the same address, so one value serves all
/// of them.
#[derive(Debug, Clone, Copy)]
pub struct Lapic {
    base: usize,
}

impl Lapic {
    /// # Safety
    ///
    /// `base` must map the local APIC register page uncached.
    pub const unsafe fn new(base: VirtualAddress) -> Self {
        Self {
            base: base.as_usize(),
        }
    }

    fn read(&self, reg: usize) -> u32 {
        // SAFETY: `new` guarantees the register page is mapped.
        unsafe { core::ptr::read_volatile((self.base + reg) as *const u32) }
    }

    fn write(&self, reg: usize, value: u32) {
        // SAFETY: as for `read`.
        unsafe { core::ptr::write_volatile((self.base + reg) as *mut u32, value) }
    }

    /// Software-enables this CPU's APIC with the timer masked.
    pub fn enable(&mut self) {
        let mut msr = Msr::new(IA32_APIC_BASE);
        // SAFETY: setting the global enable bit keeps the current base.
        unsafe {
            let value = msr.read();
            if value & APIC_GLOBAL_ENABLE == 0 {
                msr.write(value | APIC_GLOBAL_ENABLE);
            }
        }
        self.write(REG_SVR, SVR_SOFT_ENABLE | u32::from(SPURIOUS_VECTOR));
        self.write(REG_LVT_TIMER, LVT_MASKED);
        self.write(REG_TPR, 0);
        self.write(REG_ESR, 0);
        self.write(REG_ESR, 0);
        self.write(REG_EOI, 0);
    }

    /// Measures the timer against the PIT.
    pub fn calibrate(&mut self) {
        self.write(REG_TDCR, DIVIDE_BY_16);
        self.write(REG_LVT_TIMER, LVT_MASKED);
        self.write(REG_TICR, u32::MAX);
        pit::delay_us(u64::from(CALIBRATION_MS) * 1000);
        let elapsed = u32::MAX - self.read(REG_TCCR);
        self.write(REG_TICR, 0);

        let per_ms = (elapsed / CALIBRATION_MS).max(1);
        TICKS_PER_MS.store(per_ms, Ordering::Release);
        log::debug!("local APIC timer: {per_ms} ticks/ms at divide-by-16");
    }

    /// Starts the periodic tick on [`TIMER_VECTOR`].
    ///
    /// # Panics
    ///
    /// Panics if the timer was never calibrated.
    pub fn start_timer(&mut self, hz: u32) {
        let per_ms = TICKS_PER_MS.load(Ordering::Acquire);
        assert!(per_ms != 0, "local APIC timer started before calibration");
        let initial = (u64::from(per_ms) * 1000 / u64::from(hz.max(1))).clamp(1, u64::from(u32::MAX));
        self.write(REG_TDCR, DIVIDE_BY_16);
        self.write(REG_LVT_TIMER, LVT_PERIODIC | u32::from(TIMER_VECTOR));
        self.write(REG_TICR, initial as u32);
    }
}

impl LocalApic for Lapic {
    fn id(&self) -> u8 {
        (self.read(REG_ID) >> 24) as u8
    }

    fn send_ipi(&mut self, command: IpiCommand) {
        let icr = command.encode();
        self.write(REG_ICR_HIGH, (icr >> 32) as u32);
        self.write(REG_ICR_LOW, icr as u32);
        while self.read(REG_ICR_LOW) & ICR_PENDING != 0 {
            core::hint::spin_loop();
        }
    }

    fn eoi(&mut self) {
        self.write(REG_EOI, 0);
    }

    fn delay_us(&mut self, micros: u64) {
        pit::delay_us(micros);
    }
}

/// One I/O APIC's select/window register pair.
pub struct MmioIoApic {
    base: usize,
}

impl MmioIoApic {
    /// # Safety
    ///
    /// `base` must map the I/O APIC register page uncached, and nothing else
    /// may drive the same I/O APIC.
    pub const unsafe fn new(base: VirtualAddress) -> Self {
        Self {
            base: base.as_usize(),
        }
    }
}

impl IoApicRegisters for MmioIoApic {
    fn read(&mut self, index: u32) -> u32 {
        // SAFETY: `new` guarantees exclusive access to the mapped registers.
        unsafe {
            core::ptr::write_volatile((self.base + IOREGSEL) as *mut u32, index);
            core::ptr::read_volatile((self.base + IOWIN) as *const u32)
        }
    }

    fn write(&mut self, index: u32, value: u32) {
        // SAFETY: as for `read`.
        unsafe {
            core::ptr::write_volatile((self.base + IOREGSEL) as *mut u32, index);
            core::ptr::write_volatile((self.base + IOWIN) as *mut u32, value);
        }
    }
}
