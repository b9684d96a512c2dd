//! Local APIC interrupt commands and application-processor startup.

use core::mem::offset_of;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::DeliveryMode;

/// The per-CPU local APIC, as much of it as routing and startup need.
pub trait LocalApic {
    fn id(&self) -> u8;

    /// Writes the interrupt command register, high half first.
    fn send_ipi(&mut self, command: IpiCommand);

    fn eoi(&mut self);

    /// Busy-waits for at least `micros` microseconds.
    fn delay_us(&mut self, micros: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Physical(u8),
    SelfOnly,
    AllIncludingSelf,
    AllExcludingSelf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpiCommand {
    pub vector: u8,
    pub mode: DeliveryMode,
    pub destination: Destination,
    pub assert: bool,
    pub level_triggered: bool,
}

impl IpiCommand {
    pub const fn fixed(vector: u8, destination: Destination) -> Self {
        Self {
            vector,
            mode: DeliveryMode::Fixed,
            destination,
            assert: true,
            level_triggered: false,
        }
    }

    pub const fn init(apic_id: u8) -> Self {
        Self {
            vector: 0,
            mode: DeliveryMode::Init,
            destination: Destination::Physical(apic_id),
            assert: true,
            level_triggered: false,
        }
    }

    /// STARTUP IPI; the target begins executing in real mode at `page << 12`.
    pub const fn startup(apic_id: u8, page: u8) -> Self {
        Self {
            vector: page,
            mode: DeliveryMode::Startup,
            destination: Destination::Physical(apic_id),
            assert: true,
            level_triggered: false,
        }
    }

    /// NMI to every other CPU. Reaches CPUs with interrupts disabled.
    pub const fn halt_others() -> Self {
        Self {
            vector: 0,
            mode: DeliveryMode::Nmi,
            destination: Destination::AllExcludingSelf,
            assert: true,
            level_triggered: false,
        }
    }

    /// The 64-bit ICR value.
    pub const fn encode(&self) -> u64 {
        let (shorthand, apic_id) = match self.destination {
            Destination::Physical(id) => (0b00, id),
            Destination::SelfOnly => (0b01, 0),
            Destination::AllIncludingSelf => (0b10, 0),
            Destination::AllExcludingSelf => (0b11, 0),
        };
        self.vector as u64
            | (self.mode as u64) << 8
            | (self.assert as u64) << 14
            | (self.level_triggered as u64) << 15
            | (shorthand as u64) << 18
            | (apic_id as u64) << 56
    }
}

/// Physical page the AP trampoline is copied to. Must be below 1 MiB.
pub const TRAMPOLINE_ADDRESS: u64 = 0x8000;
/// Physical address of the [`StartupParameters`] block.
pub const STARTUP_PARAMETERS_ADDRESS: u64 = 0x7000;

pub const INIT_DELAY_US: u64 = 10_000;
pub const STARTUP_DELAY_US: u64 = 200;
const POLL_DELAY_US: u64 = 10;

/// Handed from the bootstrap processor to one starting AP through low
/// memory. The AP copies what it needs and then sets `ready`; after that the
/// block and its identity mapping may be reused.
#[derive(Debug, Default)]
#[repr(C)]
pub struct StartupParameters {
    pub ready: AtomicU32,
    pub cpu_index: u32,
    pub page_table_root: u64,
    pub stack_top: u64,
    pub entry: u64,
    pub gdt_base: u64,
    pub idt_base: u64,
    pub gdt_limit: u16,
    pub idt_limit: u16,
    pub reserved: u32,
}

/// Field offsets used by the trampoline assembly.
pub mod offsets {
    use super::*;

    pub const READY: usize = offset_of!(StartupParameters, ready);
    pub const CPU_INDEX: usize = offset_of!(StartupParameters, cpu_index);
    pub const PAGE_TABLE_ROOT: usize = offset_of!(StartupParameters, page_table_root);
    pub const STACK_TOP: usize = offset_of!(StartupParameters, stack_top);
    pub const ENTRY: usize = offset_of!(StartupParameters, entry);

    const _: () = assert!(READY == 0 && CPU_INDEX == 4 && PAGE_TABLE_ROOT == 8);
    const _: () = assert!(STACK_TOP == 16 && ENTRY == 24);
}

impl StartupParameters {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) != 0
    }

    /// Called by the AP once it no longer needs the block.
    pub fn signal_ready(&self) {
        self.ready.store(1, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StartupError {
    #[error("CPU with APIC ID {apic_id} did not come online")]
    Timeout { apic_id: u8 },
}

/// Wakes the AP `apic_id` with INIT, STARTUP, STARTUP and waits up to
/// `poll_limit` polls for it to report ready through `params`.
///
/// The caller must have filled `params` and copied the trampoline to
/// [`TRAMPOLINE_ADDRESS`].
pub fn start_processor<A: LocalApic>(
    apic: &mut A,
    apic_id: u8,
    params: &StartupParameters,
    poll_limit: u32,
) -> Result<(), StartupError> {
    let page = (TRAMPOLINE_ADDRESS >> 12) as u8;
    params.ready.store(0, Ordering::Release);

    apic.send_ipi(IpiCommand::init(apic_id));
    apic.delay_us(INIT_DELAY_US);
    apic.send_ipi(IpiCommand::startup(apic_id, page));
    apic.delay_us(STARTUP_DELAY_US);
    apic.send_ipi(IpiCommand::startup(apic_id, page));
    apic.delay_us(STARTUP_DELAY_US);

    for _ in 0..poll_limit {
        if params.is_ready() {
            log::debug!("CPU {} (APIC ID {apic_id}) is online", params.cpu_index);
            return Ok(());
        }
        apic.delay_us(POLL_DELAY_US);
    }
    if params.is_ready() {
        return Ok(());
    }
    Err(StartupError::Timeout { apic_id })
}
