#![cfg_attr(not(test), no_std)]

//! # Tern Kernel
//!
//! The hardware half of the kernel: descriptor tables and trap entry, the
//! local and I/O APICs, per-CPU data, application-processor startup, the
//! console and the panic path. Everything with an interesting invariant
//! lives in the library crates; this crate wires them to the machine.

extern crate alloc;

#[cfg(feature = "acpi")]
mod acpi;
mod arch;
mod console;
mod interrupts;
mod mem;
pub mod os_services;
mod panic;
mod platform;
mod serial;
mod smp;

use alloc::sync::Arc;

use bootinfo::{BootInfo, KernelConfig, SymbolTable};
use irq::{
    IoApic, IoApicController, IrqRouter, LEGACY_VECTOR_BASE, LocalApic, MsiTable, PciConfigSpace,
    PciRoutingTable, Pic8259,
};
use ksync::IrqSpinlock;
use mm::{AddressSpace, CloneFlags, MemoryManager, PhysicalAddress};
use sched::{Device, Errno, OpenFile, OpenFlags, Pid, RingBuffer, Scheduler, SyscallTable};
use spin::Once;

use crate::{
    arch::{Lapic, MmioIoApic, Ports},
    interrupts::Controller,
    mem::Memory,
    platform::Platform,
};

pub use panic::handle_panic;

/// Bytes of serial input buffered for readers.
const CONSOLE_INPUT_CAPACITY: usize = 4096;

/// State shared by every CPU once boot has set it up.
pub struct Kernel {
    pub mm: &'static MemoryManager,
    pub kernel_space: Arc<AddressSpace>,
    pub scheduler: Scheduler<'static>,
    pub router: IrqRouter<Controller>,
    pub msi: MsiTable,
    pub syscalls: SyscallTable,
    pub lapic: Lapic,
    pub pci: IrqSpinlock<PciConfigSpace<Ports>>,
    /// Empty until the ACPI interpreter hands over `_PRT`; see
    /// [`os_services::set_pci_routing`].
    pub pci_routes: IrqSpinlock<PciRoutingTable>,
    /// Serial input, readable as init's descriptor 0.
    pub console_input: Arc<RingBuffer>,
    pub symbols: SymbolTable<'static>,
    pub timer_hz: u32,
    /// Nanoseconds per timer tick.
    pub tick_ns: u64,
}

static KERNEL: Once<Kernel> = Once::new();

/// # Panics
///
/// Panics if called before boot finished building the kernel context.
pub fn kernel() -> &'static Kernel {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => panic!("kernel context used before boot set it up"),
    }
}

pub fn try_kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}

pub fn kernel_main(boot_info: *const BootInfo) -> ! {
    let console = console::Console::init();
    serial::init(console);
    log::info!("Tern {}", env!("CARGO_PKG_VERSION"));

    if boot_info.is_null() {
        log::error!("no boot information, refusing to boot");
        arch::park();
    }
    // SAFETY: the loader keeps the handoff block and everything it points at
    // mapped and untouched for as long as the kernel runs.
    let boot_info: &'static BootInfo = match unsafe { BootInfo::from_ptr(boot_info) } {
        Ok(info) => info,
        Err(err) => {
            log::error!("{err}, refusing to boot");
            arch::park();
        }
    };
    let config = boot_info.command_line().parse();
    console.set_level(config.log_level);
    log::debug!("command line: {:?}", boot_info.command_line().as_str());

    let memory = mem::init(boot_info);
    let platform = platform::discover(boot_info, arch::lapic_physical_base());

    let lapic_regs = mem::map_device(
        memory.mm,
        &memory.kernel_space,
        PhysicalAddress::new(platform.lapic_address as usize),
    );
    // SAFETY: `map_device` mapped the register page uncached.
    let mut lapic = unsafe { Lapic::new(lapic_regs) };
    lapic.enable();
    let bsp_apic_id = lapic.id();
    arch::init_cpu(0, bsp_apic_id);
    lapic.calibrate();

    let controller = build_controller(&memory, &platform, &config, lapic, bsp_apic_id);
    memory.mm.seal_kernel_half();

    let application_processors: &[u8] = if config.smp {
        &platform.application_processors
    } else {
        &[]
    };
    let cpus = 1 + application_processors.len();
    let kernel = KERNEL.call_once(|| Kernel {
        mm: memory.mm,
        kernel_space: memory.kernel_space.clone(),
        scheduler: Scheduler::new(cpus, memory.mm, memory.kernel_space.clone()),
        router: IrqRouter::new(controller),
        msi: MsiTable::new(),
        syscalls: SyscallTable::standard(),
        lapic,
        pci: IrqSpinlock::new(PciConfigSpace::new(Ports)),
        pci_routes: IrqSpinlock::new(PciRoutingTable::new()),
        console_input: Arc::new(RingBuffer::new(CONSOLE_INPUT_CAPACITY)),
        symbols: boot_info.symbols(),
        timer_hz: config.timer_hz,
        tick_ns: 1_000_000_000 / u64::from(config.timer_hz),
    });
    if let Some(path) = config.init {
        match create_init(kernel) {
            Ok(pid) => log::info!("init={path}: process {pid} ready for the program loader"),
            Err(err) => log::error!("init={path}: {err}"),
        }
    }

    for cpu in 0..cpus {
        let idle = kernel.scheduler.create_kernel_thread(idle_loop as usize as u64, cpu as u64);
        kernel.scheduler.set_idle(cpu, idle);
    }

    match os_services::install_interrupt_handler(serial::SERIAL_IRQ, serial::receive_interrupt, 0) {
        Ok(vector) => log::debug!("serial input on vector {vector:#x}"),
        Err(err) => log::warn!("no serial input: {err}"),
    }
    for function in os_services::scan_pci_bus(0) {
        log::info!("{function}");
    }

    smp::start_application_processors(kernel, application_processors);

    lapic.start_timer(kernel.timer_hz);
    log::info!(
        "{} of {cpus} CPUs online, timer at {} Hz",
        (0..cpus).filter(|cpu| kernel.scheduler.is_online(*cpu)).count(),
        kernel.timer_hz
    );

    mem::check_heap();

    // The boot stack is abandoned here: with no current thread the scheduler
    // saves nothing and this CPU continues in its idle thread.
    arch::yield_now();
    panic!("boot context resumed after the first schedule");
}

/// Creates process 1 with the kernel half mapped and serial input on
/// descriptor 0. Loading its image is the program loader's job.
fn create_init(kernel: &'static Kernel) -> Result<Pid, Errno> {
    let space = AddressSpace::clone_from(kernel.mm, &kernel.kernel_space, CloneFlags::KERNEL)?;
    let pid = kernel.scheduler.create_process(None, space);
    let console = OpenFile::new(Device::Char(kernel.console_input.clone()), OpenFlags::READ);
    let fd = kernel
        .scheduler
        .with_process_mut(pid, |p| p.files.install(Arc::new(console)))?;
    log::debug!("process {pid}: console input on fd {fd}");
    Ok(pid)
}

/// Picks the I/O APICs when the machine has them and `pic` was not given,
/// otherwise the legacy PIC. The PIC is remapped either way so that stray
/// legacy interrupts land on their own vectors.
fn build_controller(
    memory: &Memory,
    platform: &Platform,
    config: &KernelConfig<'_>,
    lapic: Lapic,
    bsp_apic_id: u8,
) -> Controller {
    let mut pic = Pic8259::new(Ports);
    pic.init(LEGACY_VECTOR_BASE);
    if config.force_pic || !platform.has_io_apic() {
        log::info!("interrupts: legacy PIC");
        return Controller::Pic(pic);
    }
    pic.disable();

    let mut controller = IoApicController::new(lapic, bsp_apic_id);
    for info in &platform.io_apics {
        let regs = mem::map_device(
            memory.mm,
            &memory.kernel_space,
            PhysicalAddress::new(info.address as usize),
        );
        // SAFETY: `map_device` mapped the register window uncached.
        let apic = IoApic::new(unsafe { MmioIoApic::new(regs) }, info.gsi_base);
        log::debug!(
            "I/O APIC {} at {:#x}: GSIs {}..{}",
            apic.id(),
            info.address,
            apic.gsi_base(),
            apic.gsi_base() + apic.pins()
        );
        controller.add_ioapic(apic);
    }
    for iso in &platform.overrides {
        controller.add_override(*iso);
    }
    log::info!("interrupts: {} I/O APICs", platform.io_apics.len());
    Controller::IoApic(controller)
}

/// Runs on each application processor once its trampoline reached long
/// mode. The parameter block may be reused as soon as `signal_ready` runs.
extern "C" fn ap_main(params: &irq::StartupParameters) -> ! {
    let index = params.cpu_index as usize;
    let kernel = kernel();
    let mut lapic = kernel.lapic;
    lapic.enable();
    arch::init_cpu(index, lapic.id());
    params.signal_ready();

    lapic.start_timer(kernel.timer_hz);
    log::info!("CPU {index} (APIC ID {}) online", lapic.id());
    arch::yield_now();
    panic!("CPU {index} resumed its boot context");
}

extern "C" fn idle_loop(cpu: u64) -> ! {
    log::trace!("CPU {cpu} idle");
    loop {
        arch::wait_for_interrupt();
    }
}
