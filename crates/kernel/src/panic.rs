//! The panic path: report, backtrace, stop every CPU.
//!
//! Output goes straight to the serial port. The console lock may be held by
//! the code that panicked.

use core::{
    fmt::Write,
    panic::PanicInfo,
    sync::atomic::{AtomicBool, Ordering},
};

use bootinfo::SymbolTable;
use irq::{IpiCommand, LocalApic};

use crate::{arch, console::Console, os_services, serial::SerialWriter, try_kernel};

/// Return addresses printed before giving up on the chain.
const MAX_FRAMES: usize = 32;
/// Kernel stacks all live in the higher half.
const KERNEL_HALF_BASE: usize = 0xFFFF_8000_0000_0000;

static PANICKING: AtomicBool = AtomicBool::new(false);

pub fn is_panicking() -> bool {
    PANICKING.load(Ordering::Acquire)
}

pub fn handle_panic(info: &PanicInfo) -> ! {
    arch::disable_interrupts();
    if PANICKING.swap(true, Ordering::AcqRel) {
        // Another CPU got here first, or the panic path itself panicked.
        arch::park();
    }

    // Before the serial port is set up there is nowhere to report to.
    if Console::default().has_output() {
        // SAFETY: this is the panic path; interleaving with a console
        // writer that was interrupted is acceptable.
        let mut out = unsafe { SerialWriter::steal() };
        report(&mut out, info);
    }

    if let Some(kernel) = try_kernel() {
        let mut lapic = kernel.lapic;
        lapic.send_ipi(IpiCommand::halt_others());
    }
    arch::park();
}

fn report(out: &mut impl Write, info: &PanicInfo) {
    match arch::PerCpu::try_current() {
        Some(cpu) => {
            let _ = writeln!(
                out,
                "\n[PANIC] CPU {} (APIC ID {}): {}",
                cpu.index(),
                cpu.apic_id(),
                info.message()
            );
        }
        None => {
            let _ = writeln!(out, "\n[PANIC] {}", info.message());
        }
    }
    if let Some(location) = info.location() {
        let _ = writeln!(out, " at {location}");
    }
    let uptime = os_services::monotonic_ns();
    let _ = writeln!(out, "uptime {}.{:09}s", uptime / 1_000_000_000, uptime % 1_000_000_000);

    let symbols = try_kernel().map_or(SymbolTable::empty(), |kernel| kernel.symbols);
    backtrace(out, arch::frame_pointer(), &symbols);
    let _ = writeln!(out, "CPU parked");
}

/// Follows the saved-`rbp` chain from `rbp`. Stops at the first frame
/// pointer outside the kernel half, misaligned, or not moving up the stack.
fn backtrace(out: &mut impl Write, mut rbp: usize, symbols: &SymbolTable<'_>) {
    let _ = writeln!(out, "backtrace:");
    for depth in 0..MAX_FRAMES {
        if rbp < KERNEL_HALF_BASE || rbp % 8 != 0 {
            break;
        }
        // SAFETY: kernel code is built with frame pointers, so `rbp` points
        // at a saved `rbp` with the return address above it.
        let (next, ret) = unsafe {
            let frame = rbp as *const usize;
            (frame.read(), frame.add(1).read())
        };
        if ret == 0 {
            break;
        }
        let _ = match symbols.lookup(ret as u64) {
            Some(symbol) => writeln!(
                out,
                "  {depth:2}: {ret:#018x} {}+{:#x}",
                symbol.name, symbol.offset
            ),
            None => writeln!(out, "  {depth:2}: {ret:#018x} <unknown>"),
        };
        if next <= rbp {
            break;
        }
        rbp = next;
    }
}
