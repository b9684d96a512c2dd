//! Trap dispatch.
//!
//! Every vector funnels through [`dispatch`] with the frame the entry stub
//! just pushed. The return value is the frame to resume: the same one, or
//! another thread's when the scheduler switched.

use irq::{IoApicController, IrqController, IrqError, LocalApic, Pic8259};
use sched::{RegisterFrame, Signal, SyscallContext};

use crate::{
    Kernel,
    arch::{self, Lapic, MmioIoApic, PerCpu, Ports},
};

#[macro_export]
macro_rules! interrupt_vectors {
    (
        $storage: ty,
        $(
            $name:ident = $value:expr,
        )*
    ) => {
        /// Represents an interrupt vector.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct InterruptVector($storage);

        impl InterruptVector {
            $(
                pub const $name: Self = Self($value);
            )*

            /// Creates a new interrupt vector from a raw value.
            pub const fn new(value: $storage) -> Self {
                Self(value)
            }

            /// Returns the raw value of the interrupt vector.
            pub const fn value(&self) -> $storage {
                self.0
            }

            /// Returns the name of the interrupt vector, if known.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl core::fmt::Debug for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "InterruptVector::{}({})", name, self.0)
                } else {
                    write!(f, "InterruptVector({})", self.0)
                }
            }
        }

        impl core::fmt::Display for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "vector {:#x}", self.0)
                }
            }
        }
    }
}

interrupt_vectors! {
    u8,
    DIVIDE_ERROR = 0,
    DEBUG = 1,
    NON_MASKABLE_INTERRUPT = 2,
    BREAKPOINT = 3,
    OVERFLOW = 4,
    BOUND_RANGE_EXCEEDED = 5,
    INVALID_OPCODE = 6,
    DEVICE_NOT_AVAILABLE = 7,
    DOUBLE_FAULT = 8,
    INVALID_TSS = 10,
    SEGMENT_NOT_PRESENT = 11,
    STACK_SEGMENT_FAULT = 12,
    GENERAL_PROTECTION_FAULT = 13,
    PAGE_FAULT = 14,
    X87_FLOATING_POINT = 16,
    ALIGNMENT_CHECK = 17,
    MACHINE_CHECK = 18,
    SIMD_FLOATING_POINT = 19,
    VIRTUALIZATION = 20,
    CONTROL_PROTECTION = 21,
    SYSCALL = 0x80,
    YIELD = 0x81,
    TIMER = 0xEF,
    SPURIOUS = 0xFF,
}

const _: () = assert!(InterruptVector::SYSCALL.value() == irq::SYSCALL_VECTOR);
const _: () = assert!(InterruptVector::YIELD.value() == irq::YIELD_VECTOR);
const _: () = assert!(InterruptVector::TIMER.value() == irq::TIMER_VECTOR);
const _: () = assert!(InterruptVector::SPURIOUS.value() == irq::SPURIOUS_VECTOR);

impl InterruptVector {
    pub const fn is_exception(&self) -> bool {
        self.0 < 32
    }

    /// The signal a fault in ring 3 turns into. `None` for exceptions user
    /// code cannot cause on its own.
    pub fn user_signal(&self) -> Option<Signal> {
        match *self {
            Self::DIVIDE_ERROR | Self::X87_FLOATING_POINT | Self::SIMD_FLOATING_POINT => {
                Some(Signal::SIGFPE)
            }
            Self::INVALID_OPCODE | Self::DEVICE_NOT_AVAILABLE => Some(Signal::SIGILL),
            Self::DEBUG | Self::BREAKPOINT => Some(Signal::SIGTRAP),
            Self::ALIGNMENT_CHECK => Some(Signal::SIGBUS),
            Self::OVERFLOW
            | Self::BOUND_RANGE_EXCEEDED
            | Self::SEGMENT_NOT_PRESENT
            | Self::STACK_SEGMENT_FAULT
            | Self::GENERAL_PROTECTION_FAULT
            | Self::PAGE_FAULT => Some(Signal::SIGSEGV),
            _ => None,
        }
    }
}

/// The device interrupt controller picked at boot.
pub enum Controller {
    Pic(Pic8259<Ports>),
    IoApic(IoApicController<MmioIoApic, Lapic>),
}

impl IrqController for Controller {
    fn fixed_vector(&self, gsi: u32) -> Option<u8> {
        match self {
            Self::Pic(pic) => pic.fixed_vector(gsi),
            Self::IoApic(ioapic) => ioapic.fixed_vector(gsi),
        }
    }

    fn route(&mut self, gsi: u32, vector: u8) -> Result<(), IrqError> {
        match self {
            Self::Pic(pic) => pic.route(gsi, vector),
            Self::IoApic(ioapic) => ioapic.route(gsi, vector),
        }
    }

    fn unroute(&mut self, gsi: u32) {
        match self {
            Self::Pic(pic) => pic.unroute(gsi),
            Self::IoApic(ioapic) => ioapic.unroute(gsi),
        }
    }

    fn eoi(&mut self, vector: u8) {
        match self {
            Self::Pic(pic) => IrqController::eoi(pic, vector),
            Self::IoApic(ioapic) => IrqController::eoi(ioapic, vector),
        }
    }
}

/// Handles one trap and returns the frame to resume.
pub fn dispatch(frame: *mut RegisterFrame) -> *mut RegisterFrame {
    // SAFETY: the stub hands over the frame it just pushed on this CPU's
    // stack; nothing else refers to it until we return.
    let regs = unsafe { &*frame };
    let vector = InterruptVector::new(regs.vector as u8);

    if vector == InterruptVector::NON_MASKABLE_INTERRUPT {
        // Other CPUs send NMIs only to stop this one after a panic.
        if crate::panic::is_panicking() {
            arch::park();
        }
        log::warn!("unexpected NMI at {:#x}", regs.rip);
        return frame;
    }

    let Some(kernel) = crate::try_kernel() else {
        fatal(vector, regs);
    };
    let cpu = PerCpu::current();

    match vector {
        v if v.is_exception() => exception(kernel, cpu, frame, v),
        InterruptVector::TIMER => {
            let mut lapic = kernel.lapic;
            lapic.eoi();
            let ticks = cpu.tick();
            if cpu.index() == 0 {
                kernel.scheduler.tick(ticks * kernel.tick_ns);
            }
            reschedule(kernel, cpu, frame)
        }
        InterruptVector::SYSCALL => syscall(kernel, cpu, frame),
        InterruptVector::YIELD => reschedule(kernel, cpu, frame),
        InterruptVector::SPURIOUS => frame,
        v if kernel.msi.contains(v.value()) => {
            kernel.msi.handle(v.value());
            let mut lapic = kernel.lapic;
            lapic.eoi();
            frame
        }
        v => {
            kernel.router.irq_handle(v.value());
            frame
        }
    }
}

fn exception(
    kernel: &'static Kernel,
    cpu: &PerCpu,
    frame: *mut RegisterFrame,
    vector: InterruptVector,
) -> *mut RegisterFrame {
    // SAFETY: see `dispatch`.
    let regs = unsafe { &*frame };
    let signal = vector.user_signal().filter(|_| regs.is_user());
    let thread = kernel.scheduler.current(cpu.index());
    let (Some(signal), Some(thread)) = (signal, thread) else {
        fatal(vector, regs);
    };

    if vector == InterruptVector::PAGE_FAULT {
        log::debug!(
            "CPU {}: user page fault at {:#x} (rip {:#x}, error {:#x})",
            cpu.index(),
            arch::page_fault_address(),
            regs.rip,
            regs.error_code
        );
    } else {
        log::debug!("CPU {}: {vector} in user mode at {:#x}", cpu.index(), regs.rip);
    }
    kernel.scheduler.raise(thread, signal);
    reschedule(kernel, cpu, frame)
}

fn fatal(vector: InterruptVector, regs: &RegisterFrame) -> ! {
    if vector == InterruptVector::PAGE_FAULT {
        panic!(
            "{vector} at {:#x} accessing {:#x} (error {:#x})\n{regs:#x?}",
            regs.rip,
            arch::page_fault_address(),
            regs.error_code
        );
    }
    panic!(
        "{vector} at {:#x} (error {:#x})\n{regs:#x?}",
        regs.rip, regs.error_code
    );
}

fn syscall(kernel: &'static Kernel, cpu: &PerCpu, frame: *mut RegisterFrame) -> *mut RegisterFrame {
    let Some(thread) = kernel.scheduler.current(cpu.index()) else {
        panic!("system call on CPU {} with no current thread", cpu.index());
    };
    let pid = kernel.scheduler.pid_of(thread);
    let mut yield_now = || arch::yield_now();
    {
        // SAFETY: see `dispatch`. Nested traps taken by `yield_now` push
        // their frames below this one.
        let regs = unsafe { &mut *frame };
        let mut ctx = SyscallContext {
            scheduler: &kernel.scheduler,
            thread,
            pid,
            frame: regs,
            yield_now: &mut yield_now,
        };
        kernel.syscalls.dispatch(&mut ctx);
    }

    // Signals raised by the call itself are delivered before returning.
    if kernel.scheduler.has_pending_signal(thread) {
        reschedule(kernel, cpu, frame)
    } else {
        frame
    }
}

fn reschedule(kernel: &'static Kernel, cpu: &PerCpu, frame: *mut RegisterFrame) -> *mut RegisterFrame {
    let switch = kernel.scheduler.schedule(cpu.index(), frame as usize);
    cpu.set_kernel_stack(switch.kernel_stack_top as u64);
    switch.sp as *mut RegisterFrame
}
