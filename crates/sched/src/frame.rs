//! The saved register file.
//!
//! Trap entry pushes, from high to low addresses: the CPU's interrupt frame
//! (`ss`, `rsp`, `rflags`, `cs`, `rip`), an error code (real or zero), the
//! vector, the fifteen general-purpose registers, `cr3`, `es`, `ds` and, in
//! debug builds, a canary. The pointer to the lowest word is a
//! `*mut RegisterFrame`; exit pops the same layout in reverse, checking the
//! canary first. A thread that is not running is nothing more than a
//! pointer to one of these on its kernel stack.

use core::mem::{offset_of, size_of};

/// Written below every saved frame in debug builds.
pub const STACK_CANARY: u64 = 0x5445_524E_5354_4B43;

pub const KERNEL_CS: u64 = 0x08;
pub const KERNEL_DS: u64 = 0x10;
pub const USER_DS: u64 = 0x18 | 3;
pub const USER_CS: u64 = 0x20 | 3;

const RFLAGS_RESERVED: u64 = 1 << 1;
const RFLAGS_IF: u64 = 1 << 9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegisterFrame {
    #[cfg(debug_assertions)]
    pub canary: u64,
    pub ds: u64,
    pub es: u64,
    pub cr3: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const CANARY_WORDS: usize = if cfg!(debug_assertions) { 1 } else { 0 };

/// Offset of the general-purpose block, where the stub's `cr3` slot ends.
pub const GPR_OFFSET: usize = offset_of!(RegisterFrame, r15);
/// Offset of the CPU-pushed interrupt frame.
pub const IRET_OFFSET: usize = offset_of!(RegisterFrame, rip);

const _: () = assert!(size_of::<RegisterFrame>() == (CANARY_WORDS + 25) * 8);
const _: () = assert!(offset_of!(RegisterFrame, ds) == CANARY_WORDS * 8);
const _: () = assert!(offset_of!(RegisterFrame, cr3) == (CANARY_WORDS + 2) * 8);
const _: () = assert!(GPR_OFFSET == (CANARY_WORDS + 3) * 8);
const _: () = assert!(offset_of!(RegisterFrame, vector) == (CANARY_WORDS + 18) * 8);
const _: () = assert!(IRET_OFFSET == (CANARY_WORDS + 20) * 8);

impl RegisterFrame {
    fn blank(cr3: u64) -> Self {
        Self {
            #[cfg(debug_assertions)]
            canary: STACK_CANARY,
            cr3,
            rflags: RFLAGS_RESERVED | RFLAGS_IF,
            ..Default::default()
        }
    }

    /// A ring-0 thread entering `entry(arg)` with interrupts enabled.
    ///
    /// `stack_top` must be 16-byte aligned; the entry sees it minus one
    /// word, as if it had been called.
    pub fn new_kernel(entry: u64, arg: u64, stack_top: u64, cr3: u64) -> Self {
        Self {
            ds: KERNEL_DS,
            es: KERNEL_DS,
            rip: entry,
            rdi: arg,
            cs: KERNEL_CS,
            rsp: stack_top - 8,
            ss: KERNEL_DS,
            ..Self::blank(cr3)
        }
    }

    /// A ring-3 thread entering `entry` on `user_stack`.
    pub fn new_user(entry: u64, user_stack: u64, cr3: u64) -> Self {
        Self {
            ds: USER_DS,
            es: USER_DS,
            rip: entry,
            cs: USER_CS,
            rsp: user_stack,
            ss: USER_DS,
            ..Self::blank(cr3)
        }
    }

    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// # Panics
    ///
    /// Panics in debug builds if the canary below the frame was overwritten.
    pub fn check_canary(&self) {
        #[cfg(debug_assertions)]
        if self.canary != STACK_CANARY {
            panic!(
                "stack canary corrupted: found {:#018x} in frame at {:p}",
                self.canary, self
            );
        }
    }

    pub fn syscall_number(&self) -> u64 {
        self.rax
    }

    /// System-call argument `n` (0..6): `rdi`, `rsi`, `rdx`, `r10`, `r8`, `r9`.
    pub fn arg(&self, n: usize) -> u64 {
        match n {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.r10,
            4 => self.r8,
            5 => self.r9,
            _ => panic!("system calls take at most six arguments"),
        }
    }

    pub fn set_return(&mut self, value: isize) {
        self.rax = value as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_frame_enters_ring_zero() {
        let frame = RegisterFrame::new_kernel(0xFFFF_8000_0010_0000, 7, 0x9000, 0x5000);
        assert!(!frame.is_user());
        assert_eq!(frame.rdi, 7);
        assert_eq!(frame.rsp, 0x8FF8);
        assert_eq!(frame.cr3, 0x5000);
        assert_eq!(frame.rflags & RFLAGS_IF, RFLAGS_IF);
        frame.check_canary();
    }

    #[test]
    fn user_frame_enters_ring_three() {
        let frame = RegisterFrame::new_user(0x40_1000, 0x7FFF_F000, 0x6000);
        assert!(frame.is_user());
        assert_eq!(frame.ss & 3, 3);
        assert_eq!(frame.rsp, 0x7FFF_F000);
    }

    #[test]
    fn syscall_arguments_follow_the_register_convention() {
        let mut frame = RegisterFrame {
            rax: 3,
            rdi: 10,
            rsi: 11,
            rdx: 12,
            r10: 13,
            r8: 14,
            r9: 15,
            ..Default::default()
        };
        assert_eq!(frame.syscall_number(), 3);
        assert_eq!((0..6).map(|n| frame.arg(n)).collect::<Vec<_>>(), [10, 11, 12, 13, 14, 15]);
        frame.set_return(-9);
        assert_eq!(frame.rax as i64, -9);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "stack canary corrupted")]
    fn smashed_canary_panics() {
        let mut frame = RegisterFrame::new_kernel(0, 0, 0x1000, 0);
        frame.canary = 0x4141_4141_4141_4141;
        frame.check_canary();
    }
}
