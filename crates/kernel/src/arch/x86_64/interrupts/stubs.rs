//! Trap entry and exit.
//!
//! Every vector has a 16-byte stub that pushes a zero error code (unless the
//! CPU pushed a real one) and the vector number, then joins `isr_common`.
//! The common path pushes the general-purpose registers, `cr3`, `es`, `ds`
//! and, in debug builds, the stack canary, giving exactly the layout of
//! [`sched::RegisterFrame`]. It hands the frame to `trap_dispatch`, switches
//! to whatever frame comes back and pops it in reverse, checking the canary
//! first and reloading `cr3` only when it changes.

use core::arch::global_asm;

use sched::{GPR_OFFSET, KERNEL_DS, STACK_CANARY};

pub const STUB_SIZE: usize = 16;

/// Words below `ds` in a saved frame: one with the canary, none without.
const CANARY_WORDS: usize = GPR_OFFSET / 8 - 3;

global_asm!(
    r#"
    .pushsection .text.isr, "ax"
    .balign 16
    .global isr_stubs
isr_stubs:
    .set vector, 0
    .rept 256
    .balign 16
    .if vector == 8 || (vector >= 10 && vector <= 14) || vector == 17 || vector == 21 || vector == 29 || vector == 30
    .else
    pushq $0
    .endif
    pushq $vector
    jmp isr_common
    .set vector, vector + 1
    .endr

isr_common:
    cld
    testb $3, 24(%rsp)
    jz 1f
    swapgs
1:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    movq %cr3, %rax
    pushq %rax
    xorl %eax, %eax
    movw %es, %ax
    pushq %rax
    movw %ds, %ax
    pushq %rax
    .if {canary_words}
    movabsq ${canary}, %rax
    pushq %rax
    .endif
    movw ${kernel_ds}, %ax
    movw %ax, %ds
    movw %ax, %es

    movq %rsp, %rdi
    andq $-16, %rsp
    call trap_dispatch
    movq %rax, %rsp

    .if {canary_words}
    popq %rax
    movabsq ${canary}, %rcx
    cmpq %rcx, %rax
    jne 4f
    .endif
    popq %rax
    movw %ax, %ds
    popq %rax
    movw %ax, %es
    popq %rax
    movq %cr3, %rcx
    cmpq %rax, %rcx
    je 2f
    movq %rax, %cr3
2:
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax
    addq $16, %rsp
    testb $3, 8(%rsp)
    jz 3f
    swapgs
3:
    iretq

4:
    leaq -8(%rsp), %rdi
    andq $-16, %rsp
    call trap_canary_smashed
    ud2
    .popsection
"#,
    canary_words = const CANARY_WORDS,
    canary = const STACK_CANARY,
    kernel_ds = const KERNEL_DS,
    options(att_syntax)
);
