//! Real-mode entry code for application processors.
//!
//! The bytes between `ap_trampoline_start` and `ap_trampoline_end` are
//! copied to [`TRAMPOLINE_ADDRESS`] and run there after the STARTUP IPI. They
//! switch to long mode on the page tables named in the parameter block, load
//! its stack and call its entry with the block's address in `rdi`. Both low
//! pages must be identity-mapped in those page tables.

use core::arch::global_asm;

use irq::{STARTUP_PARAMETERS_ADDRESS, TRAMPOLINE_ADDRESS, startup_offsets};

global_asm!(
    r#"
    .pushsection .rodata.ap_trampoline, "a"
    .global ap_trampoline_start
    .global ap_trampoline_end
    .code16
ap_trampoline_start:
    cli
    cld
    xorw %ax, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    lgdtl ({tramp} + (tramp_gdt_ptr - ap_trampoline_start))
    movl %cr0, %eax
    orl $1, %eax
    movl %eax, %cr0
    ljmpl $0x08, $({tramp} + (tramp_protected - ap_trampoline_start))

    .code32
tramp_protected:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movl %cr4, %eax
    orl $(1 << 5), %eax
    movl %eax, %cr4
    movl ({params} + {page_table_root}), %eax
    movl %eax, %cr3
    movl $0xC0000080, %ecx
    rdmsr
    orl $((1 << 8) | (1 << 11)), %eax
    wrmsr
    movl %cr0, %eax
    orl $0x80000000, %eax
    movl %eax, %cr0
    ljmpl $0x18, $({tramp} + (tramp_long - ap_trampoline_start))

    .code64
tramp_long:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movq ({params} + {stack_top}), %rsp
    movq ${params}, %rdi
    movq ({params} + {entry}), %rax
    callq *%rax
1:
    cli
    hlt
    jmp 1b

    .balign 8
tramp_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF
    .quad 0x00CF92000000FFFF
    .quad 0x00AF9A000000FFFF
tramp_gdt_ptr:
    .word tramp_gdt_ptr - tramp_gdt - 1
    .long {tramp} + (tramp_gdt - ap_trampoline_start)
ap_trampoline_end:
    .popsection
"#,
    tramp = const TRAMPOLINE_ADDRESS,
    params = const STARTUP_PARAMETERS_ADDRESS,
    page_table_root = const startup_offsets::PAGE_TABLE_ROOT,
    stack_top = const startup_offsets::STACK_TOP,
    entry = const startup_offsets::ENTRY,
    options(att_syntax)
);

unsafe extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
}

/// The trampoline's machine code.
pub fn trampoline_code() -> &'static [u8] {
    let start = &raw const ap_trampoline_start;
    let end = &raw const ap_trampoline_end;
    // SAFETY: both symbols delimit one read-only blob in the kernel image.
    unsafe { core::slice::from_raw_parts(start, end as usize - start as usize) }
}
