//! Boot entry: multiboot v1 header and the assembly trampoline into
//! `kernel_main`.
//!
//! The loader (GRUB, or QEMU's `-kernel`) finds the header below in the
//! first 8 KiB of the image, loads the ELF at 1 MiB and jumps to `_start`
//! with the info-structure pointer in `ebx` and the boot magic in `eax`.

pub mod multiboot;

pub use multiboot::{MultibootInfo, MULTIBOOT_BOOTLOADER_MAGIC};

use core::arch::global_asm;

global_asm!(
    r#"
    .section .multiboot, "a"
    .align 4
    .long 0x1badb002            # magic
    .long 0x00000003            # flags: page-align modules, want mem_*
    .long -(0x1badb002 + 0x00000003)

    .section .bss
    .align 16
    boot_stack_bottom:
    .skip 64 * 1024
    boot_stack_top:

    .section .text
    .global _start
    _start:
        mov esp, offset boot_stack_top
        push eax                # multiboot magic
        push ebx                # multiboot info pointer
        call kernel_main
    1:
        cli
        hlt
        jmp 1b
    "#
);
