//! x86_64 context switching implementation
//!
//! Uses inline assembly for context switch.
//! Naked functions are stable in Rust 1.88+.

use super::Context;
use std::arch::naked_asm;

/// Initialize a new task's context.
///
/// Sets up the stack so that the first switch into this context begins at
/// the entry trampoline, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `regs` must point to valid `Context` memory. `stack_top` must point one
/// past the end of a writable stack region.
#[inline]
pub unsafe fn init_context(
    regs: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // The trampoline's `call` pushes a return address, so entering the
    // trampoline with rsp 16-byte aligned leaves the task body at the
    // rsp % 16 == 8 state the System V AMD64 ABI requires; SSE spills in
    // the body fault otherwise.
    let sp = stack_top as usize;
    let aligned_sp = sp & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = task_entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64; // Entry function
    regs.r13 = entry_arg as u64; // Entry argument
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function is expected to switch away permanently instead of
/// returning; the trap instruction catches a return that must not happen.
#[unsafe(naked)]
pub unsafe extern "C" fn task_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Perform a voluntary context switch.
///
/// Saves callee-saved registers to `old_regs` and loads from `new_regs`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_regs: *mut Context, _new_regs: *const Context) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for saved context
        "1:",
        "ret",
    );
}
