//! aarch64 context switching implementation
//!
//! TODO: port the x86_64 switch to ARM64 (x19-x28, fp, lr, sp, d8-d15).

use super::Context;

/// Initialize a new task's context.
pub unsafe fn init_context(
    _regs: *mut Context,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 init_context not yet implemented")
}

/// Perform a voluntary context switch.
pub unsafe extern "C" fn context_switch(_old_regs: *mut Context, _new_regs: *const Context) {
    todo!("aarch64 context_switch not yet implemented")
}
