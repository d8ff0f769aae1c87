//! Architecture-specific context switching
//!
//! Saving and restoring the callee-saved register set is the entire cost of
//! a task switch; no kernel involvement.

/// Callee-saved register set captured at a voluntary switch point.
///
/// Field order is load-bearing: the assembly addresses fields by fixed
/// offsets from the struct base.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context};
    }
}
