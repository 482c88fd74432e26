#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod core_ctx;
pub mod debug;
pub mod dtb;
pub mod error;
pub mod exception;
pub mod gdb;
pub mod guest_memory;
pub mod hypervisor;
pub mod irq_manager;
pub mod platform;
pub mod sync;
pub mod uart;
pub mod vgic;
pub mod vtimer;

// Note: println! macro is exported at the crate root via #[macro_export]
// It can be used as: use thermosphere::println;

pub use hypervisor::Hypervisor;
