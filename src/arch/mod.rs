//! Architecture-specific code
//!
//! Architectural definitions, register encodings and the trap frame are
//! plain data and always built; the EL2 implementations of the hardware
//! traits only exist in the bare-metal image.

pub mod decode;
pub mod defs;
pub mod frame;
pub mod gicv2;
pub mod traits;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod aarch64;

pub use frame::{ExceptionStackFrame, FpuRegisters};
pub use traits::*;
