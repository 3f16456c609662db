//! basehw_r - A Rust implementation of the base-hw kernel core
//!
//! This crate provides the scheduling, thread, IPC, signal and protection
//! domain core of a capability-based multiprocessor microkernel in the
//! style of Genode's base-hw kernel. Boards plug in their interrupt
//! controller, timers and translation tables through the traits in
//! [`board`].

#![cfg_attr(not(test), no_std)]

// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Hardware register code often uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]
// Kernel code often needs explicit casts for register words
#![allow(clippy::unnecessary_cast)]
// Call handlers take one parameter per argument register
#![allow(clippy::too_many_arguments)]

extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Hardware seams
pub mod arch;
pub mod board;
pub mod trap;

// Kernel core
pub mod console;
pub mod ipc;
pub mod kern;

pub use config::KernelConfig;
pub use error::{KernResult, KernelError};
pub use kern::kernel::{init, kernel, Kernel, Proceed};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "basehw_r";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "basehw_r");
        assert!(!VERSION.is_empty());
    }
}
