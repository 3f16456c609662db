//! Inter-Process Communication
//!
//! Synchronous request/reply between threads, the message buffers they
//! exchange and the per-PD capability spaces selectors are resolved in.

pub mod message;
pub mod node;
pub mod space;

pub use message::{label, Label, Message, Signal, Utcb};
pub use node::{IpcNode, IpcState};
pub use space::CapSpace;
