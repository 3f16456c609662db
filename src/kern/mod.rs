//! Kern subsystem - Core kernel primitives
//!
//! One lock-protected [`KernelData`] that every subsystem extends with
//! its own operations.

pub mod id_alloc;
pub mod irq;
pub mod kernel;
pub mod object;
pub mod pd;
pub mod processor;
pub mod scheduler;
pub mod signal;
pub mod smp;
pub mod syscall_sw;
pub mod thread;
pub mod timer;
pub mod vm;

#[cfg(test)]
pub(crate) mod testing;

pub use irq::Irq;
pub use kernel::{Kernel, KernelData, Proceed};
pub use object::{KernelObject, ObjectKind, ObjectTable};
pub use pd::Pd;
pub use processor::{Cpu, ProcessorState};
pub use scheduler::Scheduler;
pub use signal::{SignalContext, SignalReceiver};
pub use syscall_sw::{call_stats, CallId, CallStatsSnapshot};
pub use thread::{Thread, ThreadState};
pub use vm::Vm;
