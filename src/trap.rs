//! Kernel entry causes
//!
//! Every kernel pass starts with exactly one [`Trap`], decoded by the
//! architecture layer from the exception that brought the CPU into the
//! kernel. The trap is attributed to the job that was running on that CPU.

use crate::types::Word;

/// Class of a synchronous user fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FaultKind {
    /// Translation or permission fault on a data access
    PageFault = 1,
    /// Translation or permission fault on an instruction fetch
    InstructionFault = 2,
    /// Undefined or illegal instruction
    Undefined = 3,
    /// Misaligned PC or SP
    Alignment = 4,
}

impl FaultKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::PageFault => "page fault",
            Self::InstructionFault => "instruction fault",
            Self::Undefined => "undefined instruction",
            Self::Alignment => "alignment fault",
        }
    }

    /// Faults that a pager can resolve by installing a mapping
    pub fn is_mmu_fault(self) -> bool {
        matches!(self, Self::PageFault | Self::InstructionFault)
    }
}

/// Reason for entering the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Initial entry on a CPU, nothing to handle besides scheduling
    Reset,
    /// System call issued by the current thread
    Syscall,
    /// An interrupt is pending at the interrupt controller
    Interrupt,
    /// Synchronous fault of the current thread
    Fault {
        kind: FaultKind,
        addr: Word,
        write: bool,
    },
    /// Exit of the currently running virtual machine
    VmExit { reason: Word },
}

impl Trap {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Syscall => "syscall",
            Self::Interrupt => "interrupt",
            Self::Fault { .. } => "fault",
            Self::VmExit { .. } => "vm exit",
        }
    }
}
