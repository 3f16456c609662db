//! Board collaborators
//!
//! The kernel core drives the interrupt controller, the per-CPU timer and
//! the translation-table backend only through the traits below. Register
//! level drivers live with the board; [`soft`] provides in-memory
//! implementations for hosted runs.

pub mod soft;

use alloc::boxed::Box;

use crate::types::{CpuId, IrqLine, Word};

/// Interrupt controller
pub trait Pic: Send {
    /// Mask `line` on all CPUs
    fn mask(&mut self, line: IrqLine);

    /// Unmask `line` and route it to `cpu`
    fn unmask(&mut self, line: IrqLine, cpu: CpuId);

    /// Take the highest pending request of `cpu`, if any
    fn take_request(&mut self, cpu: CpuId) -> Option<IrqLine>;

    /// Raise an inter-processor interrupt on `cpu`
    fn send_ipi(&mut self, cpu: CpuId);

    /// Line on which inter-processor interrupts arrive
    fn ipi_line(&self) -> IrqLine;
}

/// Per-CPU scheduling timer
pub trait Timer: Send {
    /// Monotonic time of `cpu` in microseconds
    fn now_us(&self, cpu: CpuId) -> u64;

    /// Interrupt line of the timer of `cpu`
    fn irq_line(&self, cpu: CpuId) -> IrqLine;

    /// Program the next timer interrupt of `cpu` to fire after `tick_us`
    fn configure(&mut self, cpu: CpuId, tick_us: u64);

    /// Longest interval `configure` accepts
    fn max_timeout_us(&self) -> u64;
}

/// Translation attributes of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapFlags {
    pub writable: bool,
    pub executable: bool,
}

/// Failure of a translation-table update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// Address or size not aligned to the translation granule
    Misaligned,
    /// Range overlaps an existing mapping
    Overlap,
    /// Backing memory for tables exhausted
    NoMemory,
}

/// Translation-table backend
pub trait Mmu: Send {
    /// Insert a mapping of `size` bytes into the table rooted at `root`
    fn insert(
        &mut self,
        root: Word,
        vaddr: Word,
        paddr: Word,
        size: Word,
        flags: MapFlags,
    ) -> Result<(), MmuError>;

    /// Remove all mappings in the given virtual range
    fn remove(&mut self, root: Word, vaddr: Word, size: Word);

    /// Drop cached translations of `asid` on `cpu`
    fn invalidate(&mut self, cpu: CpuId, asid: u32);
}

/// The set of collaborators a kernel instance drives
pub struct Board {
    pub pic: Box<dyn Pic>,
    pub timer: Box<dyn Timer>,
    pub mmu: Box<dyn Mmu>,
}

impl Board {
    pub fn new(pic: Box<dyn Pic>, timer: Box<dyn Timer>, mmu: Box<dyn Mmu>) -> Self {
        Self { pic, timer, mmu }
    }
}

impl core::fmt::Debug for Board {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Board")
            .field("ipi_line", &self.pic.ipi_line())
            .finish()
    }
}
