//! Processor Management
//!
//! One [`Cpu`] per physical processor.
//! A CPU owns its scheduler, its timeout queue and the queue of
//! translation invalidations other CPUs asked it to perform.

use alloc::collections::VecDeque;

use super::scheduler::Scheduler;
use super::smp::Invalidation;
use super::timer::TimeoutQueue;
use crate::types::{CpuId, ObjectId};

// ============================================================================
// Processor State
// ============================================================================

/// What a CPU does between two kernel passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessorState {
    /// Waiting for an interrupt
    Idle = 0,
    /// Executing a user job
    Running = 1,
}

// ============================================================================
// Cpu
// ============================================================================

/// Physical processor
#[derive(Debug)]
pub struct Cpu {
    id: CpuId,
    /// Local priority/time-slice scheduler
    pub scheduler: Scheduler,
    /// Job proceeded to at the end of the last kernel pass
    pub running: Option<ObjectId>,
    /// An IPI to this CPU is in flight
    pub ipi_pending: bool,
    /// Timer value at the last kernel entry
    pub last_us: u64,
    /// Number of kernel passes executed
    pub passes: u64,
    /// Armed thread timeouts
    pub timeouts: TimeoutQueue,
    /// Translation invalidations requested by other CPUs
    pub invalidations: VecDeque<Invalidation>,
}

impl Cpu {
    pub fn new(id: CpuId, quantum_us: u64) -> Self {
        Self {
            id,
            scheduler: Scheduler::new(quantum_us),
            running: None,
            ipi_pending: false,
            last_us: 0,
            passes: 0,
            timeouts: TimeoutQueue::new(),
            invalidations: VecDeque::new(),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn state(&self) -> ProcessorState {
        if self.running.is_some() {
            ProcessorState::Running
        } else {
            ProcessorState::Idle
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state() == ProcessorState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[test]
    fn test_cpu_state_follows_running_job() {
        let mut cpu = Cpu::new(CpuId(3), 1000);
        assert_eq!(cpu.id(), CpuId(3));
        assert!(cpu.is_idle());

        cpu.scheduler.ready(ObjectId(9), Priority::new(1));
        cpu.running = cpu.scheduler.schedule();
        assert_eq!(cpu.state(), ProcessorState::Running);
        assert_eq!(cpu.running, Some(ObjectId(9)));
    }
}
