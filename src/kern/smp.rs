//! Multiprocessor Coordination
//!
//! Translation updates of a PD must reach every CPU that may still cache
//! entries of it. The initiating thread invalidates locally, queues an
//! [`Invalidation`] on each other CPU in the PD's CPU mask and raises an
//! IPI there. It then waits in `AwaitsRestart` on a [`RestartBarrier`]
//! it owns. Each remote CPU performs the invalidation in its next kernel
//! pass and acknowledges; the last acknowledgement restarts the
//! initiator.
//!
//! Deleting a PD retires its ASID the same way. The ASID stays allocated
//! until every CPU that ran the PD has flushed it, so a new PD never
//! inherits stale entries.

use alloc::vec::Vec;

use super::kernel::KernelData;
use super::thread::ThreadState;
use crate::arch::CpuContext;
use crate::error::CALL_SUCCESS;
use crate::types::{CpuId, ObjRef, ObjectId};

/// Completion counter of one broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartBarrier {
    remaining: usize,
}

impl RestartBarrier {
    pub fn new(remaining: usize) -> Self {
        Self { remaining }
    }

    /// Count one acknowledgement, `true` once all have arrived
    pub fn ack(&mut self) -> bool {
        assert!(self.remaining > 0, "restart barrier: surplus acknowledgement");
        self.remaining -= 1;
        self.remaining == 0
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

/// Request to drop cached translations of one address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    pub asid: u32,
    /// Thread waiting for the acknowledgement
    pub initiator: ObjRef,
    /// The ASID belongs to a deleted PD and is freed after the last flush
    pub release: bool,
}

impl KernelData {
    /// Invalidate `pd` on all CPUs, `true` if `initiator` has to wait
    pub(crate) fn broadcast_invalidation(&mut self, initiator: ObjectId, pd: ObjectId) -> bool {
        let (asid, mask) = match self.objects.pd(pd) {
            Ok(pd) => (pd.asid, pd.cpu_mask),
            Err(_) => return false,
        };
        self.invalidate_everywhere(initiator, asid, mask, false)
    }

    /// Flush the ASID of a deleted PD on all CPUs in `mask` and free it
    /// once they are done, `true` if `initiator` has to wait
    pub(crate) fn retire_asid(&mut self, initiator: ObjectId, asid: u32, mask: u32) -> bool {
        self.invalidate_everywhere(initiator, asid, mask, true)
    }

    fn invalidate_everywhere(
        &mut self,
        initiator: ObjectId,
        asid: u32,
        mask: u32,
        release: bool,
    ) -> bool {
        let local = self.cpu;
        self.board.mmu.invalidate(local, asid);

        let remote: Vec<CpuId> = (0..self.cpus.len())
            .map(CpuId)
            .filter(|&cpu| cpu != local && mask & (1 << cpu.0) != 0)
            .collect();
        let initiator_ref = match self.objects.reference(initiator) {
            Some(obj) if !remote.is_empty() => obj,
            _ => {
                if release {
                    self.asids.free(asid);
                }
                return false;
            }
        };
        if release {
            self.retiring_asids.insert(asid, remote.len());
        }
        for &cpu in &remote {
            self.cpus[cpu.0].invalidations.push_back(Invalidation {
                asid,
                initiator: initiator_ref,
                release,
            });
            self.kick(cpu);
        }
        if let Ok(thread) = self.objects.thread_mut(initiator) {
            thread.barrier = Some(RestartBarrier::new(remote.len()));
        }
        log::debug!(
            "{}: tlb broadcast for asid {} to {} cpu(s)",
            self.label_of(initiator),
            asid,
            remote.len()
        );
        self.set_state(initiator, ThreadState::AwaitsRestart);
        true
    }

    /// Count one flush of a retiring ASID, freeing it after the last
    fn release_asid(&mut self, asid: u32) {
        let remaining = match self.retiring_asids.get_mut(&asid) {
            Some(remaining) => {
                *remaining -= 1;
                *remaining
            }
            None => return,
        };
        if remaining == 0 {
            self.retiring_asids.remove(&asid);
            self.asids.free(asid);
            log::debug!("asid {} released", asid);
        }
    }

    /// Perform the invalidations queued for `cpu` and acknowledge them
    pub(crate) fn service_invalidations(&mut self, cpu: CpuId) {
        while let Some(request) = self.cpus[cpu.0].invalidations.pop_front() {
            self.board.mmu.invalidate(cpu, request.asid);
            if request.release {
                self.release_asid(request.asid);
            }
            let initiator = match self.objects.resolve(request.initiator) {
                Some(id) => id,
                None => continue,
            };
            let done = match self.objects.thread_mut(initiator) {
                Ok(thread) => match thread.barrier.as_mut() {
                    Some(barrier) => barrier.ack(),
                    None => false,
                },
                Err(_) => false,
            };
            if done {
                self.restart(initiator);
            }
        }
    }

    /// Complete a broadcast of `thread`
    fn restart(&mut self, thread: ObjectId) {
        if let Ok(t) = self.objects.thread_mut(thread) {
            t.barrier = None;
            if t.state != ThreadState::AwaitsRestart {
                return;
            }
            t.context.set_ret(CALL_SUCCESS as usize);
        }
        self.set_state(thread, ThreadState::Active);
    }
}
