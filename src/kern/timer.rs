//! Thread Timeouts
//!
//! Armed timeouts of one CPU, ordered by deadline and keyed by
//! `(deadline, sequence)`. A thread owns at most one armed timeout and
//! remembers its key, so re-arming or destroying the thread removes the
//! old entry and a queue never holds more entries than threads.
//!
//! Timeouts only submit a signal context. They never end an IPC or signal
//! wait.

use alloc::collections::BTreeMap;

use super::kernel::KernelData;
use super::object::ObjectKind;
use crate::error::{KernResult, KernelError};
use crate::types::{CapId, CpuId, ObjRef, ObjectId, Word};

// ============================================================================
// Timeout Queue
// ============================================================================

/// Position of an entry in a [`TimeoutQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeoutKey {
    /// Absolute expiry time in microseconds
    pub deadline_us: u64,
    pub seq: u64,
}

/// One expired timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEntry {
    pub key: TimeoutKey,
    pub thread: ObjRef,
}

/// Deadline-ordered timeouts of one CPU
#[derive(Debug, Default)]
pub struct TimeoutQueue {
    entries: BTreeMap<TimeoutKey, ObjRef>,
    next_seq: u64,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timeout, returns its key
    pub fn push(&mut self, thread: ObjRef, deadline_us: u64) -> TimeoutKey {
        self.next_seq += 1;
        let key = TimeoutKey {
            deadline_us,
            seq: self.next_seq,
        };
        self.entries.insert(key, thread);
        key
    }

    /// Drop an armed entry
    pub fn remove(&mut self, key: TimeoutKey) -> Option<ObjRef> {
        self.entries.remove(&key)
    }

    /// Take the earliest entry if it expired at `now_us`
    pub fn pop_expired(&mut self, now_us: u64) -> Option<TimeoutEntry> {
        let (&key, _) = self.entries.first_key_value()?;
        if key.deadline_us > now_us {
            return None;
        }
        self.entries
            .remove(&key)
            .map(|thread| TimeoutEntry { key, thread })
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|key| key.deadline_us)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Timeout state held by the thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadTimeout {
    pub ctx: ObjectId,
    pub armed_us: u64,
    /// CPU whose queue holds the entry
    pub cpu: CpuId,
    pub key: TimeoutKey,
}

// ============================================================================
// Kernel Operations
// ============================================================================

impl KernelData {
    /// Arm a one-shot timeout of `thread` that submits `ctx_cap` once
    ///
    /// Replaces an earlier timeout of the thread. Intervals beyond what
    /// the timer supports are cut to that maximum.
    pub(crate) fn arm_timeout(&mut self, thread: ObjectId, us: Word, ctx_cap: CapId) -> KernResult<()> {
        let ctx = self.lookup_kind(thread, ctx_cap, ObjectKind::SignalContext)?;
        let cpu = self.objects.thread(thread)?.cpu;
        let obj = self
            .objects
            .reference(thread)
            .ok_or(KernelError::Denied)?;
        self.disarm_timeout(thread);
        let us = (us as u64).min(self.board.timer.max_timeout_us());
        let now = self.now_us(cpu);
        let key = self.cpus[cpu.0].timeouts.push(obj, now.saturating_add(us));
        self.objects.thread_mut(thread)?.timeout = Some(ThreadTimeout {
            ctx,
            armed_us: now,
            cpu,
            key,
        });
        log::trace!("{}: timeout in {}us", self.label_of(thread), us);
        Ok(())
    }

    /// Drop the armed timeout of `thread`, if any
    pub(crate) fn disarm_timeout(&mut self, thread: ObjectId) {
        let timeout = match self.objects.thread_mut(thread) {
            Ok(t) => t.timeout.take(),
            Err(_) => return,
        };
        if let Some(timeout) = timeout {
            self.cpus[timeout.cpu.0].timeouts.remove(timeout.key);
        }
    }

    /// Microseconds since `thread` last armed its timeout
    pub(crate) fn timeout_age_us(&self, thread: ObjectId) -> KernResult<u64> {
        let t = self.objects.thread(thread)?;
        Ok(t.timeout
            .map_or(0, |timeout| self.now_us(t.cpu).saturating_sub(timeout.armed_us)))
    }

    /// Submit the contexts of all timeouts of `cpu` that expired at `now`
    pub(crate) fn fire_timeouts(&mut self, cpu: CpuId, now: u64) {
        while let Some(entry) = self.cpus[cpu.0].timeouts.pop_expired(now) {
            let thread = match self.objects.resolve(entry.thread) {
                Some(thread) => thread,
                None => continue,
            };
            let ctx = match self.objects.thread_mut(thread) {
                Ok(t) if t.timeout.map(|tt| tt.key) == Some(entry.key) => {
                    t.timeout.take().map(|tt| tt.ctx)
                }
                _ => continue,
            };
            if let Some(ctx) = ctx {
                if self.submit(ctx, 1).is_err() {
                    log::warn!("{}: failed to submit timeout signal", self.label_of(thread));
                }
            }
        }
    }
}
