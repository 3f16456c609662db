//! Asynchronous Notification
//!
//! A [`SignalReceiver`] is what threads block on, a [`SignalContext`] is
//! one distinguishable event source bound to exactly one receiver.
//! Submissions to a context accumulate in its counter. A waiting thread
//! receives every context with a nonzero count in one batch, which drains
//! those counters.
//!
//! A delivered context stays silent until it is acknowledged. Submissions
//! in between keep accumulating and are delivered after `ack_signal`.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::vec::Vec;

use super::kernel::KernelData;
use super::object::{KernelObject, ObjectKind};
use super::thread::ThreadState;
use crate::error::{KernResult, KernelError, CALL_SUCCESS};
use crate::ipc::message::Signal;
use crate::types::{CapId, ObjectId, Word};

/// Notification endpoint
#[derive(Debug, Default)]
pub struct SignalReceiver {
    /// Threads blocked in `await_signal`, oldest first
    pub waiters: VecDeque<ObjectId>,
    /// Contexts with undelivered submissions, in submission order
    pub pending: VecDeque<ObjectId>,
    pub contexts: BTreeSet<ObjectId>,
}

impl SignalReceiver {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Event source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalContext {
    pub receiver: ObjectId,
    /// Value reported to the receiving thread
    pub imprint: Word,
    /// Submissions since the last delivery
    pub count: u32,
    /// Cleared on delivery, set again by `ack_signal`
    pub acked: bool,
    /// Revoked, submissions are refused
    pub killed: bool,
    /// Linked into the receiver's pending queue
    pub queued: bool,
}

impl SignalContext {
    pub fn new(receiver: ObjectId, imprint: Word) -> Self {
        Self {
            receiver,
            imprint,
            count: 0,
            acked: true,
            killed: false,
            queued: false,
        }
    }

    fn deliverable(&self) -> bool {
        self.count > 0 && self.acked && !self.killed
    }
}

impl KernelData {
    /// Add `count` submissions to a context and wake a waiter if any
    pub(crate) fn submit(&mut self, ctx: ObjectId, count: Word) -> KernResult<()> {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        let c = self.objects.context_mut(ctx)?;
        if c.killed {
            return Err(KernelError::Denied);
        }
        c.count = c.count.saturating_add(count);
        let receiver = c.receiver;
        self.enqueue_context(ctx);
        self.try_deliver(receiver);
        Ok(())
    }

    /// Link a deliverable context into its receiver's pending queue
    fn enqueue_context(&mut self, ctx: ObjectId) {
        let receiver = match self.objects.context_mut(ctx) {
            Ok(c) if c.deliverable() && !c.queued => {
                c.queued = true;
                c.receiver
            }
            _ => return,
        };
        if let Ok(r) = self.objects.receiver_mut(receiver) {
            r.pending.push_back(ctx);
        }
    }

    /// Drain the pending contexts of a receiver into one batch
    fn take_batch(&mut self, receiver: ObjectId) -> Vec<Signal> {
        let pending = match self.objects.receiver_mut(receiver) {
            Ok(r) => core::mem::take(&mut r.pending),
            Err(_) => return Vec::new(),
        };
        pending
            .into_iter()
            .filter_map(|ctx| {
                let c = self.objects.context_mut(ctx).ok()?;
                c.queued = false;
                if !c.deliverable() {
                    return None;
                }
                c.acked = false;
                Some(Signal {
                    imprint: c.imprint,
                    count: core::mem::take(&mut c.count),
                })
            })
            .collect()
    }

    /// Hand the pending batch of `receiver` to its oldest waiter
    fn try_deliver(&mut self, receiver: ObjectId) {
        let ready = self
            .objects
            .receiver(receiver)
            .map_or(false, |r| !r.waiters.is_empty() && !r.pending.is_empty());
        if !ready {
            return;
        }
        let waiter = match self.objects.receiver_mut(receiver) {
            Ok(r) => r.waiters.pop_front(),
            Err(_) => None,
        };
        let Some(waiter) = waiter else {
            return;
        };
        let batch = self.take_batch(receiver);
        if let Ok(t) = self.objects.thread_mut(waiter) {
            t.utcb.signals = batch;
            t.signal_wait = None;
        }
        self.wake(waiter, CALL_SUCCESS as Word);
    }

    /// Receive pending signals, `true` if a batch was delivered right away
    pub(crate) fn await_signal(&mut self, thread: ObjectId, rcv_cap: CapId) -> KernResult<bool> {
        let receiver = self.lookup_kind(thread, rcv_cap, ObjectKind::SignalReceiver)?;
        let batch = self.take_batch(receiver);
        if !batch.is_empty() {
            self.objects.thread_mut(thread)?.utcb.signals = batch;
            return Ok(true);
        }
        self.objects.receiver_mut(receiver)?.waiters.push_back(thread);
        let t = self.objects.thread_mut(thread)?;
        t.utcb.signals.clear();
        t.signal_wait = Some(receiver);
        self.set_state(thread, ThreadState::AwaitsSignal);
        Ok(false)
    }

    /// Does a receiver hold undelivered signals
    pub(crate) fn signal_pending(&self, thread: ObjectId, rcv_cap: CapId) -> KernResult<bool> {
        let receiver = self.lookup_kind(thread, rcv_cap, ObjectKind::SignalReceiver)?;
        Ok(!self.objects.receiver(receiver)?.pending.is_empty())
    }

    /// Submit to a context by selector
    pub(crate) fn submit_signal(&mut self, thread: ObjectId, ctx_cap: CapId, count: Word) -> KernResult<()> {
        let ctx = self.lookup_kind(thread, ctx_cap, ObjectKind::SignalContext)?;
        self.submit(ctx, count)
    }

    /// Re-arm a delivered context
    pub(crate) fn ack_signal(&mut self, thread: ObjectId, ctx_cap: CapId) -> KernResult<()> {
        let ctx = self.lookup_kind(thread, ctx_cap, ObjectKind::SignalContext)?;
        let c = self.objects.context_mut(ctx)?;
        c.acked = true;
        let receiver = c.receiver;
        self.enqueue_context(ctx);
        self.try_deliver(receiver);
        Ok(())
    }

    /// Revoke a context, nothing of it is delivered afterwards
    pub(crate) fn kill_signal_context(&mut self, thread: ObjectId, ctx_cap: CapId) -> KernResult<()> {
        let ctx = self.lookup_kind(thread, ctx_cap, ObjectKind::SignalContext)?;
        let c = self.objects.context_mut(ctx)?;
        c.killed = true;
        c.count = 0;
        let (receiver, queued) = (c.receiver, core::mem::take(&mut c.queued));
        if queued {
            self.objects
                .receiver_mut(receiver)?
                .pending
                .retain(|&id| id != ctx);
        }
        log::debug!("{}: killed signal context {}", self.label_of(thread), ctx);
        Ok(())
    }

    pub(crate) fn new_signal_receiver(&mut self, caller: ObjectId) -> KernResult<CapId> {
        let object = KernelObject::SignalReceiver(SignalReceiver::new());
        let (_, cap) = self.create(caller, object)?;
        Ok(cap)
    }

    pub(crate) fn new_signal_context(
        &mut self,
        caller: ObjectId,
        rcv_cap: CapId,
        imprint: Word,
    ) -> KernResult<CapId> {
        let receiver = self.lookup_kind(caller, rcv_cap, ObjectKind::SignalReceiver)?;
        let object = KernelObject::SignalContext(SignalContext::new(receiver, imprint));
        let (ctx, cap) = self.create(caller, object)?;
        self.objects.receiver_mut(receiver)?.contexts.insert(ctx);
        Ok(cap)
    }

    pub(crate) fn delete_signal_context(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        let ctx = self.lookup_kind(caller, cap, ObjectKind::SignalContext)?;
        self.destroy_signal_context(ctx);
        Ok(())
    }

    /// Drop every reference to a context and free it
    fn destroy_signal_context(&mut self, ctx: ObjectId) {
        if let Ok(c) = self.objects.context(ctx) {
            let receiver = c.receiver;
            if let Ok(r) = self.objects.receiver_mut(receiver) {
                r.pending.retain(|&id| id != ctx);
                r.contexts.remove(&ctx);
            }
        }
        for irq in self.objects.ids_of(ObjectKind::Irq) {
            if let Ok(irq) = self.objects.irq_mut(irq) {
                if irq.ctx == Some(ctx) {
                    irq.ctx = None;
                }
            }
        }
        for vm in self.objects.ids_of(ObjectKind::Vm) {
            if let Ok(vm) = self.objects.vm_mut(vm) {
                if vm.ctx == Some(ctx) {
                    vm.ctx = None;
                }
            }
        }
        for thread in self.objects.ids_of(ObjectKind::Thread) {
            let timed = match self.objects.thread_mut(thread) {
                Ok(t) => {
                    if t.fault_ctx == Some(ctx) {
                        t.fault_ctx = None;
                    }
                    t.timeout.map(|timeout| timeout.ctx) == Some(ctx)
                }
                Err(_) => false,
            };
            if timed {
                self.disarm_timeout(thread);
            }
        }
        self.retire(ctx);
    }

    /// Delete a receiver, its waiters return with an error
    pub(crate) fn delete_signal_receiver(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        let receiver = self.lookup_kind(caller, cap, ObjectKind::SignalReceiver)?;
        let (waiters, contexts) = {
            let r = self.objects.receiver_mut(receiver)?;
            (
                core::mem::take(&mut r.waiters),
                core::mem::take(&mut r.contexts),
            )
        };
        for waiter in waiters {
            if let Ok(t) = self.objects.thread_mut(waiter) {
                t.signal_wait = None;
            }
            self.wake(waiter, KernelError::Denied.as_word());
        }
        for ctx in contexts {
            self.destroy_signal_context(ctx);
        }
        self.retire(receiver);
        Ok(())
    }

    /// Unlink `thread` from the receiver it waits on
    pub(crate) fn signal_cancel_wait(&mut self, thread: ObjectId) {
        let receiver = match self.objects.thread_mut(thread) {
            Ok(t) => t.signal_wait.take(),
            Err(_) => None,
        };
        if let Some(r) = receiver.and_then(|r| self.objects.receiver_mut(r).ok()) {
            r.waiters.retain(|&id| id != thread);
        }
    }
}
