//! Synchronous IPC
//!
//! Every thread is an IPC node. A client `send_request`s to a server
//! thread and blocks until the server `send_reply`s; a server blocks in
//! `await_request` until a request arrives. Requests that arrive while
//! the server is busy queue up in FIFO order, without priority
//! reordering.
//!
//! The payload is captured when the request is sent. Capability
//! selectors are resolved in the sender's space at that point and
//! installed into the receiver's space when the request is delivered;
//! objects that died in between arrive as invalid selectors.
//!
//! One-way notes do not block their sender, so a busy node accepts at
//! most [`MAX_QUEUED_NOTES`] of them. Queued requests are bounded by the
//! number of threads, each sender of one is blocked.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::arch::CpuContext;
use crate::error::{KernResult, KernelError, CALL_SUCCESS};
use crate::ipc::message::{Message, MAX_MSG_CAPS, MAX_MSG_WORDS};
use crate::kern::kernel::KernelData;
use crate::kern::object::ObjectKind;
use crate::kern::thread::ThreadState;
use crate::types::{CapId, ObjRef, ObjectId, Word};

/// Notes a node holds before further notes are refused
pub const MAX_QUEUED_NOTES: usize = 32;

/// Capabilities of a message in flight
pub type CapRefs = heapless::Vec<Option<ObjRef>, MAX_MSG_CAPS>;

// ============================================================================
// IPC Node
// ============================================================================

/// What a thread waits for in IPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpcState {
    #[default]
    Inactive,
    /// Client waiting for the reply of `server`
    AwaitReply { server: ObjectId },
    /// Server waiting for the next request
    AwaitRequest,
}

/// Request queued at a server
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub sender: ObjectId,
    pub words: heapless::Vec<Word, MAX_MSG_WORDS>,
    pub caps: CapRefs,
    /// `false` for one-way notes
    pub wants_reply: bool,
}

/// IPC state of one thread
#[derive(Debug, Default)]
pub struct IpcNode {
    pub state: IpcState,
    /// Requests not yet received, oldest first
    pub queue: VecDeque<PendingRequest>,
    /// Client whose request is being served
    pub caller: Option<ObjectId>,
}

impl IpcNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued one-way notes
    pub fn queued_notes(&self) -> usize {
        self.queue.iter().filter(|req| !req.wants_reply).count()
    }

    /// Is `client` blocked on a reply from this node
    pub fn serves(&self, client: ObjectId) -> bool {
        self.caller == Some(client)
            || self
                .queue
                .iter()
                .any(|req| req.sender == client && req.wants_reply)
    }
}

// ============================================================================
// Kernel Operations
// ============================================================================

impl KernelData {
    /// Resolve the selectors of a message in `thread`'s space
    fn resolve_caps(&self, thread: ObjectId, caps: &[CapId]) -> CapRefs {
        let space = self
            .objects
            .thread(thread)
            .ok()
            .and_then(|t| t.pd)
            .and_then(|pd| self.objects.pd(pd).ok())
            .map(|pd| &pd.caps);
        let mut refs = CapRefs::new();
        for &cap in caps {
            let obj = space
                .and_then(|space| space.lookup(cap))
                .filter(|&obj| self.objects.is_live(obj));
            let _ = refs.push(obj);
        }
        refs
    }

    /// Install resolved capabilities into `thread`'s space
    fn install_caps(&mut self, thread: ObjectId, refs: &CapRefs) -> heapless::Vec<CapId, MAX_MSG_CAPS> {
        let mut caps = heapless::Vec::new();
        let pd = self.objects.thread(thread).ok().and_then(|t| t.pd);
        for obj in refs {
            let live = obj.filter(|&obj| self.objects.is_live(obj));
            let cap = match (live, pd) {
                (Some(obj), Some(pd)) => match self.objects.pd_mut(pd) {
                    Ok(pd) => pd.caps.insert(obj).unwrap_or_else(|_| {
                        log::warn!("ipc: capability space of {} full", pd.label);
                        CapId::INVALID
                    }),
                    Err(_) => CapId::INVALID,
                },
                _ => CapId::INVALID,
            };
            let _ = caps.push(cap);
        }
        caps
    }

    /// Capture the outgoing message of `sender`
    fn outgoing(&self, sender: ObjectId, wants_reply: bool) -> KernResult<PendingRequest> {
        let msg = &self.objects.thread(sender)?.utcb.msg;
        Ok(PendingRequest {
            sender,
            words: msg.words.clone(),
            caps: self.resolve_caps(sender, &msg.caps),
            wants_reply,
        })
    }

    /// Hand a request to a receiver that is ready for it
    fn deliver(&mut self, receiver: ObjectId, req: PendingRequest) {
        let caps = self.install_caps(receiver, &req.caps);
        let lend = if req.wants_reply && self.config.donation {
            self.objects
                .thread(req.sender)
                .ok()
                .map(|sender| sender.effective_priority())
        } else {
            None
        };
        let Ok(t) = self.objects.thread_mut(receiver) else {
            return;
        };
        t.utcb.msg = Message {
            words: req.words,
            caps,
        };
        t.ipc.state = IpcState::Inactive;
        if req.wants_reply {
            t.ipc.caller = Some(req.sender);
        }
        t.context.set_ret(CALL_SUCCESS as Word);
        let base = t.prio;
        if let Some(prio) = lend.filter(|&prio| prio > base) {
            self.set_donation(receiver, Some(prio));
        }
        log::trace!(
            "ipc: {} -> {}",
            self.label_of(req.sender),
            self.label_of(receiver)
        );
    }

    /// Deliver to `dst` right away if it waits, queue otherwise
    fn post(&mut self, dst: ObjectId, req: PendingRequest) -> KernResult<()> {
        let t = self.objects.thread_mut(dst)?;
        if t.ipc.state == IpcState::AwaitRequest {
            self.deliver(dst, req);
            self.set_state(dst, ThreadState::Active);
        } else {
            t.ipc.queue.push_back(req);
        }
        Ok(())
    }

    fn ipc_destination(&self, sender: ObjectId, cap: CapId) -> KernResult<ObjectId> {
        let dst = self.lookup_kind(sender, cap, ObjectKind::Thread);
        match dst {
            Ok(dst) if dst != sender => Ok(dst),
            _ => {
                log::warn!(
                    "{}: cannot send to unknown recipient {}",
                    self.label_of(sender),
                    cap.0
                );
                Err(KernelError::Denied)
            }
        }
    }

    /// Send the UTCB message of `caller` and block for the reply
    pub(crate) fn send_request(&mut self, caller: ObjectId, dst_cap: CapId) -> KernResult<()> {
        let dst = self.ipc_destination(caller, dst_cap)?;
        let req = self.outgoing(caller, true)?;
        self.objects.thread_mut(caller)?.ipc.state = IpcState::AwaitReply { server: dst };
        self.set_state(caller, ThreadState::AwaitsIpc);
        self.post(dst, req)
    }

    /// Send the UTCB message of `caller` without waiting for a reply
    pub(crate) fn send_note(&mut self, caller: ObjectId, dst_cap: CapId) -> KernResult<()> {
        let dst = self.ipc_destination(caller, dst_cap)?;
        let node = &self.objects.thread(dst)?.ipc;
        if node.state != IpcState::AwaitRequest && node.queued_notes() >= MAX_QUEUED_NOTES {
            log::warn!(
                "{}: note queue of {} is full",
                self.label_of(caller),
                self.label_of(dst)
            );
            return Err(KernelError::OutOfResources);
        }
        let req = self.outgoing(caller, false)?;
        self.post(dst, req)
    }

    /// Receive the next request, `true` if one was delivered right away
    pub(crate) fn await_request(&mut self, thread: ObjectId) -> KernResult<bool> {
        let stale = self.objects.thread_mut(thread)?.ipc.caller.take();
        if let Some(stale) = stale {
            log::warn!(
                "{}: new request wait drops unanswered {}",
                self.label_of(thread),
                self.label_of(stale)
            );
            self.set_donation(thread, None);
            self.ipc_fail(stale);
        }
        let t = self.objects.thread_mut(thread)?;
        match t.ipc.queue.pop_front() {
            Some(req) => {
                self.deliver(thread, req);
                Ok(true)
            }
            None => {
                t.ipc.state = IpcState::AwaitRequest;
                self.set_state(thread, ThreadState::AwaitsIpc);
                Ok(false)
            }
        }
    }

    /// Answer the request being served, `false` if there is none
    pub(crate) fn reply(&mut self, thread: ObjectId) -> KernResult<bool> {
        let caller = match self.objects.thread_mut(thread)?.ipc.caller.take() {
            Some(caller) => caller,
            None => return Ok(false),
        };
        self.set_donation(thread, None);
        let words = self.objects.thread(thread)?.utcb.msg.words.clone();
        let refs = {
            let caps = self.objects.thread(thread)?.utcb.msg.caps.clone();
            self.resolve_caps(thread, &caps)
        };
        let waiting = matches!(
            self.objects.thread(caller).map(|c| c.ipc.state),
            Ok(IpcState::AwaitReply { server }) if server == thread
        );
        if !waiting {
            return Ok(true);
        }
        let caps = self.install_caps(caller, &refs);
        if let Ok(c) = self.objects.thread_mut(caller) {
            c.utcb.msg = Message { words, caps };
            c.ipc.state = IpcState::Inactive;
        }
        self.wake(caller, CALL_SUCCESS as Word);
        Ok(true)
    }

    /// End the IPC wait of `thread` with an error
    pub(crate) fn ipc_fail(&mut self, thread: ObjectId) {
        match self.objects.thread_mut(thread) {
            Ok(t) if t.state == ThreadState::AwaitsIpc => t.ipc.state = IpcState::Inactive,
            _ => return,
        }
        self.wake(thread, KernelError::Denied.as_word());
    }

    /// Take a client's request back from its server
    fn withdraw(&mut self, client: ObjectId, server: ObjectId) {
        let Ok(s) = self.objects.thread_mut(server) else {
            return;
        };
        s.ipc
            .queue
            .retain(|req| !(req.sender == client && req.wants_reply));
        if s.ipc.caller == Some(client) {
            s.ipc.caller = None;
            self.set_donation(server, None);
        }
    }

    /// Cancel the IPC wait of `thread`, it returns with an error
    pub(crate) fn ipc_cancel_wait(&mut self, thread: ObjectId) {
        let state = match self.objects.thread(thread) {
            Ok(t) => t.ipc.state,
            Err(_) => return,
        };
        if let IpcState::AwaitReply { server } = state {
            self.withdraw(thread, server);
        }
        self.ipc_fail(thread);
    }

    /// Remove every IPC link to and from a thread about to be destroyed
    pub(crate) fn ipc_detach(&mut self, thread: ObjectId) {
        let (state, queue, caller) = match self.objects.thread_mut(thread) {
            Ok(t) => (
                core::mem::take(&mut t.ipc.state),
                core::mem::take(&mut t.ipc.queue),
                t.ipc.caller.take(),
            ),
            Err(_) => return,
        };
        if let IpcState::AwaitReply { server } = state {
            self.withdraw(thread, server);
        }
        let clients = queue
            .into_iter()
            .filter(|req| req.wants_reply)
            .map(|req| req.sender)
            .chain(caller);
        for client in clients.collect::<Vec<_>>() {
            self.ipc_fail(client);
        }
        for other in self.objects.ids_of(ObjectKind::Thread) {
            if let Ok(t) = self.objects.thread_mut(other) {
                t.ipc.queue.retain(|req| req.sender != thread);
            }
        }
    }
}
