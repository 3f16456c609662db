//! System Call Switch
//!
//! Numbered kernel calls, their decoding and dispatch.
//!
//! ## Calling convention
//!
//! - Argument 0 carries the [`CallId`] and receives the primary return word
//! - Arguments 1-5 carry the call parameters
//! - Errors return as negative words, see [`KernelError::as_word`]
//!
//! ## Call ranges
//!
//! - Calls 0-17: available to every thread
//! - Calls 100-123: restricted to threads of the core PD
//!
//! A call that blocks leaves its return word alone; whoever ends the wait
//! installs it.

use core::sync::atomic::{AtomicU64, Ordering};

use super::kernel::KernelData;
use super::object::ObjectKind;
use crate::arch::{CpuContext, UserContext};
use crate::error::{KernResult, KernelError, CALL_SUCCESS};
use crate::types::{CapId, ObjectId, Word};

// ============================================================================
// Call Numbers
// ============================================================================

/// System call numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum CallId {
    SendRequest = 0,
    SendReply = 1,
    AwaitRequest = 2,
    SendNote = 3,
    AwaitSignal = 4,
    SignalPending = 5,
    SubmitSignal = 6,
    AckSignal = 7,
    KillSignalContext = 8,
    YieldThread = 9,
    PauseCurrentThread = 10,
    ResumeLocalThread = 11,
    Timeout = 12,
    TimeoutAgeUs = 13,
    PrintChar = 14,
    AckIrq = 15,
    DeleteCap = 16,
    TimeoutMaxUs = 17,

    NewThread = 100,
    DeleteThread = 101,
    StartThread = 102,
    PauseThread = 103,
    ResumeThread = 104,
    RouteThreadEvent = 105,
    AccessThreadRegs = 106,
    NewPd = 107,
    DeletePd = 108,
    UpdatePd = 109,
    MapRegion = 110,
    UnmapRegion = 111,
    NewSignalReceiver = 112,
    DeleteSignalReceiver = 113,
    NewSignalContext = 114,
    DeleteSignalContext = 115,
    NewIrq = 116,
    DeleteIrq = 117,
    NewVm = 118,
    DeleteVm = 119,
    RunVm = 120,
    PauseVm = 121,
    InstallCap = 122,
    ThreadQuota = 123,
}

/// First call number reserved for core
pub const CORE_CALL_BASE: Word = 100;

impl CallId {
    pub fn from_word(word: Word) -> Option<Self> {
        use CallId::*;
        const CALLS: [CallId; 42] = [
            SendRequest, SendReply, AwaitRequest, SendNote, AwaitSignal,
            SignalPending, SubmitSignal, AckSignal, KillSignalContext,
            YieldThread, PauseCurrentThread, ResumeLocalThread, Timeout,
            TimeoutAgeUs, PrintChar, AckIrq, DeleteCap, NewThread,
            DeleteThread, StartThread, PauseThread, ResumeThread,
            RouteThreadEvent, AccessThreadRegs, NewPd, DeletePd, UpdatePd,
            MapRegion, UnmapRegion, NewSignalReceiver, DeleteSignalReceiver,
            NewSignalContext, DeleteSignalContext, NewIrq, DeleteIrq, NewVm,
            DeleteVm, RunVm, PauseVm, InstallCap, TimeoutMaxUs, ThreadQuota,
        ];
        CALLS.iter().copied().find(|&call| call as Word == word)
    }

    /// Only threads of the core PD may issue this call
    pub fn core_only(self) -> bool {
        self as Word >= CORE_CALL_BASE
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SendRequest => "send_request",
            Self::SendReply => "send_reply",
            Self::AwaitRequest => "await_request",
            Self::SendNote => "send_note",
            Self::AwaitSignal => "await_signal",
            Self::SignalPending => "signal_pending",
            Self::SubmitSignal => "submit_signal",
            Self::AckSignal => "ack_signal",
            Self::KillSignalContext => "kill_signal_context",
            Self::YieldThread => "yield_thread",
            Self::PauseCurrentThread => "pause_current_thread",
            Self::ResumeLocalThread => "resume_local_thread",
            Self::Timeout => "timeout",
            Self::TimeoutAgeUs => "timeout_age_us",
            Self::PrintChar => "print_char",
            Self::AckIrq => "ack_irq",
            Self::DeleteCap => "delete_cap",
            Self::TimeoutMaxUs => "timeout_max_us",
            Self::NewThread => "new_thread",
            Self::DeleteThread => "delete_thread",
            Self::StartThread => "start_thread",
            Self::PauseThread => "pause_thread",
            Self::ResumeThread => "resume_thread",
            Self::RouteThreadEvent => "route_thread_event",
            Self::AccessThreadRegs => "access_thread_regs",
            Self::NewPd => "new_pd",
            Self::DeletePd => "delete_pd",
            Self::UpdatePd => "update_pd",
            Self::MapRegion => "map_region",
            Self::UnmapRegion => "unmap_region",
            Self::NewSignalReceiver => "new_signal_receiver",
            Self::DeleteSignalReceiver => "delete_signal_receiver",
            Self::NewSignalContext => "new_signal_context",
            Self::DeleteSignalContext => "delete_signal_context",
            Self::NewIrq => "new_irq",
            Self::DeleteIrq => "delete_irq",
            Self::NewVm => "new_vm",
            Self::DeleteVm => "delete_vm",
            Self::RunVm => "run_vm",
            Self::PauseVm => "pause_vm",
            Self::InstallCap => "install_cap",
            Self::ThreadQuota => "thread_quota",
        }
    }
}

// ============================================================================
// Call Statistics
// ============================================================================

/// System call statistics of all kernel instances
pub struct CallStats {
    /// Calls dispatched
    pub total_calls: AtomicU64,
    /// Calls refused before dispatch
    pub denied_calls: AtomicU64,
    /// Calls that left the caller blocked
    pub blocking_calls: AtomicU64,
}

impl CallStats {
    pub const fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            denied_calls: AtomicU64::new(0),
            blocking_calls: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> CallStatsSnapshot {
        CallStatsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            denied_calls: self.denied_calls.load(Ordering::Relaxed),
            blocking_calls: self.blocking_calls.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of call statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStatsSnapshot {
    pub total_calls: u64,
    pub denied_calls: u64,
    pub blocking_calls: u64,
}

static CALL_STATS: CallStats = CallStats::new();

pub fn call_stats() -> CallStatsSnapshot {
    CALL_STATS.snapshot()
}

// ============================================================================
// Dispatch
// ============================================================================

/// How a call ends for its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallOutcome {
    /// Install the primary return word
    Return(Word),
    /// Install the primary return word and argument 1
    ReturnWith(Word, Word),
    /// The return word is installed when the wait ends
    Deferred,
}

use CallOutcome::{Deferred, Return, ReturnWith};

const SUCCESS: CallOutcome = Return(CALL_SUCCESS as Word);

/// Call parameters, argument 1 is at index 0
struct Args([Word; 5]);

impl Args {
    fn from_context(ctx: &UserContext) -> Self {
        Self([ctx.arg(1), ctx.arg(2), ctx.arg(3), ctx.arg(4), ctx.arg(5)])
    }

    fn word(&self, n: usize) -> Word {
        self.0[n - 1]
    }

    fn cap(&self, n: usize) -> CapId {
        CapId::from_word(self.word(n))
    }

    fn flag(&self, n: usize) -> bool {
        self.word(n) != 0
    }
}

fn waits(wait: bool) -> CallOutcome {
    if wait {
        Deferred
    } else {
        SUCCESS
    }
}

impl KernelData {
    /// Execute the system call `thread` trapped with
    pub(crate) fn syscall(&mut self, thread: ObjectId) {
        let (id, args) = match self.objects.thread(thread) {
            Ok(t) => (t.context.call_id(), Args::from_context(&t.context)),
            Err(_) => return,
        };
        CALL_STATS.total_calls.fetch_add(1, Ordering::Relaxed);

        let outcome = match CallId::from_word(id) {
            Some(call) if call.core_only() && !self.is_core(thread) => {
                log::warn!(
                    "{}: not entitled to {}",
                    self.label_of(thread),
                    call.name()
                );
                CALL_STATS.denied_calls.fetch_add(1, Ordering::Relaxed);
                Return(KernelError::Denied.as_word())
            }
            Some(call) => {
                log::trace!("{}: {}", self.label_of(thread), call.name());
                self.perform(thread, call, &args).unwrap_or_else(|err| {
                    if err == KernelError::Denied {
                        log::warn!("{}: {} denied", self.label_of(thread), call.name());
                        CALL_STATS.denied_calls.fetch_add(1, Ordering::Relaxed);
                    } else {
                        log::debug!("{}: {} failed: {}", self.label_of(thread), call.name(), err);
                    }
                    Return(err.as_word())
                })
            }
            None => {
                log::warn!("{}: unknown call {}", self.label_of(thread), id);
                CALL_STATS.denied_calls.fetch_add(1, Ordering::Relaxed);
                Return(KernelError::Denied.as_word())
            }
        };

        let Ok(t) = self.objects.thread_mut(thread) else {
            return;
        };
        match outcome {
            Return(ret) => t.context.set_ret(ret),
            ReturnWith(ret, arg1) => {
                t.context.set_ret(ret);
                t.context.set_arg(1, arg1);
            }
            Deferred => {}
        }
        if t.state != super::thread::ThreadState::Active {
            CALL_STATS.blocking_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn perform(&mut self, t: ObjectId, call: CallId, a: &Args) -> KernResult<CallOutcome> {
        match call {
            CallId::SendRequest => {
                self.send_request(t, a.cap(1))?;
                Ok(Deferred)
            }
            CallId::SendReply => {
                let replied = self.reply(t)?;
                if a.flag(1) {
                    self.await_request(t)?;
                    Ok(Deferred)
                } else if replied {
                    Ok(SUCCESS)
                } else {
                    Err(KernelError::Denied)
                }
            }
            CallId::AwaitRequest => {
                self.await_request(t)?;
                Ok(Deferred)
            }
            CallId::SendNote => {
                self.send_note(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::AwaitSignal => {
                let delivered = self.await_signal(t, a.cap(1))?;
                Ok(waits(!delivered))
            }
            CallId::SignalPending => {
                let pending = self.signal_pending(t, a.cap(1))?;
                Ok(Return(pending as Word))
            }
            CallId::SubmitSignal => {
                self.submit_signal(t, a.cap(1), a.word(2))?;
                Ok(SUCCESS)
            }
            CallId::AckSignal => {
                self.ack_signal(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::KillSignalContext => {
                self.kill_signal_context(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::YieldThread => {
                self.yield_thread(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::PauseCurrentThread => {
                self.pause(t)?;
                Ok(SUCCESS)
            }
            CallId::ResumeLocalThread => {
                self.resume_local(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::Timeout => {
                self.arm_timeout(t, a.word(1), a.cap(2))?;
                Ok(SUCCESS)
            }
            CallId::TimeoutAgeUs => {
                let age = self.timeout_age_us(t)?;
                Ok(Return(age as Word))
            }
            CallId::PrintChar => {
                self.console.put_byte(a.word(1) as u8);
                Ok(SUCCESS)
            }
            CallId::AckIrq => {
                self.ack_irq(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::DeleteCap => {
                self.delete_cap(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::TimeoutMaxUs => Ok(Return(self.board.timer.max_timeout_us() as Word)),

            CallId::NewThread => {
                let cap = self.new_thread(t, a.word(1), a.word(2))?;
                Ok(Return(cap.as_word()))
            }
            CallId::DeleteThread => {
                self.delete_thread(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::StartThread => {
                self.start_thread(t, a.cap(1), a.word(2), a.cap(3), a.word(4), a.word(5))?;
                Ok(SUCCESS)
            }
            CallId::PauseThread => {
                let target = self.lookup_kind(t, a.cap(1), ObjectKind::Thread)?;
                self.pause(target)?;
                Ok(SUCCESS)
            }
            CallId::ResumeThread => {
                let target = self.lookup_kind(t, a.cap(1), ObjectKind::Thread)?;
                self.resume(target)?;
                Ok(SUCCESS)
            }
            CallId::RouteThreadEvent => {
                self.route_thread_event(t, a.cap(1), a.word(2), a.cap(3))?;
                Ok(SUCCESS)
            }
            CallId::AccessThreadRegs => {
                let old = self.access_thread_regs(t, a.cap(1), a.word(2), a.flag(3), a.word(4))?;
                Ok(ReturnWith(CALL_SUCCESS as Word, old))
            }
            CallId::NewPd => {
                let cap = self.new_pd(t)?;
                Ok(Return(cap.as_word()))
            }
            CallId::DeletePd => {
                let wait = self.delete_pd(t, a.cap(1))?;
                Ok(waits(wait))
            }
            CallId::UpdatePd => {
                let wait = self.update_pd(t, a.cap(1))?;
                Ok(waits(wait))
            }
            CallId::MapRegion => {
                self.map_region(t, a.cap(1), a.word(2), a.word(3), a.word(4), a.word(5))?;
                Ok(SUCCESS)
            }
            CallId::UnmapRegion => {
                let wait = self.unmap_region(t, a.cap(1), a.word(2), a.word(3))?;
                Ok(waits(wait))
            }
            CallId::NewSignalReceiver => {
                let cap = self.new_signal_receiver(t)?;
                Ok(Return(cap.as_word()))
            }
            CallId::DeleteSignalReceiver => {
                self.delete_signal_receiver(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::NewSignalContext => {
                let cap = self.new_signal_context(t, a.cap(1), a.word(2))?;
                Ok(Return(cap.as_word()))
            }
            CallId::DeleteSignalContext => {
                self.delete_signal_context(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::NewIrq => {
                let cap = self.new_irq(t, a.word(1), a.cap(2))?;
                Ok(Return(cap.as_word()))
            }
            CallId::DeleteIrq => {
                self.delete_irq(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::NewVm => {
                let cap = self.new_vm(t, a.word(1), a.cap(2), a.word(3))?;
                Ok(Return(cap.as_word()))
            }
            CallId::DeleteVm => {
                self.delete_vm(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::RunVm => {
                let wait = self.run_vm(t, a.cap(1), a.flag(2))?;
                Ok(waits(wait))
            }
            CallId::PauseVm => {
                self.pause_vm(t, a.cap(1))?;
                Ok(SUCCESS)
            }
            CallId::InstallCap => {
                let cap = self.install_cap(t, a.cap(1), a.cap(2))?;
                Ok(Return(cap.as_word()))
            }
            CallId::ThreadQuota => {
                self.thread_quota(t, a.cap(1), a.word(2))?;
                Ok(SUCCESS)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::kernel::Proceed;
    use crate::kern::testing::Machine;
    use crate::kern::thread::ThreadState;
    use crate::types::CpuId;

    #[test]
    fn test_call_numbers() {
        assert_eq!(CallId::from_word(0), Some(CallId::SendRequest));
        assert_eq!(CallId::from_word(16), Some(CallId::DeleteCap));
        assert_eq!(CallId::from_word(17), Some(CallId::TimeoutMaxUs));
        assert_eq!(CallId::from_word(18), None);
        assert_eq!(CallId::from_word(122), Some(CallId::InstallCap));
        assert_eq!(CallId::from_word(123), Some(CallId::ThreadQuota));
        assert_eq!(CallId::from_word(124), None);
        assert!(!CallId::AckIrq.core_only());
        assert!(CallId::NewThread.core_only());
        assert_eq!(CallId::RunVm.name(), "run_vm");
    }

    #[test]
    fn test_unknown_call_denied() {
        let mut m = Machine::boot(1);
        assert_eq!(m.core_call(&[77]), KernelError::Denied.as_word());
        assert_eq!(m.state(m.core), Some(ThreadState::Active));
        assert!(call_stats().denied_calls >= 1);
    }

    #[test]
    fn test_core_calls_restricted() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (_, t) = m.spawn("app", 10, 1, pd);
        let ret = m.call(CpuId(1), &[CallId::NewThread as Word, 10]);
        assert_eq!(ret, KernelError::Denied.as_word());
        let ret = m.call(CpuId(1), &[CallId::NewPd as Word]);
        assert_eq!(ret, KernelError::Denied.as_word());
        assert_eq!(m.state(t), Some(ThreadState::Active));
    }

    #[test]
    fn test_print_char() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        m.spawn("app", 10, 1, pd);
        for byte in b"hello\n" {
            assert_eq!(m.call(CpuId(1), &[CallId::PrintChar as Word, *byte as Word]), 0);
        }
        let data = m.kernel.lock();
        assert_eq!(data.console().last_line(), "hello");
    }

    #[test]
    fn test_timeout_submits_once() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let rcv = m.new_receiver();
        let ctx = m.new_context(rcv, 3);
        let (_, t) = m.spawn("sleeper", 10, 1, pd);
        let ctx_local = m.grant(pd, ctx);
        let rcv_local = m.grant(pd, rcv);

        assert_eq!(m.call(CpuId(1), &[CallId::Timeout as Word, 5_000, ctx_local.as_word()]), 0);
        m.tick(CpuId(1), 2_000);
        assert_eq!(m.call(CpuId(1), &[CallId::TimeoutAgeUs as Word]), 2_000);

        // the timeout never ends a wait, only submits the context
        m.call(CpuId(1), &[CallId::AwaitSignal as Word, rcv_local.as_word()]);
        assert_eq!(m.state(t), Some(ThreadState::AwaitsSignal));
        assert_eq!(m.tick(CpuId(1), 3_000), Proceed::Thread(t));
        assert_eq!(m.signals(t)[0].imprint, 3);
        assert_eq!(m.signals(t)[0].count, 1);

        m.call(CpuId(1), &[CallId::AckSignal as Word, ctx_local.as_word()]);
        m.tick(CpuId(1), 10_000);
        assert_eq!(m.call(CpuId(1), &[CallId::SignalPending as Word, rcv_local.as_word()]), 0);
    }

    #[test]
    fn test_access_thread_regs_returns_old_value() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (cap, _) = m.spawn("t", 10, 1, pd);
        let write = |m: &mut Machine, value: Word| {
            m.core_call(&[
                CallId::AccessThreadRegs as Word,
                cap.as_word(),
                crate::kern::thread::reg::SP,
                1,
                value,
            ])
        };
        assert_eq!(write(&mut m, 0x7000), 0);
        assert_eq!(write(&mut m, 0x6000), 0);
        assert_eq!(m.core_arg(1), 0x7000);
    }

    #[test]
    fn test_blocking_call_keeps_return_word() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (cap, t) = m.spawn("t", 10, 1, pd);
        assert_eq!(m.call(CpuId(1), &[CallId::PauseCurrentThread as Word]), 0);
        assert_eq!(m.state(t), Some(ThreadState::AwaitsResume));
        m.core_call(&[CallId::ResumeThread as Word, cap.as_word()]);
        assert_eq!(m.ret(t), 0);
        assert!(call_stats().blocking_calls >= 1);
    }
}
