//! Thread Management
//!
//! A thread is the unit of scheduling and the IPC endpoint at once.
//!
//! A thread is in exactly one [`ThreadState`]. Only `Active` threads are
//! linked into their CPU's scheduler; [`KernelData::set_state`] is the
//! single place that moves a thread in or out of the ready structure, so
//! scheduler membership and state can never disagree.
//!
//! ```text
//! AwaitsStart -> Active <-> { AwaitsIpc, AwaitsSignal, AwaitsRestart,
//!                             AwaitsVm, AwaitsResume }
//! any -> Stopped (unhandled fault)
//! any -> destroyed (delete_thread)
//! ```

use alloc::boxed::Box;

use super::kernel::KernelData;
use super::object::{KernelObject, ObjectKind};
use super::smp::RestartBarrier;
use super::timer::ThreadTimeout;
use crate::arch::{CpuContext, UserContext, GENERAL_REGS};
use crate::error::{KernResult, KernelError};
use crate::ipc::message::{label, Label, Utcb};
use crate::ipc::node::IpcNode;
use crate::trap::FaultKind;
use crate::types::{CapId, CpuId, ObjectId, Priority, Word};

// ============================================================================
// Thread State
// ============================================================================

/// Syscall continuation state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, not yet started
    AwaitsStart,
    /// Ready or running
    Active,
    /// Blocked in a call, note or request wait
    AwaitsIpc,
    /// Blocked on a signal receiver
    AwaitsSignal,
    /// Waiting for the acknowledgement of a TLB broadcast
    AwaitsRestart,
    /// Waiting for the exit of a virtual machine
    AwaitsVm,
    /// Paused until resumed
    AwaitsResume,
    /// Halted after an unresolvable fault
    Stopped,
}

impl ThreadState {
    pub fn name(self) -> &'static str {
        match self {
            Self::AwaitsStart => "awaits start",
            Self::Active => "active",
            Self::AwaitsIpc => "awaits ipc",
            Self::AwaitsSignal => "awaits signal",
            Self::AwaitsRestart => "awaits restart",
            Self::AwaitsVm => "awaits vm",
            Self::AwaitsResume => "awaits resume",
            Self::Stopped => "stopped",
        }
    }
}

// ============================================================================
// Thread Events
// ============================================================================

/// Event id of the fault event in `route_thread_event`
pub const EVENT_FAULT: Word = 0;

/// Register selectors of `access_thread_regs`
pub mod reg {
    use super::Word;

    pub const IP: Word = 0;
    pub const SP: Word = 1;
    /// Faulting address (read-only)
    pub const FAULT_ADDR: Word = 2;
    /// 1 if the fault was a write (read-only)
    pub const FAULT_WRITE: Word = 3;
    /// Fault class, 0 if none (read-only)
    pub const FAULT_KIND: Word = 4;
    /// Processor state
    pub const PSTATE: Word = 5;
    /// General register n is `ARG_BASE + n`, call arguments come first
    pub const ARG_BASE: Word = 8;
}

/// Last fault of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub kind: FaultKind,
    pub addr: Word,
    pub write: bool,
    pub ip: Word,
}

// ============================================================================
// Thread
// ============================================================================

/// Kernel thread object
#[derive(Debug)]
pub struct Thread {
    pub label: Label,
    /// Owning protection domain, set on start
    pub pd: Option<ObjectId>,
    pub cpu: CpuId,
    /// Base priority
    pub prio: Priority,
    /// Priority lent by a caller while serving its request
    pub donated: Option<Priority>,
    /// Time-slice length, zero for the kernel quantum
    pub quota_us: u64,
    pub state: ThreadState,
    pub context: UserContext,
    pub utcb: Utcb,
    pub ipc: IpcNode,
    /// Receiver this thread waits on
    pub signal_wait: Option<ObjectId>,
    /// VM this thread waits on
    pub vm_wait: Option<ObjectId>,
    pub fault: Option<FaultInfo>,
    /// Context submitted on faults
    pub fault_ctx: Option<ObjectId>,
    pub timeout: Option<ThreadTimeout>,
    /// Pending TLB broadcast initiated by this thread
    pub barrier: Option<RestartBarrier>,
}

impl Thread {
    pub fn new(label: Label, prio: Priority) -> Self {
        Self {
            label,
            pd: None,
            cpu: CpuId::PRIMARY,
            prio,
            donated: None,
            quota_us: 0,
            state: ThreadState::AwaitsStart,
            context: UserContext::default(),
            utcb: Utcb::new(),
            ipc: IpcNode::new(),
            signal_wait: None,
            vm_wait: None,
            fault: None,
            fault_ctx: None,
            timeout: None,
            barrier: None,
        }
    }

    /// Priority the scheduler orders this thread by
    pub fn effective_priority(&self) -> Priority {
        match self.donated {
            Some(donated) if donated > self.prio => donated,
            _ => self.prio,
        }
    }
}

// ============================================================================
// Kernel Operations
// ============================================================================

impl KernelData {
    /// Change the state of `thread`, keeping scheduler membership in sync
    pub(crate) fn set_state(&mut self, thread: ObjectId, state: ThreadState) {
        let (old, cpu, prio, quota) = match self.objects.thread_mut(thread) {
            Ok(t) => (
                core::mem::replace(&mut t.state, state),
                t.cpu,
                t.effective_priority(),
                t.quota_us,
            ),
            Err(_) => return,
        };
        if old == state {
            return;
        }
        let scheduler = &mut self.cpus[cpu.0].scheduler;
        if old == ThreadState::Active {
            let was_current = scheduler.current() == Some(thread);
            scheduler.unready(thread);
            if was_current {
                self.kick(cpu);
            }
        } else if state == ThreadState::Active {
            let preempts = scheduler.would_preempt(prio);
            scheduler.set_quota(thread, quota);
            scheduler.ready(thread, prio);
            if preempts {
                self.kick(cpu);
            }
        }
        log::debug!(
            "{}: {} -> {}",
            self.label_of(thread),
            old.name(),
            state.name()
        );
    }

    /// Set the primary return word of `thread` and make it active
    pub(crate) fn wake(&mut self, thread: ObjectId, ret: Word) {
        if let Ok(t) = self.objects.thread_mut(thread) {
            t.context.set_ret(ret);
        }
        self.set_state(thread, ThreadState::Active);
    }

    /// Lend `prio` to `thread`, or take a loan back with `None`
    pub(crate) fn set_donation(&mut self, thread: ObjectId, prio: Option<Priority>) {
        let (cpu, effective, active) = match self.objects.thread_mut(thread) {
            Ok(t) => {
                t.donated = prio;
                (t.cpu, t.effective_priority(), t.state == ThreadState::Active)
            }
            Err(_) => return,
        };
        if active {
            self.cpus[cpu.0].scheduler.reprioritize(thread, effective);
        }
    }

    /// Create an unstarted thread, labeled from the caller's UTCB
    pub(crate) fn new_thread(
        &mut self,
        caller: ObjectId,
        prio: Word,
        quota_us: Word,
    ) -> KernResult<CapId> {
        let prio = Priority::from_word(prio).ok_or(KernelError::InvalidArgument)?;
        let name = self.objects.thread(caller)?.utcb.name.clone();
        let name = if name.is_empty() { label("thread") } else { name };
        let mut thread = Thread::new(name, prio);
        thread.quota_us = quota_us as u64;
        let (_, cap) = self.create(caller, KernelObject::Thread(Box::new(thread)))?;
        Ok(cap)
    }

    /// Change the time-slice quota of a thread
    pub(crate) fn thread_quota(
        &mut self,
        caller: ObjectId,
        thread_cap: CapId,
        quota_us: Word,
    ) -> KernResult<()> {
        let thread = self.lookup_kind(caller, thread_cap, ObjectKind::Thread)?;
        let t = self.objects.thread_mut(thread)?;
        t.quota_us = quota_us as u64;
        let cpu = t.cpu;
        if t.state == ThreadState::Active {
            self.cpus[cpu.0].scheduler.set_quota(thread, quota_us as u64);
        }
        Ok(())
    }

    /// Bind a thread to a CPU and PD and let it run
    pub(crate) fn start_thread(
        &mut self,
        caller: ObjectId,
        thread_cap: CapId,
        cpu: Word,
        pd_cap: CapId,
        ip: Word,
        sp: Word,
    ) -> KernResult<()> {
        let thread = self.lookup_kind(caller, thread_cap, ObjectKind::Thread)?;
        let pd = self.lookup_kind(caller, pd_cap, ObjectKind::Pd)?;
        if cpu >= self.cpus.len() {
            return Err(KernelError::InvalidArgument);
        }
        let t = self.objects.thread_mut(thread)?;
        if t.state != ThreadState::AwaitsStart {
            return Err(KernelError::Denied);
        }
        t.pd = Some(pd);
        t.cpu = CpuId(cpu);
        t.context = UserContext::new(ip, sp);
        self.objects.pd_mut(pd)?.threads.insert(thread);
        log::debug!(
            "{}: start {} on cpu{} at {:#x}",
            self.label_of(caller),
            self.label_of(thread),
            cpu,
            ip
        );
        self.set_state(thread, ThreadState::Active);
        Ok(())
    }

    /// Pause an active thread
    pub(crate) fn pause(&mut self, thread: ObjectId) -> KernResult<()> {
        match self.objects.thread(thread)?.state {
            ThreadState::Active | ThreadState::AwaitsResume => {
                self.set_state(thread, ThreadState::AwaitsResume);
                Ok(())
            }
            _ => Err(KernelError::Denied),
        }
    }

    /// Resume a paused thread or cancel its IPC or signal wait
    pub(crate) fn resume(&mut self, thread: ObjectId) -> KernResult<()> {
        match self.objects.thread(thread)?.state {
            ThreadState::AwaitsResume => {
                self.set_state(thread, ThreadState::Active);
                Ok(())
            }
            ThreadState::AwaitsIpc => {
                self.ipc_cancel_wait(thread);
                Ok(())
            }
            ThreadState::AwaitsSignal => {
                self.signal_cancel_wait(thread);
                self.wake(thread, KernelError::Denied.as_word());
                Ok(())
            }
            _ => Err(KernelError::Denied),
        }
    }

    /// Resume a thread of the caller's own PD
    pub(crate) fn resume_local(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        let target = self.lookup_kind(caller, cap, ObjectKind::Thread)?;
        if self.objects.thread(target)?.pd != self.objects.thread(caller)?.pd {
            log::warn!(
                "{}: cannot resume a thread of another pd",
                self.label_of(caller)
            );
            return Err(KernelError::Denied);
        }
        self.resume(target)
    }

    /// Give up the CPU, optionally handing it to a paused local thread
    pub(crate) fn yield_thread(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        if cap.is_valid() {
            let target = self.lookup_kind(caller, cap, ObjectKind::Thread)?;
            let same_pd = self.objects.thread(target)?.pd == self.objects.thread(caller)?.pd;
            if same_pd && self.objects.thread(target)?.state == ThreadState::AwaitsResume {
                self.set_state(target, ThreadState::Active);
            } else {
                log::warn!("{}: failed to receive yielded cpu", self.label_of(target));
            }
        }
        let cpu = self.objects.thread(caller)?.cpu;
        if self.cpus[cpu.0].scheduler.current() == Some(caller) {
            self.cpus[cpu.0].scheduler.yield_current();
        }
        Ok(())
    }

    /// Delete a thread on behalf of core
    pub(crate) fn delete_thread(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        let thread = self.lookup_kind(caller, cap, ObjectKind::Thread)?;
        if thread == self.core_thread || thread == caller {
            return Err(KernelError::Denied);
        }
        self.destroy_thread(thread);
        Ok(())
    }

    /// Unlink `thread` from every structure and free its id
    pub(crate) fn destroy_thread(&mut self, thread: ObjectId) {
        self.set_state(thread, ThreadState::Stopped);
        self.ipc_detach(thread);
        self.signal_cancel_wait(thread);
        self.vm_cancel_wait(thread);
        self.disarm_timeout(thread);
        for cpu in 0..self.cpus.len() {
            if self.cpus[cpu].running == Some(thread) {
                self.cpus[cpu].running = None;
                self.kick(CpuId(cpu));
            }
        }
        let pd = self.objects.thread(thread).ok().and_then(|t| t.pd);
        if let Some(pd) = pd.and_then(|pd| self.objects.pd_mut(pd).ok()) {
            pd.threads.remove(&thread);
        }
        self.retire(thread);
    }

    /// Route the fault event of a thread to a signal context
    ///
    /// An invalid context selector removes the route.
    pub(crate) fn route_thread_event(
        &mut self,
        caller: ObjectId,
        thread_cap: CapId,
        event: Word,
        ctx_cap: CapId,
    ) -> KernResult<()> {
        let thread = self.lookup_kind(caller, thread_cap, ObjectKind::Thread)?;
        if event != EVENT_FAULT {
            return Err(KernelError::InvalidArgument);
        }
        let ctx = if ctx_cap.is_valid() {
            Some(self.lookup_kind(caller, ctx_cap, ObjectKind::SignalContext)?)
        } else {
            None
        };
        self.objects.thread_mut(thread)?.fault_ctx = ctx;
        Ok(())
    }

    /// Read or write one register of a thread, returns the old value
    pub(crate) fn access_thread_regs(
        &mut self,
        caller: ObjectId,
        thread_cap: CapId,
        reg: Word,
        write: bool,
        value: Word,
    ) -> KernResult<Word> {
        let thread = self.lookup_kind(caller, thread_cap, ObjectKind::Thread)?;
        let t = self.objects.thread_mut(thread)?;
        let fault = t.fault;
        let old = match reg {
            reg::IP => t.context.ip(),
            reg::SP => t.context.sp(),
            reg::FAULT_ADDR => fault.map_or(0, |f| f.addr),
            reg::FAULT_WRITE => fault.map_or(0, |f| f.write as Word),
            reg::FAULT_KIND => fault.map_or(0, |f| f.kind as Word),
            reg::PSTATE => t.context.pstate,
            r if (reg::ARG_BASE..reg::ARG_BASE + GENERAL_REGS).contains(&r) => {
                t.context.regs[r - reg::ARG_BASE]
            }
            _ => return Err(KernelError::InvalidArgument),
        };
        if write {
            match reg {
                reg::IP => t.context.set_ip(value),
                reg::SP => t.context.set_sp(value),
                reg::FAULT_ADDR | reg::FAULT_WRITE | reg::FAULT_KIND => {
                    return Err(KernelError::Denied)
                }
                reg::PSTATE => t.context.pstate = value,
                r => t.context.regs[r - reg::ARG_BASE] = value,
            }
        }
        Ok(old)
    }

    /// Delegate a fault of `thread` to its fault handler, or halt it
    pub(crate) fn handle_fault(&mut self, thread: ObjectId, kind: FaultKind, addr: Word, write: bool) {
        let ctx = match self.objects.thread_mut(thread) {
            Ok(t) => {
                t.fault = Some(FaultInfo {
                    kind,
                    addr,
                    write,
                    ip: t.context.ip(),
                });
                t.fault_ctx
            }
            Err(_) => return,
        };
        if let Some(ctx) = ctx {
            log::debug!("{}: {} at {:#x}", self.label_of(thread), kind.name(), addr);
            self.set_state(thread, ThreadState::AwaitsResume);
            if self.submit(ctx, 1).is_ok() {
                return;
            }
        }
        log::warn!(
            "{}: unresolved {} at {:#x}, thread halted",
            self.label_of(thread),
            kind.name(),
            addr
        );
        self.set_state(thread, ThreadState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::kernel::Proceed;
    use crate::kern::syscall_sw::CallId;
    use crate::kern::testing::Machine;

    #[test]
    fn test_effective_priority() {
        let mut t = Thread::new(label("t"), Priority::new(10));
        assert_eq!(t.effective_priority(), Priority::new(10));
        t.donated = Some(Priority::new(5));
        assert_eq!(t.effective_priority(), Priority::new(10));
        t.donated = Some(Priority::new(50));
        assert_eq!(t.effective_priority(), Priority::new(50));
    }

    #[test]
    fn test_new_and_start() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let cap = m.new_thread("worker", 10);
        let id = m.id_of(cap);
        assert_eq!(m.state(id), Some(ThreadState::AwaitsStart));
        assert_eq!(m.kernel.lock().label_of(id), "worker");

        assert_eq!(m.start(cap, 1, pd), 0);
        assert_eq!(m.state(id), Some(ThreadState::Active));
        assert_eq!(m.running(CpuId(1)), Some(id));

        // starting twice is refused
        assert_eq!(m.start(cap, 1, pd), KernelError::Denied.as_word());
    }

    #[test]
    fn test_start_rejects_bad_cpu_and_priority() {
        let mut m = Machine::boot(1);
        let pd = m.new_pd("app");
        let cap = m.new_thread("worker", 10);
        assert_eq!(m.start(cap, 4, pd), KernelError::InvalidArgument.as_word());
        let ret = m.core_call(&[CallId::NewThread as Word, 128]);
        assert_eq!(ret, KernelError::InvalidArgument.as_word());
    }

    #[test]
    fn test_priority_respected() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (_, lo) = m.spawn("lo", 10, 1, pd);
        assert_eq!(m.running(CpuId(1)), Some(lo));
        let (_, hi) = m.spawn("hi", 20, 1, pd);
        assert_eq!(m.running(CpuId(1)), Some(hi));

        // hi keeps the cpu across slices while it stays ready
        for _ in 0..3 {
            assert_eq!(m.tick(CpuId(1), 20_000), Proceed::Thread(hi));
        }
        assert_eq!(m.call(CpuId(1), &[CallId::PauseCurrentThread as Word]), 0);
        assert_eq!(m.running(CpuId(1)), Some(lo));
    }

    #[test]
    fn test_round_robin_between_equals() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (_, a) = m.spawn("a", 10, 1, pd);
        let (_, b) = m.spawn("b", 10, 1, pd);
        assert_eq!(m.running(CpuId(1)), Some(a));
        let quantum = m.kernel.lock().config().quantum_us;
        assert_eq!(m.tick(CpuId(1), quantum), Proceed::Thread(b));
        assert_eq!(m.tick(CpuId(1), quantum), Proceed::Thread(a));
    }

    #[test]
    fn test_quota_rotates_earlier() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let quantum = m.kernel.lock().config().quantum_us;
        let short_cap = m.new_thread_with_quota("short", 10, 2_000);
        assert_eq!(m.start(short_cap, 1, pd), 0);
        m.settle();
        let short = m.id_of(short_cap);
        let (long_cap, long) = m.spawn("long", 10, 1, pd);
        assert_eq!(m.running(CpuId(1)), Some(short));
        assert_eq!(m.soft_timer.tick_us(CpuId(1)), 2_000);

        assert_eq!(m.tick(CpuId(1), 2_000), Proceed::Thread(long));
        assert_eq!(m.soft_timer.tick_us(CpuId(1)), quantum);
        assert_eq!(m.tick(CpuId(1), 2_000), Proceed::Thread(long));
        assert_eq!(m.tick(CpuId(1), quantum - 2_000), Proceed::Thread(short));

        // a new quota applies from the next slice of the thread
        let ret = m.core_call(&[CallId::ThreadQuota as Word, long_cap.as_word(), 500]);
        assert_eq!(ret, 0);
        assert_eq!(m.tick(CpuId(1), 2_000), Proceed::Thread(long));
        assert_eq!(m.soft_timer.tick_us(CpuId(1)), 500);
        assert_eq!(m.tick(CpuId(1), 500), Proceed::Thread(short));
    }

    #[test]
    fn test_pause_and_resume() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (cap, t) = m.spawn("t", 10, 1, pd);

        assert_eq!(m.core_call(&[CallId::PauseThread as Word, cap.as_word()]), 0);
        m.settle();
        assert_eq!(m.state(t), Some(ThreadState::AwaitsResume));
        assert_eq!(m.running(CpuId(1)), None);

        assert_eq!(m.core_call(&[CallId::ResumeThread as Word, cap.as_word()]), 0);
        m.settle();
        assert_eq!(m.running(CpuId(1)), Some(t));

        // an active thread cannot be resumed
        assert_eq!(
            m.core_call(&[CallId::ResumeThread as Word, cap.as_word()]),
            KernelError::Denied.as_word()
        );
    }

    #[test]
    fn test_yield_hands_cpu_to_paused_sibling() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (_, a) = m.spawn("a", 10, 1, pd);
        let (b_cap, b) = m.spawn("b", 10, 1, pd);
        m.core_call(&[CallId::PauseThread as Word, b_cap.as_word()]);
        m.settle();

        let b_local = m.grant(pd, b_cap);
        assert_eq!(m.call(CpuId(1), &[CallId::YieldThread as Word, b_local.as_word()]), 0);
        assert_eq!(m.state(b), Some(ThreadState::Active));
        assert_eq!(m.running(CpuId(1)), Some(b));
        assert_eq!(m.state(a), Some(ThreadState::Active));
    }

    #[test]
    fn test_unhandled_fault_stops_thread() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (_, t) = m.spawn("t", 10, 1, pd);
        let proceed = m.fault(CpuId(1), FaultKind::PageFault, 0xdead_0000, true);
        assert_eq!(proceed, Proceed::Idle);
        assert_eq!(m.state(t), Some(ThreadState::Stopped));
    }

    #[test]
    fn test_fault_routed_to_pager() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (cap, t) = m.spawn("t", 10, 1, pd);
        let rcv = m.new_receiver();
        let ctx = m.new_context(rcv, 77);
        let ret = m.core_call(&[
            CallId::RouteThreadEvent as Word,
            cap.as_word(),
            EVENT_FAULT,
            ctx.as_word(),
        ]);
        assert_eq!(ret, 0);

        m.fault(CpuId(1), FaultKind::PageFault, 0x4000_1234, true);
        assert_eq!(m.state(t), Some(ThreadState::AwaitsResume));

        // the pager picks up the signal and inspects the fault
        assert_eq!(m.core_call(&[CallId::AwaitSignal as Word, rcv.as_word()]), 0);
        assert_eq!(m.signals(m.core)[0].imprint, 77);
        let read = |m: &mut Machine, r: Word| {
            assert_eq!(
                m.core_call(&[CallId::AccessThreadRegs as Word, cap.as_word(), r, 0, 0]),
                0
            );
            m.core_arg(1)
        };
        assert_eq!(read(&mut m, reg::FAULT_ADDR), 0x4000_1234);
        assert_eq!(read(&mut m, reg::FAULT_WRITE), 1);
        assert_eq!(read(&mut m, reg::FAULT_KIND), FaultKind::PageFault as Word);

        // fault registers are read-only
        let ret = m.core_call(&[CallId::AccessThreadRegs as Word, cap.as_word(), reg::FAULT_ADDR, 1, 0]);
        assert_eq!(ret, KernelError::Denied.as_word());

        m.core_call(&[CallId::AccessThreadRegs as Word, cap.as_word(), reg::IP, 1, 0x9000]);
        let x19 = reg::ARG_BASE + 19;
        m.core_call(&[CallId::AccessThreadRegs as Word, cap.as_word(), x19, 1, 0x55]);
        assert_eq!(read(&mut m, x19), 0x55);
        let ret = m.core_call(&[
            CallId::AccessThreadRegs as Word,
            cap.as_word(),
            reg::ARG_BASE + GENERAL_REGS,
            0,
            0,
        ]);
        assert_eq!(ret, KernelError::InvalidArgument.as_word());
        assert_eq!(m.core_call(&[CallId::ResumeThread as Word, cap.as_word()]), 0);
        m.settle();
        assert_eq!(m.running(CpuId(1)), Some(t));
        assert_eq!(m.kernel.lock().thread_context(t).map(|c| c.ip), Some(0x9000));
        assert_eq!(m.kernel.lock().thread_context(t).map(|c| c.regs[19]), Some(0x55));
    }

    #[test]
    fn test_delete_thread() {
        let mut m = Machine::boot(2);
        let pd = m.new_pd("app");
        let (cap, t) = m.spawn("t", 10, 1, pd);
        assert_eq!(m.core_call(&[CallId::DeleteThread as Word, cap.as_word()]), 0);
        assert_eq!(m.state(t), None);
        m.settle();
        assert_eq!(m.running(CpuId(1)), None);

        // the selector died with the thread
        assert_eq!(
            m.core_call(&[CallId::PauseThread as Word, cap.as_word()]),
            KernelError::Denied.as_word()
        );
        let core_cap = m.core_cap(m.core);
        assert_eq!(
            m.core_call(&[CallId::DeleteThread as Word, core_cap.as_word()]),
            KernelError::Denied.as_word()
        );
    }
}
