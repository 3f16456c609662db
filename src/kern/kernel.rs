//! Kernel instance and entry path
//!
//! All mutable kernel state lives in one [`KernelData`] behind a single
//! spin lock. A kernel pass on any CPU takes the lock for its whole
//! duration:
//!
//! 1. account the trapped job's time and save its registers,
//! 2. fire expired timeouts,
//! 3. handle the trap (system call, interrupts, fault, VM exit),
//! 4. run the local scheduler and load the selected job's registers.
//!
//! Nothing inside a pass blocks. A thread that has to wait changes its
//! state and leaves the ready structure; the pass then simply selects
//! someone else.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard, Once};

use super::id_alloc::IdAllocator;
use super::object::{KernelObject, ObjectKind, ObjectTable};
use super::pd::{Pd, MAX_ASIDS};
use super::processor::Cpu;
use super::thread::{Thread, ThreadState};
use crate::arch::{CpuContext, UserContext};
use crate::board::Board;
use crate::config::KernelConfig;
use crate::console::Console;
use crate::error::{KernResult, KernelError};
use crate::ipc::message::{label, Utcb};
use crate::trap::Trap;
use crate::types::{CapId, CpuId, IrqLine, ObjectId, Priority, Word};

// ============================================================================
// Proceed
// ============================================================================

/// Job a CPU returns to at the end of a kernel pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proceed {
    /// Resume a user thread, its registers are in the frame
    Thread(ObjectId),
    /// Enter a virtual machine
    Vm(ObjectId),
    /// Nothing ready, wait for an interrupt
    Idle,
}

// ============================================================================
// Kernel Data
// ============================================================================

/// Everything the kernel lock protects
#[derive(Debug)]
pub struct KernelData {
    pub(crate) config: KernelConfig,
    pub(crate) objects: ObjectTable,
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) board: Board,
    pub(crate) core_pd: ObjectId,
    pub(crate) core_thread: ObjectId,
    /// Interrupt lines claimed by user-level IRQ objects
    pub(crate) irq_lines: BTreeMap<IrqLine, ObjectId>,
    /// Address space ids of user PDs
    pub(crate) asids: IdAllocator,
    /// ASIDs of deleted PDs, with the number of CPUs yet to flush them
    pub(crate) retiring_asids: BTreeMap<u32, usize>,
    pub(crate) console: Console,
    /// CPU executing the current kernel pass
    pub(crate) cpu: CpuId,
}

impl KernelData {
    fn new(config: KernelConfig, board: Board) -> KernResult<Self> {
        config.validate()?;
        let mut data = Self {
            objects: ObjectTable::new(config.max_objects),
            cpus: (0..config.cpus)
                .map(|n| Cpu::new(CpuId(n), config.quantum_us))
                .collect(),
            board,
            core_pd: ObjectId::default(),
            core_thread: ObjectId::default(),
            irq_lines: BTreeMap::new(),
            asids: IdAllocator::new(1, MAX_ASIDS - 1),
            retiring_asids: BTreeMap::new(),
            console: Console::new(),
            cpu: CpuId::PRIMARY,
            config,
        };
        for cpu in (0..data.cpus.len()).map(CpuId) {
            data.board.timer.configure(cpu, data.config.quantum_us);
            let line = data.board.timer.irq_line(cpu);
            data.board.pic.unmask(line, cpu);
        }

        let core_pd = Pd::new(label("core"), 0, 0, data.config.max_caps, true);
        let pd_ref = data.objects.insert(KernelObject::Pd(Box::new(core_pd)))?;
        data.core_pd = pd_ref.id;

        let mut thread = Thread::new(label("core"), Priority::MAX);
        thread.pd = Some(pd_ref.id);
        thread.context = UserContext::new(data.config.core_ip, data.config.core_sp);
        let thread_ref = data.objects.insert(KernelObject::Thread(Box::new(thread)))?;
        data.core_thread = thread_ref.id;

        let pd = data.objects.pd_mut(pd_ref.id)?;
        pd.threads.insert(thread_ref.id);
        pd.caps.insert(pd_ref)?;
        pd.caps.insert(thread_ref)?;
        data.set_state(thread_ref.id, ThreadState::Active);

        log::info!(
            "kernel: {} cpu(s), quantum {}us, core pd {} thread {}",
            data.config.cpus,
            data.config.quantum_us,
            data.core_pd,
            data.core_thread
        );
        Ok(data)
    }

    // ------------------------------------------------------------------------
    // Entry path
    // ------------------------------------------------------------------------

    fn enter(&mut self, cpu: CpuId) {
        assert!(cpu.0 < self.cpus.len(), "kernel: entry on unknown {}", cpu);
        self.cpu = cpu;
        let now = self.board.timer.now_us(cpu);
        let local = &mut self.cpus[cpu.0];
        let consumed = now.saturating_sub(local.last_us);
        local.last_us = now;
        local.passes += 1;
        local.scheduler.update(consumed);
    }

    /// Save the trapped job's registers
    fn save(&mut self, cpu: CpuId, frame: &UserContext) {
        if let Some(id) = self.cpus[cpu.0].running {
            if let Ok(thread) = self.objects.thread_mut(id) {
                thread.context = *frame;
            }
        }
    }

    /// Thread the trap is attributed to
    ///
    /// A thread another CPU blocked while it was still executing here has
    /// its trap ignored. It re-executes the trapping instruction once it
    /// runs again.
    fn running_thread(&self, cpu: CpuId) -> Option<ObjectId> {
        self.cpus[cpu.0]
            .running
            .filter(|&id| self.thread_state(id) == Some(ThreadState::Active))
    }

    fn dispatch(&mut self, cpu: CpuId, trap: Trap) {
        log::trace!("{}: kernel entry ({})", cpu, trap.name());
        match trap {
            Trap::Reset => {}
            Trap::Syscall => match self.running_thread(cpu) {
                Some(thread) => self.syscall(thread),
                None => log::debug!("{}: syscall without a running thread", cpu),
            },
            Trap::Interrupt => self.handle_interrupts(cpu),
            Trap::Fault { kind, addr, write } => match self.running_thread(cpu) {
                Some(thread) => self.handle_fault(thread, kind, addr, write),
                None => log::debug!("{}: fault without a running thread", cpu),
            },
            Trap::VmExit { reason } => {
                let vm = self.cpus[cpu.0]
                    .running
                    .filter(|&id| self.objects.kind(id) == Some(ObjectKind::Vm));
                match vm {
                    Some(vm) => self.vm_exit(vm, reason),
                    None => log::debug!("{}: vm exit without a running vm", cpu),
                }
            }
        }
    }

    /// Arm the timer of `cpu` for the end of the current slice or the
    /// nearest timeout, whichever comes first
    fn program_timer(&mut self, cpu: CpuId) {
        let now = self.now_us(cpu);
        let local = &self.cpus[cpu.0];
        let mut tick = match local.scheduler.current() {
            Some(_) => local.scheduler.remaining_us(),
            None => self.config.quantum_us,
        };
        if let Some(deadline) = local.timeouts.next_deadline() {
            tick = tick.min(deadline.saturating_sub(now));
        }
        let tick = tick.clamp(1, self.board.timer.max_timeout_us());
        self.board.timer.configure(cpu, tick);
    }

    /// Select the next job of `cpu` and load its registers
    fn schedule(&mut self, cpu: CpuId, frame: &mut UserContext) -> Proceed {
        let job = self.cpus[cpu.0].scheduler.schedule();
        self.cpus[cpu.0].running = job;
        let id = match job {
            Some(id) => id,
            None => return Proceed::Idle,
        };
        match self.objects.get_mut(id) {
            Some(KernelObject::Thread(thread)) => {
                if thread.state != ThreadState::Active || thread.cpu != cpu {
                    log::error!("scheduler: {} selected {} in state {}", cpu, id, thread.state.name());
                    panic!("scheduler: inconsistent ready set");
                }
                *frame = thread.context;
                let pd = thread.pd;
                if let Some(pd) = pd.and_then(|pd| self.objects.pd_mut(pd).ok()) {
                    pd.cpu_mask |= 1 << cpu.0;
                }
                Proceed::Thread(id)
            }
            Some(KernelObject::Vm(_)) => Proceed::Vm(id),
            _ => {
                log::error!("scheduler: {} selected dangling job {}", cpu, id);
                panic!("scheduler: dangling job");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers shared by the subsystems
    // ------------------------------------------------------------------------

    /// Resolve `cap` in the capability space of `thread`'s PD
    pub(crate) fn lookup(&self, thread: ObjectId, cap: CapId) -> KernResult<ObjectId> {
        let pd = self
            .objects
            .thread(thread)?
            .pd
            .ok_or(KernelError::Denied)?;
        let obj = self
            .objects
            .pd(pd)?
            .caps
            .lookup(cap)
            .ok_or(KernelError::Denied)?;
        self.objects.resolve(obj).ok_or(KernelError::Denied)
    }

    /// Resolve `cap` and check the kind of the object it names
    pub(crate) fn lookup_kind(
        &self,
        thread: ObjectId,
        cap: CapId,
        kind: ObjectKind,
    ) -> KernResult<ObjectId> {
        let id = self.lookup(thread, cap)?;
        if self.objects.kind(id) == Some(kind) {
            Ok(id)
        } else {
            Err(KernelError::Denied)
        }
    }

    /// Install a new object and hand `owner`'s PD a selector for it
    pub(crate) fn create(&mut self, owner: ObjectId, object: KernelObject) -> KernResult<(ObjectId, CapId)> {
        let pd = self.objects.thread(owner)?.pd.ok_or(KernelError::Denied)?;
        let kind = object.kind();
        let obj = self.objects.insert(object)?;
        match self.objects.pd_mut(pd)?.caps.insert(obj) {
            Ok(cap) => {
                log::debug!("{}: new {} {} (cap {})", self.label_of(owner), kind.name(), obj.id, cap.0);
                Ok((obj.id, cap))
            }
            Err(err) => {
                self.objects.remove(obj.id);
                Err(err)
            }
        }
    }

    /// Remove an object and every selector naming it
    pub(crate) fn retire(&mut self, id: ObjectId) -> Option<KernelObject> {
        for pd in self.objects.ids_of(ObjectKind::Pd) {
            if let Ok(pd) = self.objects.pd_mut(pd) {
                pd.caps.purge(id);
            }
        }
        let object = self.objects.remove(id);
        if let Some(object) = &object {
            log::debug!("kernel: destroyed {} {}", object.kind().name(), id);
        }
        object
    }

    /// Make `cpu` rerun its scheduler if it is not the local one
    pub(crate) fn kick(&mut self, cpu: CpuId) {
        if cpu == self.cpu || cpu.0 >= self.cpus.len() {
            return;
        }
        let remote = &mut self.cpus[cpu.0];
        if !remote.ipi_pending {
            remote.ipi_pending = true;
            self.board.pic.send_ipi(cpu);
        }
    }

    /// Is `thread` part of the core PD
    pub(crate) fn is_core(&self, thread: ObjectId) -> bool {
        self.objects
            .thread(thread)
            .map_or(false, |t| t.pd == Some(self.core_pd))
    }

    /// Label of a thread for log output
    pub(crate) fn label_of(&self, thread: ObjectId) -> &str {
        self.objects
            .thread(thread)
            .map_or("<dead>", |t| t.label.as_str())
    }

    pub(crate) fn now_us(&self, cpu: CpuId) -> u64 {
        self.board.timer.now_us(cpu)
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn core_pd(&self) -> ObjectId {
        self.core_pd
    }

    pub fn core_thread(&self) -> ObjectId {
        self.core_thread
    }

    pub fn cpu(&self, cpu: CpuId) -> Option<&Cpu> {
        self.cpus.get(cpu.0)
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Job that runs on `cpu` since the last kernel pass there
    pub fn running(&self, cpu: CpuId) -> Option<ObjectId> {
        self.cpus.get(cpu.0).and_then(|c| c.running)
    }

    pub fn thread_state(&self, thread: ObjectId) -> Option<ThreadState> {
        self.objects.thread(thread).ok().map(|t| t.state)
    }

    pub fn thread_context(&self, thread: ObjectId) -> Option<&UserContext> {
        self.objects.thread(thread).ok().map(|t| &t.context)
    }

    /// Primary return word of `thread`'s last system call
    pub fn thread_ret(&self, thread: ObjectId) -> Option<Word> {
        self.thread_context(thread).map(|ctx| ctx.ret())
    }

    pub fn utcb(&self, thread: ObjectId) -> Option<&Utcb> {
        self.objects.thread(thread).ok().map(|t| &t.utcb)
    }

    pub fn utcb_mut(&mut self, thread: ObjectId) -> Option<&mut Utcb> {
        self.objects.thread_mut(thread).ok().map(|t| &mut t.utcb)
    }

    pub fn console(&self) -> &Console {
        &self.console
    }
}

// ============================================================================
// Kernel
// ============================================================================

/// A kernel instance driving all CPUs of one machine
#[derive(Debug)]
pub struct Kernel {
    data: Mutex<KernelData>,
}

impl Kernel {
    /// Create the core PD and the core thread and arm the CPU timers
    pub fn boot(config: KernelConfig, board: Board) -> KernResult<Self> {
        Ok(Self {
            data: Mutex::new(KernelData::new(config, board)?),
        })
    }

    /// One kernel pass on `cpu`
    ///
    /// `frame` holds the user registers of the job that trapped and
    /// receives those of the job to proceed with.
    pub fn handle(&self, cpu: CpuId, trap: Trap, frame: &mut UserContext) -> Proceed {
        let mut data = self.data.lock();
        data.enter(cpu);
        if trap != Trap::Reset {
            data.save(cpu, frame);
        }
        let now = data.now_us(cpu);
        data.fire_timeouts(cpu, now);
        data.dispatch(cpu, trap);
        let proceed = data.schedule(cpu, frame);
        data.program_timer(cpu);
        proceed
    }

    /// Take the kernel lock for inspection or board-level setup
    pub fn lock(&self) -> MutexGuard<'_, KernelData> {
        self.data.lock()
    }
}

static KERNEL: Once<Kernel> = Once::new();

/// Boot the machine-wide kernel instance, once
pub fn init(config: KernelConfig, board: Board) -> KernResult<&'static Kernel> {
    KERNEL.try_call_once(|| Kernel::boot(config, board))
}

/// The machine-wide kernel instance, if booted
pub fn kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testing::Machine;

    #[test]
    fn test_boot_runs_core_thread() {
        let mut m = Machine::boot(2);
        let core = m.core;
        assert_eq!(m.reset(CpuId(0)), Proceed::Thread(core));
        assert_eq!(m.reset(CpuId(1)), Proceed::Idle);

        let data = m.kernel.lock();
        assert_eq!(data.thread_state(core), Some(ThreadState::Active));
        assert!(data.is_core(core));
        assert_eq!(data.objects().len(), 2);
        assert_eq!(m.soft_timer.tick_us(CpuId(1)), data.config().quantum_us);
    }

    #[test]
    fn test_boot_rejects_bad_config() {
        let board = crate::kern::testing::soft_board().0;
        let err = Kernel::boot(KernelConfig::default().with_cpus(0), board).err();
        assert_eq!(err, Some(KernelError::InvalidArgument));
    }

    #[test]
    fn test_global_instance() {
        let (board, ..) = crate::kern::testing::soft_board();
        let kernel = init(KernelConfig::default(), board).unwrap();
        assert!(core::ptr::eq(kernel, super::kernel().unwrap()));
        assert_eq!(kernel.lock().cpu_count(), 1);
    }
}
