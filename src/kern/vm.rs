//! Virtual Machines
//!
//! A [`Vm`] is a schedulable job of its own. While running it competes
//! with the threads of its CPU by priority; every exit takes it out of the
//! scheduler, records the exit reason and notifies the monitor through the
//! VM's signal context. A monitor may also block in `run_vm` until the
//! next exit.

use super::kernel::KernelData;
use super::object::{KernelObject, ObjectKind};
use super::thread::ThreadState;
use crate::arch::CpuContext;
use crate::error::{KernResult, KernelError, CALL_SUCCESS};
use crate::types::{CapId, CpuId, ObjectId, Priority, Word};

/// Virtual machine job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vm {
    pub cpu: CpuId,
    /// Context submitted on every exit
    pub ctx: Option<ObjectId>,
    pub prio: Priority,
    /// Linked into the scheduler of `cpu`
    pub running: bool,
    /// Reason of the last exit
    pub exit: Option<Word>,
    pub exits: u64,
    /// Monitor thread blocked until the next exit
    pub waiter: Option<ObjectId>,
}

impl Vm {
    pub fn new(cpu: CpuId, ctx: ObjectId, prio: Priority) -> Self {
        Self {
            cpu,
            ctx: Some(ctx),
            prio,
            running: false,
            exit: None,
            exits: 0,
            waiter: None,
        }
    }
}

impl KernelData {
    pub(crate) fn new_vm(
        &mut self,
        caller: ObjectId,
        cpu: Word,
        ctx_cap: CapId,
        prio: Word,
    ) -> KernResult<CapId> {
        if cpu >= self.cpus.len() {
            return Err(KernelError::InvalidArgument);
        }
        let prio = Priority::from_word(prio).ok_or(KernelError::InvalidArgument)?;
        let ctx = self.lookup_kind(caller, ctx_cap, ObjectKind::SignalContext)?;
        let vm = Vm::new(CpuId(cpu), ctx, prio);
        let (_, cap) = self.create(caller, KernelObject::Vm(alloc::boxed::Box::new(vm)))?;
        Ok(cap)
    }

    /// Let a VM run, `true` if the caller waits for its next exit
    pub(crate) fn run_vm(&mut self, caller: ObjectId, cap: CapId, wait: bool) -> KernResult<bool> {
        let vm = self.lookup_kind(caller, cap, ObjectKind::Vm)?;
        let v = self.objects.vm_mut(vm)?;
        if wait && v.waiter.is_some_and(|w| w != caller) {
            return Err(KernelError::Denied);
        }
        let (cpu, prio) = (v.cpu, v.prio);
        if !v.running {
            v.running = true;
            let scheduler = &mut self.cpus[cpu.0].scheduler;
            let preempts = scheduler.would_preempt(prio);
            scheduler.ready(vm, prio);
            if preempts {
                self.kick(cpu);
            }
        }
        if !wait {
            return Ok(false);
        }
        self.objects.vm_mut(vm)?.waiter = Some(caller);
        self.objects.thread_mut(caller)?.vm_wait = Some(vm);
        self.set_state(caller, ThreadState::AwaitsVm);
        Ok(true)
    }

    /// Take a VM off its CPU
    fn stop_vm(&mut self, vm: ObjectId) {
        let cpu = match self.objects.vm_mut(vm) {
            Ok(v) => {
                v.running = false;
                v.cpu
            }
            Err(_) => return,
        };
        let local = &mut self.cpus[cpu.0];
        let was_current = local.scheduler.current() == Some(vm);
        local.scheduler.unready(vm);
        if was_current || local.running == Some(vm) {
            self.kick(cpu);
        }
    }

    /// Release the monitor waiting on `vm`
    fn release_waiter(&mut self, vm: ObjectId, ret: Word, reason: Option<Word>) {
        let waiter = match self.objects.vm_mut(vm) {
            Ok(v) => v.waiter.take(),
            Err(_) => None,
        };
        let Some(waiter) = waiter else {
            return;
        };
        if let Ok(t) = self.objects.thread_mut(waiter) {
            t.vm_wait = None;
            if let Some(reason) = reason {
                t.context.set_arg(1, reason);
            }
        }
        self.wake(waiter, ret);
    }

    pub(crate) fn pause_vm(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        let vm = self.lookup_kind(caller, cap, ObjectKind::Vm)?;
        self.stop_vm(vm);
        self.release_waiter(vm, CALL_SUCCESS as Word, None);
        Ok(())
    }

    /// A VM trapped out on the local CPU
    pub(crate) fn vm_exit(&mut self, vm: ObjectId, reason: Word) {
        self.stop_vm(vm);
        let ctx = match self.objects.vm_mut(vm) {
            Ok(v) => {
                v.exit = Some(reason);
                v.exits += 1;
                v.ctx
            }
            Err(_) => return,
        };
        log::trace!("vm {}: exit {:#x}", vm, reason);
        if let Some(ctx) = ctx {
            if self.submit(ctx, 1).is_err() {
                log::warn!("vm {}: exit context revoked", vm);
            }
        }
        self.release_waiter(vm, CALL_SUCCESS as Word, Some(reason));
    }

    pub(crate) fn delete_vm(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        let vm = self.lookup_kind(caller, cap, ObjectKind::Vm)?;
        self.stop_vm(vm);
        self.release_waiter(vm, KernelError::Denied.as_word(), None);
        for cpu in self.cpus.iter_mut() {
            if cpu.running == Some(vm) {
                cpu.running = None;
            }
        }
        self.retire(vm);
        Ok(())
    }

    /// Unlink `thread` from the VM it waits on
    pub(crate) fn vm_cancel_wait(&mut self, thread: ObjectId) {
        let vm = match self.objects.thread_mut(thread) {
            Ok(t) => t.vm_wait.take(),
            Err(_) => None,
        };
        if let Some(v) = vm.and_then(|vm| self.objects.vm_mut(vm).ok()) {
            if v.waiter == Some(thread) {
                v.waiter = None;
            }
        }
    }

    /// Last exit reason and exit count of a VM
    pub fn vm_status(&self, vm: ObjectId) -> Option<(Option<Word>, u64)> {
        self.objects.vm(vm).ok().map(|v| (v.exit, v.exits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::kernel::Proceed;
    use crate::kern::syscall_sw::CallId;
    use crate::kern::testing::Machine;

    fn setup() -> (Machine, CapId, CapId, ObjectId) {
        let mut m = Machine::boot(2);
        let rcv = m.new_receiver();
        let ctx = m.new_context(rcv, 0x77);
        let vm = m.core_call(&[CallId::NewVm as Word, 1, ctx.as_word(), 20]);
        let vm = CapId::from_word(vm);
        let id = m.id_of(vm);
        (m, rcv, vm, id)
    }

    #[test]
    fn test_new_vm_arguments() {
        let (mut m, rcv, ..) = setup();
        let ctx = m.new_context(rcv, 1);
        assert_eq!(
            m.core_call(&[CallId::NewVm as Word, 9, ctx.as_word(), 20]),
            KernelError::InvalidArgument.as_word()
        );
        assert_eq!(
            m.core_call(&[CallId::NewVm as Word, 1, ctx.as_word(), 300]),
            KernelError::InvalidArgument.as_word()
        );
        assert_eq!(
            m.core_call(&[CallId::NewVm as Word, 1, rcv.as_word(), 20]),
            KernelError::Denied.as_word()
        );
    }

    #[test]
    fn test_run_until_exit() {
        let (mut m, rcv, vm, id) = setup();
        assert_eq!(m.core_call(&[CallId::RunVm as Word, vm.as_word(), 0]), 0);
        m.settle();
        assert_eq!(m.running(CpuId(1)), Some(id));

        assert_eq!(m.vm_exit(CpuId(1), 0x1c), Proceed::Idle);
        assert_eq!(m.kernel.lock().vm_status(id), Some((Some(0x1c), 1)));
        assert_eq!(m.core_call(&[CallId::SignalPending as Word, rcv.as_word()]), 1);
    }

    #[test]
    fn test_monitor_waits_for_exit() {
        let (mut m, _, vm, id) = setup();
        let core = m.core;
        m.core_call(&[CallId::RunVm as Word, vm.as_word(), 1]);
        assert_eq!(m.state(core), Some(ThreadState::AwaitsVm));
        m.settle();
        assert_eq!(m.running(CpuId(1)), Some(id));

        m.vm_exit(CpuId(1), 5);
        assert_eq!(m.state(core), Some(ThreadState::Active));
        assert_eq!(m.ret(core), 0);
        let data = m.kernel.lock();
        assert_eq!(data.thread_context(core).map(|c| c.arg(1)), Some(5));
    }

    #[test]
    fn test_pause_vm() {
        let (mut m, _, vm, id) = setup();
        m.core_call(&[CallId::RunVm as Word, vm.as_word(), 0]);
        m.settle();
        assert_eq!(m.core_call(&[CallId::PauseVm as Word, vm.as_word()]), 0);
        m.settle();
        assert_eq!(m.running(CpuId(1)), None);
        let data = m.kernel.lock();
        assert!(!data.cpu(CpuId(1)).unwrap().scheduler.is_ready(id));
    }

    #[test]
    fn test_delete_running_vm() {
        let (mut m, _, vm, id) = setup();
        m.core_call(&[CallId::RunVm as Word, vm.as_word(), 0]);
        m.settle();
        assert_eq!(m.core_call(&[CallId::DeleteVm as Word, vm.as_word()]), 0);
        m.settle();
        assert_eq!(m.running(CpuId(1)), None);
        assert!(m.kernel.lock().objects().get(id).is_none());
        assert_eq!(
            m.core_call(&[CallId::RunVm as Word, vm.as_word(), 0]),
            KernelError::Denied.as_word()
        );
    }
}
