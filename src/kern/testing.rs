//! Hosted test machine
//!
//! Boots a kernel on the in-memory board and plays the part of the CPUs:
//! every method runs one or more kernel passes with a register frame
//! built from the job that currently runs on the CPU.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::kernel::{Kernel, Proceed};
use super::syscall_sw::CallId;
use super::thread::ThreadState;
use crate::arch::{CpuContext, UserContext};
use crate::board::soft::{SoftMmu, SoftPic, SoftTimer, TIMER_LINE_BASE};
use crate::board::Board;
use crate::config::KernelConfig;
use crate::ipc::message::{label, Message, Signal};
use crate::trap::{FaultKind, Trap};
use crate::types::{CapId, CpuId, IrqLine, ObjectId, Word};

/// Entry point of spawned test threads
pub const THREAD_IP: Word = 0x10_0000;
/// Stack top of spawned test threads
pub const THREAD_SP: Word = 0x20_0000;

/// In-memory board plus host handles on its devices
pub fn soft_board() -> (Board, SoftPic, SoftTimer, SoftMmu) {
    let pic = SoftPic::new();
    let timer = SoftTimer::new();
    let mmu = SoftMmu::new();
    let board = Board::new(
        Box::new(pic.clone()),
        Box::new(timer.clone()),
        Box::new(mmu.clone()),
    );
    (board, pic, timer, mmu)
}

pub struct Machine {
    pub kernel: Kernel,
    pub soft_pic: SoftPic,
    pub soft_timer: SoftTimer,
    pub soft_mmu: SoftMmu,
    /// The core thread
    pub core: ObjectId,
    cpus: usize,
}

impl Machine {
    pub fn boot(cpus: usize) -> Self {
        Self::boot_config(KernelConfig::default().with_cpus(cpus))
    }

    pub fn boot_config(config: KernelConfig) -> Self {
        let cpus = config.cpus;
        let (board, soft_pic, soft_timer, soft_mmu) = soft_board();
        let kernel = Kernel::boot(config, board).expect("boot failed");
        let core = kernel.lock().core_thread();
        let mut machine = Self {
            kernel,
            soft_pic,
            soft_timer,
            soft_mmu,
            core,
            cpus,
        };
        for cpu in 0..cpus {
            machine.reset(CpuId(cpu));
        }
        machine
    }

    // ------------------------------------------------------------------------
    // Kernel passes
    // ------------------------------------------------------------------------

    fn frame(&self, cpu: CpuId) -> UserContext {
        let data = self.kernel.lock();
        data.running(cpu)
            .and_then(|id| data.thread_context(id).copied())
            .unwrap_or_default()
    }

    fn pass(&mut self, cpu: CpuId, trap: Trap) -> Proceed {
        let mut frame = self.frame(cpu);
        self.kernel.handle(cpu, trap, &mut frame)
    }

    pub fn reset(&mut self, cpu: CpuId) -> Proceed {
        self.pass(cpu, Trap::Reset)
    }

    /// Handle pending interrupts on `cpu`
    pub fn interrupt(&mut self, cpu: CpuId) -> Proceed {
        self.pass(cpu, Trap::Interrupt)
    }

    /// Run interrupt passes until no CPU has anything pending
    pub fn settle(&mut self) {
        for _ in 0..1000 {
            let pending: Vec<CpuId> = (0..self.cpus)
                .map(CpuId)
                .filter(|&cpu| self.soft_pic.has_pending(cpu))
                .collect();
            if pending.is_empty() {
                return;
            }
            for cpu in pending {
                self.interrupt(cpu);
            }
        }
        panic!("machine does not settle");
    }

    /// Let `us` pass on `cpu` and deliver its timer interrupt
    pub fn tick(&mut self, cpu: CpuId, us: u64) -> Proceed {
        self.settle();
        self.soft_timer.advance_cpu(cpu, us);
        self.soft_pic.raise(TIMER_LINE_BASE + cpu.0 as IrqLine);
        self.interrupt(cpu)
    }

    pub fn fault(&mut self, cpu: CpuId, kind: FaultKind, addr: Word, write: bool) -> Proceed {
        self.settle();
        self.pass(cpu, Trap::Fault { kind, addr, write })
    }

    pub fn vm_exit(&mut self, cpu: CpuId, reason: Word) -> Proceed {
        self.settle();
        self.pass(cpu, Trap::VmExit { reason })
    }

    /// Issue a system call from the thread running on `cpu`
    pub fn call(&mut self, cpu: CpuId, args: &[Word]) -> Word {
        self.settle();
        let thread = self.running(cpu).expect("no thread to issue the call");
        let mut frame = self.frame(cpu);
        frame.load_call(args);
        self.kernel.handle(cpu, Trap::Syscall, &mut frame);
        self.kernel.lock().thread_ret(thread).unwrap_or(frame.ret())
    }

    /// Issue a system call from the core thread
    pub fn core_call(&mut self, args: &[Word]) -> Word {
        self.call(CpuId::PRIMARY, args)
    }

    // ------------------------------------------------------------------------
    // Object setup through core
    // ------------------------------------------------------------------------

    fn name_next(&mut self, name: &str) {
        let core = self.core;
        if let Some(utcb) = self.kernel.lock().utcb_mut(core) {
            utcb.name = label(name);
        }
    }

    fn core_new(&mut self, args: &[Word]) -> CapId {
        let cap = CapId::from_word(self.core_call(args));
        assert!(cap.is_valid(), "creation failed");
        cap
    }

    pub fn new_pd(&mut self, name: &str) -> CapId {
        self.name_next(name);
        self.core_new(&[CallId::NewPd as Word])
    }

    pub fn new_thread(&mut self, name: &str, prio: u8) -> CapId {
        self.name_next(name);
        self.core_new(&[CallId::NewThread as Word, prio as Word])
    }

    pub fn new_thread_with_quota(&mut self, name: &str, prio: u8, quota_us: u64) -> CapId {
        self.name_next(name);
        self.core_new(&[CallId::NewThread as Word, prio as Word, quota_us as Word])
    }

    pub fn start(&mut self, thread: CapId, cpu: usize, pd: CapId) -> Word {
        self.core_call(&[
            CallId::StartThread as Word,
            thread.as_word(),
            cpu,
            pd.as_word(),
            THREAD_IP,
            THREAD_SP,
        ])
    }

    /// Create and start a thread, returns core's selector and its id
    pub fn spawn(&mut self, name: &str, prio: u8, cpu: usize, pd: CapId) -> (CapId, ObjectId) {
        let cap = self.new_thread(name, prio);
        assert_eq!(self.start(cap, cpu, pd), 0, "start failed");
        self.settle();
        (cap, self.id_of(cap))
    }

    /// Install one of core's selectors into `pd`
    pub fn grant(&mut self, pd: CapId, obj: CapId) -> CapId {
        self.core_new(&[CallId::InstallCap as Word, pd.as_word(), obj.as_word()])
    }

    pub fn new_receiver(&mut self) -> CapId {
        self.core_new(&[CallId::NewSignalReceiver as Word])
    }

    pub fn new_context(&mut self, receiver: CapId, imprint: Word) -> CapId {
        self.core_new(&[CallId::NewSignalContext as Word, receiver.as_word(), imprint])
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Object named by one of core's selectors
    pub fn id_of(&self, cap: CapId) -> ObjectId {
        self.kernel
            .lock()
            .lookup(self.core, cap)
            .expect("dangling core selector")
    }

    /// Core's selector of an object
    pub fn core_cap(&self, id: ObjectId) -> CapId {
        let data = self.kernel.lock();
        let obj = data.objects().reference(id).expect("dead object");
        let core_pd = data.core_pd();
        data.objects()
            .pd(core_pd)
            .ok()
            .and_then(|pd| pd.caps.find(obj))
            .expect("core holds no selector")
    }

    pub fn running(&self, cpu: CpuId) -> Option<ObjectId> {
        self.kernel.lock().running(cpu)
    }

    pub fn state(&self, thread: ObjectId) -> Option<ThreadState> {
        self.kernel.lock().thread_state(thread)
    }

    pub fn ret(&self, thread: ObjectId) -> Word {
        self.kernel.lock().thread_ret(thread).expect("dead thread")
    }

    /// Call argument `index` of the core thread
    pub fn core_arg(&self, index: usize) -> Word {
        let data = self.kernel.lock();
        data.thread_context(self.core).map_or(0, |ctx| ctx.arg(index))
    }

    pub fn signals(&self, thread: ObjectId) -> Vec<Signal> {
        self.kernel
            .lock()
            .utcb(thread)
            .map(|utcb| utcb.signals.clone())
            .unwrap_or_default()
    }

    pub fn set_msg(&mut self, thread: ObjectId, words: &[Word]) {
        if let Some(utcb) = self.kernel.lock().utcb_mut(thread) {
            utcb.msg = Message::from_words(words);
        }
    }

    pub fn set_caps(&mut self, thread: ObjectId, caps: &[CapId]) {
        if let Some(utcb) = self.kernel.lock().utcb_mut(thread) {
            utcb.msg.caps.clear();
            for &cap in caps {
                utcb.msg.push_cap(cap);
            }
        }
    }

    pub fn msg(&self, thread: ObjectId) -> Vec<Word> {
        self.kernel
            .lock()
            .utcb(thread)
            .map(|utcb| utcb.msg.words.to_vec())
            .unwrap_or_default()
    }

    pub fn msg_caps(&self, thread: ObjectId) -> Vec<CapId> {
        self.kernel
            .lock()
            .utcb(thread)
            .map(|utcb| utcb.msg.caps.to_vec())
            .unwrap_or_default()
    }
}
