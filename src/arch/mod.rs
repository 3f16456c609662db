//! Architecture-neutral register state
//!
//! The scheduler, IPC and signal code never look at a register layout.
//! They see a thread's registers only through [`CpuContext`]: instruction
//! pointer, stack pointer and the call-argument words. Each architecture
//! converts its saved exception frame into a [`UserContext`] at kernel
//! entry and back before returning to user mode. The block carries every
//! general register and the processor state, so a restore fully replaces
//! whatever the previous thread left in the frame.

pub mod aarch64;

use crate::types::Word;

/// Number of call-argument words (argument 0 carries the call id and
/// receives the primary return value)
pub const CALL_ARGS: usize = 6;

/// Number of general purpose registers kept per thread
pub const GENERAL_REGS: usize = 31;

/// Save/restore and argument access of a user register set
pub trait CpuContext {
    /// Instruction pointer
    fn ip(&self) -> Word;

    /// Set the instruction pointer
    fn set_ip(&mut self, ip: Word);

    /// Stack pointer
    fn sp(&self) -> Word;

    /// Set the stack pointer
    fn set_sp(&mut self, sp: Word);

    /// Read call argument `index`, zero if out of range
    fn arg(&self, index: usize) -> Word;

    /// Write call argument `index`, ignored if out of range
    fn set_arg(&mut self, index: usize, value: Word);

    /// Call id of a pending system call
    fn call_id(&self) -> Word {
        self.arg(0)
    }

    /// Install the primary return value
    fn set_ret(&mut self, value: Word) {
        self.set_arg(0, value);
    }

    /// Primary return value
    fn ret(&self) -> Word {
        self.arg(0)
    }
}

/// Portable user register block of a thread
///
/// The call arguments are the first [`CALL_ARGS`] general registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserContext {
    pub ip: Word,
    pub sp: Word,
    /// Saved processor state (flags and execution mode)
    pub pstate: Word,
    pub regs: [Word; GENERAL_REGS],
}

impl UserContext {
    pub const fn new(ip: Word, sp: Word) -> Self {
        Self {
            ip,
            sp,
            pstate: 0,
            regs: [0; GENERAL_REGS],
        }
    }

    /// Load a complete system call (id and arguments)
    pub fn load_call(&mut self, args: &[Word]) {
        self.regs[..CALL_ARGS].fill(0);
        let count = args.len().min(CALL_ARGS);
        self.regs[..count].copy_from_slice(&args[..count]);
    }
}

impl CpuContext for UserContext {
    fn ip(&self) -> Word {
        self.ip
    }

    fn set_ip(&mut self, ip: Word) {
        self.ip = ip;
    }

    fn sp(&self) -> Word {
        self.sp
    }

    fn set_sp(&mut self, sp: Word) {
        self.sp = sp;
    }

    fn arg(&self, index: usize) -> Word {
        if index < CALL_ARGS {
            self.regs[index]
        } else {
            0
        }
    }

    fn set_arg(&mut self, index: usize, value: Word) {
        if index < CALL_ARGS {
            self.regs[index] = value;
        }
    }
}
