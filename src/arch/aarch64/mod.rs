//! ARM64 register mapping
//!
//! Based on the ARMv8 exception model: a lower-EL exception saves X0-X30,
//! SP_EL0, ELR_EL1 and SPSR_EL1 into a frame, and the syndrome (ESR_EL1)
//! plus fault address (FAR_EL1) describe the cause.
//!
//! Call arguments travel in X0-X5, X0 carries the call id on entry and
//! the primary return value on exit.

use super::{UserContext, GENERAL_REGS};
use crate::trap::{FaultKind, Trap};
use crate::types::Word;

// ============================================================================
// Exception Frame
// ============================================================================

/// Exception level and stack selection bits of SPSR_EL1 (zero is EL0t)
pub const SPSR_MODE_MASK: u64 = 0xF;

const _: () = assert!(GENERAL_REGS == 31);

/// Saved user registers of one lower-EL exception
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct ExceptionFrame {
    /// General purpose registers X0-X30
    pub x: [u64; 31],
    /// Stack pointer for EL0
    pub sp_el0: u64,
    /// Exception return address
    pub elr_el1: u64,
    /// Saved program status
    pub spsr_el1: u64,
}

impl ExceptionFrame {
    /// Copy the frame into a thread context
    pub fn save(&self, ctx: &mut UserContext) {
        ctx.ip = self.elr_el1 as Word;
        ctx.sp = self.sp_el0 as Word;
        ctx.pstate = self.spsr_el1 as Word;
        for (reg, x) in ctx.regs.iter_mut().zip(self.x.iter()) {
            *reg = *x as Word;
        }
    }

    /// Write a thread context back before returning to EL0
    pub fn restore(&mut self, ctx: &UserContext) {
        self.elr_el1 = ctx.ip as u64;
        self.sp_el0 = ctx.sp as u64;
        // only EL0 may be entered from a thread context
        self.spsr_el1 = (ctx.pstate as u64) & !SPSR_MODE_MASK;
        for (x, reg) in self.x.iter_mut().zip(ctx.regs.iter()) {
            *x = *reg as u64;
        }
    }
}

// ============================================================================
// Exception Syndrome
// ============================================================================

/// Exception classes (ESR_EL1.EC) the kernel distinguishes
pub mod ec {
    pub const UNKNOWN: u8 = 0x00;
    pub const ILLEGAL_EXECUTION: u8 = 0x0E;
    pub const SVC_AARCH64: u8 = 0x15;
    pub const INSTRUCTION_ABORT_LOWER: u8 = 0x20;
    pub const PC_ALIGNMENT: u8 = 0x22;
    pub const DATA_ABORT_LOWER: u8 = 0x24;
    pub const SP_ALIGNMENT: u8 = 0x26;
}

/// Extract the exception class from ESR_EL1
pub fn exception_class(esr: u64) -> u8 {
    ((esr >> 26) & 0x3F) as u8
}

/// Write-not-read bit of a data abort syndrome
fn data_abort_is_write(esr: u64) -> bool {
    esr & (1 << 6) != 0
}

/// Decode a synchronous exception into a kernel trap
pub fn classify_sync(esr: u64, far: u64) -> Trap {
    let addr = far as Word;
    match exception_class(esr) {
        ec::SVC_AARCH64 => Trap::Syscall,
        ec::DATA_ABORT_LOWER => Trap::Fault {
            kind: FaultKind::PageFault,
            addr,
            write: data_abort_is_write(esr),
        },
        ec::INSTRUCTION_ABORT_LOWER => Trap::Fault {
            kind: FaultKind::InstructionFault,
            addr,
            write: false,
        },
        ec::PC_ALIGNMENT | ec::SP_ALIGNMENT => Trap::Fault {
            kind: FaultKind::Alignment,
            addr,
            write: false,
        },
        _ => Trap::Fault {
            kind: FaultKind::Undefined,
            addr,
            write: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::CpuContext;

    fn esr(class: u8, iss: u64) -> u64 {
        ((class as u64) << 26) | iss
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify_sync(esr(ec::SVC_AARCH64, 0), 0), Trap::Syscall);
        assert_eq!(
            classify_sync(esr(ec::DATA_ABORT_LOWER, 1 << 6), 0x4000),
            Trap::Fault {
                kind: FaultKind::PageFault,
                addr: 0x4000,
                write: true
            }
        );
        assert_eq!(
            classify_sync(esr(ec::ILLEGAL_EXECUTION, 0), 0),
            Trap::Fault {
                kind: FaultKind::Undefined,
                addr: 0,
                write: false
            }
        );
    }

    #[test]
    fn test_save_restore() {
        let mut frame = ExceptionFrame::default();
        frame.x[0] = 7;
        frame.x[5] = 11;
        frame.x[6] = 99;
        frame.x[30] = 0x3000;
        frame.elr_el1 = 0x1000;
        frame.sp_el0 = 0x2000;
        frame.spsr_el1 = 0x6000_0000;

        let mut ctx = UserContext::default();
        frame.save(&mut ctx);
        assert_eq!(ctx.call_id(), 7);
        assert_eq!(ctx.arg(5), 11);
        assert_eq!(ctx.regs[6], 99);
        assert_eq!(ctx.regs[30], 0x3000);
        assert_eq!(ctx.pstate, 0x6000_0000);

        ctx.set_ret(0);
        ctx.ip = 0x1004;
        frame.restore(&ctx);
        assert_eq!(frame.x[0], 0);
        assert_eq!(frame.x[6], 99);
        assert_eq!(frame.elr_el1, 0x1004);
        assert_eq!(frame.spsr_el1, 0x6000_0000);
    }

    #[test]
    fn test_switch_does_not_carry_registers() {
        let mut frame = ExceptionFrame::default();
        frame.x[10] = 0xAAAA;
        frame.x[19] = 0xBBBB;
        frame.spsr_el1 = 0x2000_0000;
        frame.elr_el1 = 0x1000;
        let mut a = UserContext::default();
        frame.save(&mut a);

        let b = UserContext::new(0x5000, 0x6000);
        frame.restore(&b);
        assert_eq!((frame.x[10], frame.x[19]), (0, 0));
        assert!(frame.x.iter().all(|&x| x == 0));
        assert_eq!(frame.spsr_el1, 0);
        assert_eq!(frame.elr_el1, 0x5000);

        frame.restore(&a);
        assert_eq!((frame.x[10], frame.x[19]), (0xAAAA, 0xBBBB));
        assert_eq!(frame.spsr_el1, 0x2000_0000);
    }

    #[test]
    fn test_restore_forces_el0() {
        let mut frame = ExceptionFrame::default();
        let mut ctx = UserContext::new(0x1000, 0x2000);
        ctx.pstate = 0x3C5;
        frame.restore(&ctx);
        assert_eq!(frame.spsr_el1 & SPSR_MODE_MASK, 0);
        assert_eq!(frame.spsr_el1, 0x3C0);
    }
}
