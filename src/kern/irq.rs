//! Interrupt Delegation
//!
//! The kernel consumes the IPI line and the per-CPU timer lines itself.
//! Every other line can be claimed by one [`Irq`] object that forwards
//! occurrences to a signal context. A line is masked when it fires and
//! stays masked until the driver acknowledges it with `ack_irq`.

use super::kernel::KernelData;
use super::object::{KernelObject, ObjectKind};
use crate::error::{KernResult, KernelError};
use crate::types::{CapId, CpuId, IrqLine, ObjectId, Word};

/// User-level interrupt object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Irq {
    pub line: IrqLine,
    /// Context submitted on each occurrence
    pub ctx: Option<ObjectId>,
    /// CPU the line was last enabled for
    pub cpu: CpuId,
    pub enabled: bool,
}

impl Irq {
    pub fn new(line: IrqLine, ctx: ObjectId) -> Self {
        Self {
            line,
            ctx: Some(ctx),
            cpu: CpuId::PRIMARY,
            enabled: false,
        }
    }
}

impl KernelData {
    /// Is `line` used by the kernel itself
    fn is_kernel_line(&self, line: IrqLine) -> bool {
        line == self.board.pic.ipi_line()
            || (0..self.cpus.len()).any(|cpu| self.board.timer.irq_line(CpuId(cpu)) == line)
    }

    /// Claim `line` for a signal context, the line starts masked
    pub(crate) fn new_irq(&mut self, caller: ObjectId, line: Word, ctx_cap: CapId) -> KernResult<CapId> {
        let line = IrqLine::try_from(line).map_err(|_| KernelError::InvalidArgument)?;
        if self.is_kernel_line(line) {
            log::warn!("{}: irq {} is reserved", self.label_of(caller), line);
            return Err(KernelError::InvalidArgument);
        }
        if self.irq_lines.contains_key(&line) {
            return Err(KernelError::Denied);
        }
        let ctx = self.lookup_kind(caller, ctx_cap, ObjectKind::SignalContext)?;
        let (irq, cap) = self.create(caller, KernelObject::Irq(Irq::new(line, ctx)))?;
        self.board.pic.mask(line);
        self.irq_lines.insert(line, irq);
        Ok(cap)
    }

    /// Unmask the line of `irq` and route it to `cpu`
    pub(crate) fn enable_irq(&mut self, irq: ObjectId, cpu: CpuId) {
        let line = match self.objects.irq_mut(irq) {
            Ok(i) if !(i.enabled && i.cpu == cpu) => {
                i.enabled = true;
                i.cpu = cpu;
                i.line
            }
            _ => return,
        };
        self.board.pic.unmask(line, cpu);
    }

    /// Mask the line of `irq`
    pub(crate) fn disable_irq(&mut self, irq: ObjectId) {
        if let Ok(i) = self.objects.irq_mut(irq) {
            i.enabled = false;
            let line = i.line;
            self.board.pic.mask(line);
        }
    }

    /// Re-enable an interrupt on the caller's CPU after servicing it
    pub(crate) fn ack_irq(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        let irq = self.lookup_kind(caller, cap, ObjectKind::Irq)?;
        let cpu = self.objects.thread(caller)?.cpu;
        self.enable_irq(irq, cpu);
        Ok(())
    }

    pub(crate) fn delete_irq(&mut self, caller: ObjectId, cap: CapId) -> KernResult<()> {
        let irq = self.lookup_kind(caller, cap, ObjectKind::Irq)?;
        self.disable_irq(irq);
        let line = self.objects.irq(irq)?.line;
        self.irq_lines.remove(&line);
        self.retire(irq);
        Ok(())
    }

    /// Take and handle every interrupt pending on `cpu`
    pub(crate) fn handle_interrupts(&mut self, cpu: CpuId) {
        let ipi = self.board.pic.ipi_line();
        let timer = self.board.timer.irq_line(cpu);
        while let Some(line) = self.board.pic.take_request(cpu) {
            if line == ipi {
                self.cpus[cpu.0].ipi_pending = false;
                self.service_invalidations(cpu);
                continue;
            }
            if line == timer {
                // time accounting happened on entry
                continue;
            }
            match self.irq_lines.get(&line).copied() {
                Some(irq) => {
                    self.disable_irq(irq);
                    let ctx = self.objects.irq(irq).ok().and_then(|i| i.ctx);
                    match ctx {
                        Some(ctx) => {
                            if self.submit(ctx, 1).is_err() {
                                log::warn!("{}: irq {} context revoked", cpu, line);
                            }
                        }
                        None => log::debug!("{}: irq {} has no context", cpu, line),
                    }
                }
                None => {
                    log::warn!("{}: spurious irq {}", cpu, line);
                    self.board.pic.mask(line);
                }
            }
        }
    }
}
