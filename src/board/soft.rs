//! In-memory board
//!
//! Software models of the interrupt controller, the per-CPU timers and the
//! translation-table backend. Each model is a cheap cloneable handle on
//! shared state, so the host keeps a clone to raise interrupts, advance
//! time or inspect mappings while the kernel owns the other one.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::{MapFlags, Mmu, MmuError, Pic, Timer};
use crate::types::{CpuId, IrqLine, Word, MAX_CPUS};

/// Line used for inter-processor interrupts
pub const IPI_LINE: IrqLine = 1;

/// Timer line of CPU 0, CPU n uses `TIMER_LINE_BASE + n`
pub const TIMER_LINE_BASE: IrqLine = 64;

/// Translation granule of the software MMU
pub const PAGE_SIZE: Word = 4096;

// ============================================================================
// Interrupt Controller
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct LineState {
    masked: bool,
    cpu: CpuId,
    /// Raised while masked, delivered on unmask
    latched: bool,
}

impl Default for LineState {
    fn default() -> Self {
        Self {
            masked: true,
            cpu: CpuId::PRIMARY,
            latched: false,
        }
    }
}

#[derive(Debug)]
struct PicState {
    lines: BTreeMap<IrqLine, LineState>,
    pending: Vec<VecDeque<IrqLine>>,
    ipi: Vec<bool>,
    ipis_sent: u64,
}

/// Software interrupt controller
#[derive(Debug, Clone)]
pub struct SoftPic {
    state: Arc<Mutex<PicState>>,
}

impl SoftPic {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PicState {
                lines: BTreeMap::new(),
                pending: vec![VecDeque::new(); MAX_CPUS],
                ipi: vec![false; MAX_CPUS],
                ipis_sent: 0,
            })),
        }
    }

    /// Assert `line`; masked lines latch until unmasked
    pub fn raise(&self, line: IrqLine) {
        let mut state = self.state.lock();
        let entry = *state.lines.entry(line).or_default();
        if entry.masked {
            if let Some(line_state) = state.lines.get_mut(&line) {
                line_state.latched = true;
            }
            return;
        }
        let queue = &mut state.pending[entry.cpu.0];
        if !queue.contains(&line) {
            queue.push_back(line);
        }
    }

    /// Is `line` masked (unknown lines are masked)
    pub fn is_masked(&self, line: IrqLine) -> bool {
        self.state
            .lock()
            .lines
            .get(&line)
            .map_or(true, |l| l.masked)
    }

    /// CPU `line` is routed to
    pub fn target(&self, line: IrqLine) -> Option<CpuId> {
        self.state.lock().lines.get(&line).map(|l| l.cpu)
    }

    /// Is an IPI or a request pending for `cpu`
    pub fn has_pending(&self, cpu: CpuId) -> bool {
        let state = self.state.lock();
        state.ipi[cpu.0] || !state.pending[cpu.0].is_empty()
    }

    /// Is an IPI pending for `cpu`
    pub fn ipi_pending(&self, cpu: CpuId) -> bool {
        self.state.lock().ipi[cpu.0]
    }

    /// Total number of IPIs sent so far
    pub fn ipis_sent(&self) -> u64 {
        self.state.lock().ipis_sent
    }
}

impl Default for SoftPic {
    fn default() -> Self {
        Self::new()
    }
}

impl Pic for SoftPic {
    fn mask(&mut self, line: IrqLine) {
        let mut state = self.state.lock();
        state.lines.entry(line).or_default().masked = true;
        for queue in state.pending.iter_mut() {
            queue.retain(|&l| l != line);
        }
    }

    fn unmask(&mut self, line: IrqLine, cpu: CpuId) {
        let mut state = self.state.lock();
        let entry = state.lines.entry(line).or_default();
        entry.masked = false;
        entry.cpu = cpu;
        let deliver = core::mem::replace(&mut entry.latched, false);
        if deliver && !state.pending[cpu.0].contains(&line) {
            state.pending[cpu.0].push_back(line);
        }
    }

    fn take_request(&mut self, cpu: CpuId) -> Option<IrqLine> {
        let mut state = self.state.lock();
        if core::mem::replace(&mut state.ipi[cpu.0], false) {
            return Some(IPI_LINE);
        }
        state.pending[cpu.0].pop_front()
    }

    fn send_ipi(&mut self, cpu: CpuId) {
        let mut state = self.state.lock();
        state.ipi[cpu.0] = true;
        state.ipis_sent += 1;
    }

    fn ipi_line(&self) -> IrqLine {
        IPI_LINE
    }
}

// ============================================================================
// Timer
// ============================================================================

#[derive(Debug)]
struct TimerState {
    now_us: Vec<u64>,
    tick_us: Vec<u64>,
}

/// Longest interval the software timer can be programmed for
pub const SOFT_TIMER_MAX_US: u64 = u32::MAX as u64;

/// Software per-CPU timer, time only moves when advanced
#[derive(Debug, Clone)]
pub struct SoftTimer {
    state: Arc<Mutex<TimerState>>,
}

impl SoftTimer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState {
                now_us: vec![0; MAX_CPUS],
                tick_us: vec![0; MAX_CPUS],
            })),
        }
    }

    /// Advance the clock of every CPU
    pub fn advance(&self, us: u64) {
        for now in self.state.lock().now_us.iter_mut() {
            *now += us;
        }
    }

    /// Advance the clock of one CPU
    pub fn advance_cpu(&self, cpu: CpuId, us: u64) {
        self.state.lock().now_us[cpu.0] += us;
    }

    /// Tick length programmed for `cpu`
    pub fn tick_us(&self, cpu: CpuId) -> u64 {
        self.state.lock().tick_us[cpu.0]
    }
}

impl Default for SoftTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for SoftTimer {
    fn now_us(&self, cpu: CpuId) -> u64 {
        self.state.lock().now_us[cpu.0]
    }

    fn irq_line(&self, cpu: CpuId) -> IrqLine {
        TIMER_LINE_BASE + cpu.0 as IrqLine
    }

    fn configure(&mut self, cpu: CpuId, tick_us: u64) {
        self.state.lock().tick_us[cpu.0] = tick_us;
    }

    fn max_timeout_us(&self) -> u64 {
        SOFT_TIMER_MAX_US
    }
}

// ============================================================================
// Translation Tables
// ============================================================================

/// One installed mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub paddr: Word,
    pub size: Word,
    pub flags: MapFlags,
}

#[derive(Debug, Default)]
struct MmuState {
    /// Mappings keyed by (table root, virtual start)
    mappings: BTreeMap<(Word, Word), Mapping>,
    invalidations: Vec<(CpuId, u32)>,
}

/// Software translation-table backend
#[derive(Debug, Clone, Default)]
pub struct SoftMmu {
    state: Arc<Mutex<MmuState>>,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate `vaddr` in the table rooted at `root`
    pub fn translate(&self, root: Word, vaddr: Word) -> Option<Word> {
        let state = self.state.lock();
        state
            .mappings
            .range((root, 0)..=(root, vaddr))
            .next_back()
            .and_then(|(&(_, start), m)| {
                if vaddr < start + m.size {
                    Some(m.paddr + (vaddr - start))
                } else {
                    None
                }
            })
    }

    /// Number of mappings in the table rooted at `root`
    pub fn mapping_count(&self, root: Word) -> usize {
        let state = self.state.lock();
        state
            .mappings
            .range((root, 0)..=(root, Word::MAX))
            .count()
    }

    /// All TLB invalidations performed so far, in order
    pub fn invalidations(&self) -> Vec<(CpuId, u32)> {
        self.state.lock().invalidations.clone()
    }
}

impl Mmu for SoftMmu {
    fn insert(
        &mut self,
        root: Word,
        vaddr: Word,
        paddr: Word,
        size: Word,
        flags: MapFlags,
    ) -> Result<(), MmuError> {
        if size == 0 || vaddr % PAGE_SIZE != 0 || paddr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0
        {
            return Err(MmuError::Misaligned);
        }
        let end = vaddr.checked_add(size).ok_or(MmuError::Misaligned)?;
        let mut state = self.state.lock();
        let overlaps = state
            .mappings
            .range((root, 0)..(root, end))
            .any(|(&(_, start), m)| start + m.size > vaddr);
        if overlaps {
            return Err(MmuError::Overlap);
        }
        state
            .mappings
            .insert((root, vaddr), Mapping { paddr, size, flags });
        Ok(())
    }

    fn remove(&mut self, root: Word, vaddr: Word, size: Word) {
        let end = vaddr.saturating_add(size);
        let mut state = self.state.lock();
        state
            .mappings
            .retain(|&(r, start), m| r != root || start >= end || start + m.size <= vaddr);
    }

    fn invalidate(&mut self, cpu: CpuId, asid: u32) {
        self.state.lock().invalidations.push((cpu, asid));
    }
}
