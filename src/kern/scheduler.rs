//! Per-CPU Scheduler
//!
//! Priority run queue of one CPU. A higher priority value wins and every
//! CPU owns one independent instance.
//!
//! ## Ready Structure
//!
//! Each of the 128 levels holds an intrusive FIFO of job ids. The links
//! live in a vector indexed by object id, so insertion and removal are
//! O(1). A 128-bit bitmap tracks non-empty levels, the highest ready
//! level is found with a leading-zero count.
//!
//! ## Time Slices
//!
//! The selected job keeps the CPU until its slice is consumed, it blocks,
//! it yields, or a job of strictly higher priority becomes ready. The
//! slice is the job's own quota, or the CPU-wide quantum for jobs without
//! one. An expired or yielding job rotates to the tail of its level, so
//! equal priorities are served round-robin. No ready job means the CPU
//! idles.

use alloc::vec::Vec;

use crate::types::{ObjectId, Priority};

// ============================================================================
// Constants
// ============================================================================

/// Number of priority levels
pub const NRQS: usize = Priority::LEVELS;

/// Number of priority levels per bitmap word
pub const BITMAP_BITS: usize = 64;

// ============================================================================
// Links
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<ObjectId>,
    next: Option<ObjectId>,
    prio: Priority,
    queued: bool,
    /// Slice length, zero for the default quantum
    quota_us: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Level {
    head: Option<ObjectId>,
    tail: Option<ObjectId>,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Priority/time-slice scheduler of one CPU
#[derive(Debug)]
pub struct Scheduler {
    levels: [Level; NRQS],
    /// Bit n of word n / 64 is set if level n is non-empty
    bitmap: [u64; NRQS / BITMAP_BITS],
    links: Vec<Link>,
    count: usize,
    quantum_us: u64,
    remaining_us: u64,
    current: Option<ObjectId>,
}

impl Scheduler {
    /// Create an empty scheduler with the given time-slice length
    pub fn new(quantum_us: u64) -> Self {
        Self {
            levels: [Level::default(); NRQS],
            bitmap: [0; NRQS / BITMAP_BITS],
            links: Vec::new(),
            count: 0,
            quantum_us,
            remaining_us: quantum_us,
            current: None,
        }
    }

    fn link(&mut self, id: ObjectId) -> &mut Link {
        if self.links.len() <= id.index() {
            self.links.resize(id.index() + 1, Link::default());
        }
        &mut self.links[id.index()]
    }

    fn peek_link(&self, id: ObjectId) -> Option<&Link> {
        self.links.get(id.index())
    }

    fn set_bit(&mut self, level: usize) {
        self.bitmap[level / BITMAP_BITS] |= 1 << (level % BITMAP_BITS);
    }

    fn clear_bit(&mut self, level: usize) {
        self.bitmap[level / BITMAP_BITS] &= !(1 << (level % BITMAP_BITS));
    }

    /// Highest non-empty level
    fn highest_level(&self) -> Option<usize> {
        for word in (0..self.bitmap.len()).rev() {
            let bits = self.bitmap[word];
            if bits != 0 {
                let bit = BITMAP_BITS - 1 - bits.leading_zeros() as usize;
                return Some(word * BITMAP_BITS + bit);
            }
        }
        None
    }

    fn push_tail(&mut self, id: ObjectId, prio: Priority) {
        let level = prio.level();
        let tail = self.levels[level].tail;
        {
            let link = self.link(id);
            assert!(!link.queued, "scheduler: job {} queued twice", id);
            *link = Link {
                prev: tail,
                next: None,
                prio,
                queued: true,
                quota_us: link.quota_us,
            };
        }
        match tail {
            Some(tail) => self.link(tail).next = Some(id),
            None => self.levels[level].head = Some(id),
        }
        self.levels[level].tail = Some(id);
        self.set_bit(level);
        self.count += 1;
    }

    fn detach(&mut self, id: ObjectId) -> bool {
        let link = match self.peek_link(id) {
            Some(link) if link.queued => *link,
            _ => return false,
        };
        let level = link.prio.level();
        match link.prev {
            Some(prev) => self.link(prev).next = link.next,
            None => self.levels[level].head = link.next,
        }
        match link.next {
            Some(next) => self.link(next).prev = link.prev,
            None => self.levels[level].tail = link.prev,
        }
        let entry = self.link(id);
        entry.queued = false;
        entry.prev = None;
        entry.next = None;
        if self.levels[level].head.is_none() {
            self.clear_bit(level);
        }
        self.count -= 1;
        true
    }

    /// Insert a job at the tail of its priority level
    pub fn ready(&mut self, id: ObjectId, prio: Priority) {
        if self.is_ready(id) {
            return;
        }
        self.push_tail(id, prio);
    }

    /// Remove a job from the ready structure
    pub fn unready(&mut self, id: ObjectId) {
        self.detach(id);
        if self.current == Some(id) {
            self.current = None;
        }
    }

    /// Is the job in the ready structure
    pub fn is_ready(&self, id: ObjectId) -> bool {
        self.peek_link(id).map_or(false, |link| link.queued)
    }

    /// Set the slice length of a job, zero selects the default quantum
    ///
    /// Applies to the running slice too if it would end earlier.
    pub fn set_quota(&mut self, id: ObjectId, quota_us: u64) {
        self.link(id).quota_us = quota_us;
        if self.current == Some(id) {
            self.remaining_us = self.remaining_us.min(self.slice_us(id));
        }
    }

    /// Slice length a job runs for once selected
    pub fn slice_us(&self, id: ObjectId) -> u64 {
        match self.peek_link(id).map_or(0, |link| link.quota_us) {
            0 => self.quantum_us,
            quota => quota,
        }
    }

    /// Priority a ready job is queued at
    pub fn priority_of(&self, id: ObjectId) -> Option<Priority> {
        self.peek_link(id)
            .filter(|link| link.queued)
            .map(|link| link.prio)
    }

    /// Move a ready job to another priority level
    pub fn reprioritize(&mut self, id: ObjectId, prio: Priority) {
        if self.priority_of(id).map_or(true, |p| p == prio) {
            return;
        }
        self.detach(id);
        self.push_tail(id, prio);
    }

    /// Select the job to run next, `None` means idle
    pub fn schedule(&mut self) -> Option<ObjectId> {
        let top = match self.highest_level() {
            Some(level) => level,
            None => {
                self.current = None;
                return None;
            }
        };
        if let Some(current) = self.current {
            if let Some(prio) = self.priority_of(current) {
                if prio.level() >= top && self.remaining_us > 0 {
                    return Some(current);
                }
            }
        }
        let next = self.levels[top].head;
        if next != self.current {
            self.remaining_us = next.map_or(self.quantum_us, |id| self.slice_us(id));
        }
        self.current = next;
        next
    }

    /// Account consumed time to the current job, rotating it on expiry
    pub fn update(&mut self, consumed_us: u64) {
        let current = match self.current {
            Some(current) => current,
            None => return,
        };
        self.remaining_us = self.remaining_us.saturating_sub(consumed_us);
        if self.remaining_us == 0 {
            self.rotate(current);
        }
    }

    /// The current job gives up the rest of its time slice
    pub fn yield_current(&mut self) {
        if let Some(current) = self.current {
            self.rotate(current);
        }
    }

    fn rotate(&mut self, id: ObjectId) {
        if let Some(prio) = self.priority_of(id) {
            self.detach(id);
            self.push_tail(id, prio);
        }
        self.current = None;
        self.remaining_us = self.quantum_us;
    }

    /// Would a job of `prio` preempt whatever runs now
    pub fn would_preempt(&self, prio: Priority) -> bool {
        match self.current.and_then(|c| self.priority_of(c)) {
            Some(current) => prio > current,
            None => true,
        }
    }

    /// Job selected by the last `schedule`
    pub fn current(&self) -> Option<ObjectId> {
        self.current
    }

    /// Remaining time of the current slice
    pub fn remaining_us(&self) -> u64 {
        self.remaining_us
    }

    /// Number of ready jobs
    pub fn ready_count(&self) -> usize {
        self.count
    }

    /// Ready jobs of one level in queue order
    pub fn level_jobs(&self, prio: Priority) -> Vec<ObjectId> {
        let mut jobs = Vec::new();
        let mut cursor = self.levels[prio.level()].head;
        while let Some(id) = cursor {
            jobs.push(id);
            cursor = self.peek_link(id).and_then(|link| link.next);
        }
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> ObjectId {
        ObjectId(n)
    }

    #[test]
    fn test_empty_is_idle() {
        let mut sched = Scheduler::new(100);
        assert_eq!(sched.schedule(), None);
        assert_eq!(sched.ready_count(), 0);
    }

    #[test]
    fn test_higher_priority_wins() {
        let mut sched = Scheduler::new(100);
        sched.ready(id(1), Priority::new(5));
        sched.ready(id(2), Priority::new(90));
        sched.ready(id(3), Priority::new(64));
        assert_eq!(sched.schedule(), Some(id(2)));
        sched.update(30);
        assert_eq!(sched.schedule(), Some(id(2)));
        sched.unready(id(2));
        assert_eq!(sched.schedule(), Some(id(3)));
        sched.unready(id(3));
        assert_eq!(sched.schedule(), Some(id(1)));
    }

    #[test]
    fn test_round_robin_on_expiry() {
        let mut sched = Scheduler::new(100);
        for n in 1..=3 {
            sched.ready(id(n), Priority::new(10));
        }
        assert_eq!(sched.schedule(), Some(id(1)));
        sched.update(60);
        assert_eq!(sched.schedule(), Some(id(1)));
        sched.update(40);
        assert_eq!(sched.schedule(), Some(id(2)));
        sched.yield_current();
        assert_eq!(sched.schedule(), Some(id(3)));
        assert_eq!(
            sched.level_jobs(Priority::new(10)),
            alloc::vec![id(3), id(1), id(2)]
        );
    }

    #[test]
    fn test_preemption_keeps_position() {
        let mut sched = Scheduler::new(100);
        sched.ready(id(1), Priority::new(10));
        sched.ready(id(2), Priority::new(10));
        assert_eq!(sched.schedule(), Some(id(1)));
        assert!(sched.would_preempt(Priority::new(11)));
        assert!(!sched.would_preempt(Priority::new(10)));
        sched.ready(id(7), Priority::new(11));
        assert_eq!(sched.schedule(), Some(id(7)));
        sched.unready(id(7));
        assert_eq!(sched.schedule(), Some(id(1)));
    }

    #[test]
    fn test_ready_is_idempotent() {
        let mut sched = Scheduler::new(100);
        sched.ready(id(4), Priority::new(3));
        sched.ready(id(4), Priority::new(3));
        assert_eq!(sched.ready_count(), 1);
        sched.unready(id(4));
        sched.unready(id(4));
        assert_eq!(sched.ready_count(), 0);
        assert!(!sched.is_ready(id(4)));
    }

    #[test]
    fn test_reprioritize() {
        let mut sched = Scheduler::new(100);
        sched.ready(id(1), Priority::new(10));
        sched.ready(id(2), Priority::new(20));
        assert_eq!(sched.schedule(), Some(id(2)));
        sched.reprioritize(id(1), Priority::new(30));
        assert_eq!(sched.priority_of(id(1)), Some(Priority::new(30)));
        assert_eq!(sched.schedule(), Some(id(1)));
        assert!(sched.level_jobs(Priority::new(10)).is_empty());
    }

    #[test]
    fn test_quota_shortens_slice() {
        let mut sched = Scheduler::new(100);
        sched.set_quota(id(1), 30);
        sched.ready(id(1), Priority::new(10));
        sched.ready(id(2), Priority::new(10));
        assert_eq!(sched.schedule(), Some(id(1)));
        assert_eq!(sched.remaining_us(), 30);
        sched.update(30);
        assert_eq!(sched.schedule(), Some(id(2)));
        assert_eq!(sched.remaining_us(), 100);
        sched.update(30);
        assert_eq!(sched.schedule(), Some(id(2)));
        sched.update(70);
        assert_eq!(sched.schedule(), Some(id(1)));
        assert_eq!(sched.slice_us(id(1)), 30);
    }

    #[test]
    fn test_quota_survives_requeue() {
        let mut sched = Scheduler::new(100);
        sched.set_quota(id(3), 40);
        sched.ready(id(3), Priority::new(1));
        sched.unready(id(3));
        sched.ready(id(3), Priority::new(1));
        assert_eq!(sched.schedule(), Some(id(3)));
        assert_eq!(sched.remaining_us(), 40);

        sched.set_quota(id(3), 10);
        assert_eq!(sched.remaining_us(), 10);
        sched.set_quota(id(3), 0);
        assert_eq!(sched.slice_us(id(3)), 100);
    }

    #[test]
    fn test_bitmap_spans_words() {
        let mut sched = Scheduler::new(100);
        sched.ready(id(1), Priority::new(0));
        sched.ready(id(2), Priority::MAX);
        sched.ready(id(3), Priority::new(63));
        sched.ready(id(4), Priority::new(64));
        assert_eq!(sched.schedule(), Some(id(2)));
        sched.unready(id(2));
        assert_eq!(sched.schedule(), Some(id(4)));
        sched.unready(id(4));
        assert_eq!(sched.schedule(), Some(id(3)));
        sched.unready(id(3));
        assert_eq!(sched.schedule(), Some(id(1)));
    }
}
