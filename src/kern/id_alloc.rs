//! Id Allocator
//!
//! Hands out the lowest free numeric id of a bounded range. Freed ids go
//! back to the pool and are handed out again before fresh ones.

use alloc::collections::BTreeSet;

/// Lowest-free id allocator over `[base, base + capacity)`
#[derive(Debug, Clone)]
pub struct IdAllocator {
    base: u32,
    capacity: u32,
    /// First id never handed out
    next: u32,
    /// Returned ids below `next`
    free: BTreeSet<u32>,
}

impl IdAllocator {
    pub fn new(base: u32, capacity: usize) -> Self {
        Self {
            base,
            capacity: u32::try_from(capacity).unwrap_or(u32::MAX),
            next: base,
            free: BTreeSet::new(),
        }
    }

    /// Allocate the lowest free id
    pub fn alloc(&mut self) -> Option<u32> {
        if let Some(id) = self.free.pop_first() {
            return Some(id);
        }
        if self.next - self.base >= self.capacity {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(id)
    }

    /// Return an id to the pool
    pub fn free(&mut self, id: u32) {
        assert!(
            id >= self.base && id < self.next && !self.free.contains(&id),
            "id allocator: double free of {}",
            id
        );
        if id + 1 == self.next {
            self.next -= 1;
            while self.next > self.base && self.free.remove(&(self.next - 1)) {
                self.next -= 1;
            }
        } else {
            self.free.insert(id);
        }
    }

    /// Number of ids in use
    pub fn used(&self) -> usize {
        (self.next - self.base) as usize - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_first() {
        let mut ids = IdAllocator::new(1, 8);
        assert_eq!(ids.alloc(), Some(1));
        assert_eq!(ids.alloc(), Some(2));
        assert_eq!(ids.alloc(), Some(3));
        ids.free(2);
        ids.free(1);
        assert_eq!(ids.alloc(), Some(1));
        assert_eq!(ids.alloc(), Some(2));
        assert_eq!(ids.alloc(), Some(4));
        assert_eq!(ids.used(), 4);
    }

    #[test]
    fn test_exhaustion() {
        let mut ids = IdAllocator::new(1, 2);
        assert!(ids.alloc().is_some());
        assert!(ids.alloc().is_some());
        assert_eq!(ids.alloc(), None);
        ids.free(2);
        assert_eq!(ids.alloc(), Some(2));
    }

    #[test]
    fn test_tail_free_shrinks() {
        let mut ids = IdAllocator::new(1, 8);
        for _ in 0..4 {
            ids.alloc();
        }
        ids.free(3);
        ids.free(4);
        assert_eq!(ids.used(), 2);
        assert_eq!(ids.alloc(), Some(3));
    }

    #[test]
    #[should_panic]
    fn test_double_free_panics() {
        let mut ids = IdAllocator::new(1, 8);
        let id = ids.alloc().unwrap();
        ids.free(id);
        ids.free(id);
    }
}
