//! Memory accounting hooks
//!
//! Every change in the number of bytes accounted to a runtime passes through a [`MemoryHook`].
//! The hook may refuse growth, which the runtime reports as an out of memory error after one
//! emergency collection.

/// Hook consulted whenever the runtime's accounted memory changes.
pub trait MemoryHook: Send {
    /// Called before a block of accounted memory changes size from `old_size` to `new_size`.
    /// Returning false refuses the change. Shrinking is always accepted by the runtime even if
    /// the hook returns false.
    fn realloc(&mut self, old_size: usize, new_size: usize) -> bool;
}

/// Accepts every request.
#[derive(Default)]
pub struct SystemAllocator;

impl MemoryHook for SystemAllocator {
    #[inline]
    fn realloc(&mut self, _old_size: usize, _new_size: usize) -> bool {
        true
    }
}

/// Refuses any growth that would take the accounted total past a fixed limit.
pub struct LimitedAllocator {
    limit: usize,
    used: usize,
}

impl LimitedAllocator {
    pub fn new(limit: usize) -> LimitedAllocator {
        LimitedAllocator { limit, used: 0 }
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

impl MemoryHook for LimitedAllocator {
    fn realloc(&mut self, old_size: usize, new_size: usize) -> bool {
        let used = self.used - old_size.min(self.used) + new_size;
        if new_size > old_size && used > self.limit {
            return false;
        }

        self.used = used;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limited_allocator_refuses_growth_past_limit() {
        let mut allocator = LimitedAllocator::new(100);
        assert!(allocator.realloc(0, 60));
        assert!(!allocator.realloc(0, 60));
        assert_eq!(allocator.used(), 60);

        // Shrinking is always accepted
        assert!(allocator.realloc(60, 10));
        assert_eq!(allocator.used(), 10);
        assert!(allocator.realloc(0, 90));
    }
}
