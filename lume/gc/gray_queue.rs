//! Gray queue for tri-color marking
//!
//! Vec-based list of gray objects waiting to be scanned. The collector keeps three of them: the
//! gray list proper, the gray-again list of objects that must be rescanned atomically, and the
//! list of weak tables whose entries are cleared at the end of marking.

use core::mem;

use super::pointer::ObjectId;

/// Queue of gray objects to be scanned
pub struct GrayQueue {
    queue: Vec<ObjectId>,
}

impl GrayQueue {
    /// Create a new empty gray queue
    pub const fn new() -> GrayQueue {
        GrayQueue { queue: Vec::new() }
    }

    /// Check if the queue is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get the number of items in the queue
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Push an object onto the queue
    #[inline]
    pub fn push(&mut self, id: ObjectId) {
        self.queue.push(id);
    }

    /// Pop an object from the queue
    #[inline]
    pub fn pop(&mut self) -> Option<ObjectId> {
        self.queue.pop()
    }

    /// Move every item out of this queue, leaving it empty
    #[inline]
    pub fn take(&mut self) -> GrayQueue {
        mem::take(self)
    }

    /// Append every item of `other` to this queue
    #[inline]
    pub fn append(&mut self, other: GrayQueue) {
        self.queue.extend(other.queue);
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.queue.iter().copied()
    }

    /// Clear the queue
    #[inline]
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for GrayQueue {
    fn default() -> Self {
        Self::new()
    }
}
