//! Call frames
//!
//! Frames are stored in a growable array and referred to by index, so growing the array never
//! invalidates a [`FrameId`] held by the interpreter.

use std::mem::size_of;

use crate::common::constants::BASIC_CALL_INFO_SIZE;

/// Expected result count meaning "all results"
pub const MULTIPLE_RESULTS: i32 = -1;

/// Record of one active function call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallInfo {
    /// Stack slot of the function being called
    pub func: usize,
    /// First stack slot of the frame's registers
    pub base: usize,
    /// Upper bound of the stack slots the frame may use
    pub top: usize,
    /// Saved program counter of the frame while it is not running
    pub saved_pc: usize,
    /// Number of results the caller expects, or [`MULTIPLE_RESULTS`]
    pub expected_results: i32,
    /// Number of tail calls collapsed into this frame
    pub tail_calls: u32,
}

/// Stable reference to a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

impl FrameId {
    #[inline]
    pub fn depth(self) -> usize {
        self.0
    }
}

/// Stack of call frames of a coroutine. Never empty: the base frame is always present.
pub struct CallStack {
    frames: Vec<CallInfo>,
    /// Number of frame slots allocated and accounted
    capacity: usize,
}

impl CallStack {
    /// Bytes accounted per frame slot
    pub const FRAME_SIZE: usize = size_of::<CallInfo>();

    pub fn new(base_frame: CallInfo) -> CallStack {
        let mut frames = Vec::with_capacity(BASIC_CALL_INFO_SIZE);
        frames.push(base_frame);
        CallStack { frames, capacity: BASIC_CALL_INFO_SIZE }
    }

    #[inline]
    pub fn current(&self) -> &CallInfo {
        &self.frames[self.frames.len() - 1]
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut CallInfo {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    #[inline]
    pub fn current_id(&self) -> FrameId {
        FrameId(self.frames.len() - 1)
    }

    #[inline]
    pub fn get(&self, id: FrameId) -> Option<&CallInfo> {
        self.frames.get(id.0)
    }

    #[inline]
    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut CallInfo> {
        self.frames.get_mut(id.0)
    }

    /// Number of active frames, including the base frame
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Call depth counting every collapsed tail call
    pub fn logical_depth(&self) -> usize {
        self.frames
            .iter()
            .map(|frame| 1 + frame.tail_calls as usize)
            .sum()
    }

    /// Number of frame slots allocated
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    /// Change the number of allocated frame slots. Never drops active frames.
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        let capacity = capacity.max(self.frames.len());
        if capacity > self.frames.capacity() {
            self.frames.reserve_exact(capacity - self.frames.len());
        } else {
            self.frames.shrink_to(capacity);
        }

        self.capacity = capacity;
    }

    #[inline]
    pub(crate) fn push(&mut self, frame: CallInfo) -> FrameId {
        self.frames.push(frame);
        self.current_id()
    }

    /// Pop the current frame. Panics on the base frame.
    pub(crate) fn pop(&mut self) -> CallInfo {
        assert!(self.frames.len() > 1, "cannot pop the base frame");
        let frame = self.frames.pop();
        frame.unwrap_or_default()
    }

    /// Highest stack slot any active frame may use
    pub(crate) fn max_top(&self) -> usize {
        self.frames.iter().map(|frame| frame.top).max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CallInfo> + '_ {
        self.frames.iter()
    }

    pub fn heap_size(&self) -> usize {
        self.capacity * Self::FRAME_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(base: usize) -> CallInfo {
        CallInfo { func: base - 1, base, top: base + 20, ..CallInfo::default() }
    }

    #[test]
    fn test_frame_ids_survive_growth() {
        let mut stack = CallStack::new(frame(1));
        let first = stack.push(frame(10));

        for i in 0..40 {
            if stack.is_full() {
                let capacity = stack.capacity() * 2;
                stack.set_capacity(capacity);
            }
            stack.push(frame(20 + i));
        }

        assert!(stack.capacity() >= 32);
        assert_eq!(stack.get(first).map(|frame| frame.base), Some(10));
        assert_eq!(stack.current().base, 59);
        assert_eq!(stack.len(), 42);
    }

    #[test]
    fn test_logical_depth_counts_tail_calls() {
        let mut stack = CallStack::new(frame(1));
        stack.push(frame(5));
        stack.current_mut().tail_calls = 3;
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.logical_depth(), 5);
    }

    #[test]
    #[should_panic(expected = "cannot pop the base frame")]
    fn test_pop_base_frame_panics() {
        let mut stack = CallStack::new(frame(1));
        stack.pop();
    }
}
