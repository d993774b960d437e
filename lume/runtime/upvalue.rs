//! Upvalues
//!
//! An upvalue is open while the variable it captures is still live on a coroutine stack, and
//! reads and writes go to that stack slot. When the slot goes out of scope the upvalue is closed
//! and holds its own copy of the value.
//!
//! Each coroutine keeps its open upvalues ordered by stack slot so that there is at most one
//! open upvalue per slot and all upvalues above a level can be closed at once. The global state
//! also tracks every open upvalue so the collector can remark them atomically.

use std::mem::size_of;

use log::trace;

use crate::gc::{GcColor, GcPhase, GcPtr, GcVisitor};

use super::{
    coroutine::Coroutine,
    error::LuaResult,
    state::{dangling, Lua},
    value::Value,
};

#[derive(Clone, Copy, Debug)]
pub enum UpvalueState {
    Open { thread: GcPtr<Coroutine>, slot: usize },
    Closed(Value),
}

pub struct UpVal {
    state: UpvalueState,
}

impl UpVal {
    pub(crate) fn new_open(thread: GcPtr<Coroutine>, slot: usize) -> UpVal {
        UpVal { state: UpvalueState::Open { thread, slot } }
    }

    pub fn new_closed(value: Value) -> UpVal {
        UpVal { state: UpvalueState::Closed(value) }
    }

    #[inline]
    pub fn state(&self) -> UpvalueState {
        self.state
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalueState::Open { .. })
    }

    #[inline]
    pub(crate) fn close(&mut self, value: Value) {
        self.state = UpvalueState::Closed(value);
    }

    pub fn heap_size(&self) -> usize {
        size_of::<UpVal>()
    }

    /// Visit the closed value. Open upvalues are traced through their coroutine's stack.
    pub fn visit_pointers(&self, visitor: &mut impl GcVisitor) {
        match &self.state {
            UpvalueState::Closed(value) => visitor.visit_value(value),
            UpvalueState::Open { thread, .. } => visitor.visit(*thread),
        }
    }
}

impl Lua {
    /// Find the open upvalue for a stack slot of `thread`, creating it if none exists.
    ///
    /// An upvalue that was found dead but not yet swept is revived and reused.
    pub fn find_upvalue(&mut self, thread: GcPtr<Coroutine>, slot: usize) -> LuaResult<GcPtr<UpVal>> {
        if let Some(upvalue) = self.thread(thread).open_upvalues.get(&slot).copied() {
            if self.g.heap.is_dead(upvalue.id()) {
                self.g.heap.make_white(upvalue.id());
            }
            return Ok(upvalue);
        }

        let upvalue = self.with_pinned_ids([thread.id()], |lua| {
            lua.check_gc();
            lua.alloc(UpVal::new_open(thread, slot))
        })?;

        self.thread_mut(thread).open_upvalues.insert(slot, upvalue);
        self.g.open_upvalues.insert(upvalue.id());

        Ok(upvalue)
    }

    /// Close every open upvalue of `thread` at or above stack slot `level`, copying the current
    /// slot values into the upvalues.
    pub fn close_upvalues(&mut self, thread: GcPtr<Coroutine>, level: usize) {
        let closing = self.thread_mut(thread).open_upvalues.split_off(&level);
        if closing.is_empty() {
            return;
        }

        trace!("closing {} upvalues at level {}", closing.len(), level);

        for (slot, upvalue) in closing {
            let value = self.thread(thread).stack.get(slot).copied().unwrap_or_default();
            self.g.open_upvalues.remove(&upvalue.id());

            if let Some(object) = self.g.heap.get_mut(upvalue) {
                object.close(value);
            }

            self.link_closed_upvalue(upvalue, value);
        }
    }

    /// Fix the color of an upvalue that just closed. Open upvalues stay gray while marking, a
    /// closed one must respect the tri-color invariant like any other object.
    fn link_closed_upvalue(&mut self, upvalue: GcPtr<UpVal>, value: Value) {
        let heap = &mut self.g.heap;
        if heap.color(upvalue.id()) != Some(GcColor::Gray) {
            return;
        }

        if heap.phase() == GcPhase::Propagate {
            if let Some(header) = heap.header_mut(upvalue.id()) {
                header.set_color(GcColor::Black);
            }
            self.g.barrier(upvalue.id(), &value);
        } else {
            heap.make_white(upvalue.id());
        }
    }

    /// Current value of an upvalue
    pub fn upvalue_get(&self, upvalue: GcPtr<UpVal>) -> Value {
        match self.g.heap.get(upvalue).map(UpVal::state) {
            Some(UpvalueState::Open { thread, slot }) => {
                self.thread(thread).stack.get(slot).copied().unwrap_or_default()
            }
            Some(UpvalueState::Closed(value)) => value,
            None => dangling(upvalue.id()),
        }
    }

    pub fn upvalue_set(&mut self, upvalue: GcPtr<UpVal>, value: Value) {
        match self.g.heap.get(upvalue).map(UpVal::state) {
            Some(UpvalueState::Open { thread, slot }) => {
                if let Some(stack_value) = self.thread_mut(thread).stack.get_mut(slot) {
                    *stack_value = value;
                }
            }
            Some(UpvalueState::Closed(_)) => {
                if let Some(object) = self.g.heap.get_mut(upvalue) {
                    object.close(value);
                }
                self.g.barrier(upvalue.id(), &value);
            }
            None => dangling(upvalue.id()),
        }
    }

    /// Number of open upvalues across all coroutines
    pub fn num_open_upvalues(&self) -> usize {
        self.g.open_upvalues.len()
    }
}
