//! Coroutines
//!
//! Each coroutine owns a value stack, a call frame stack and the set of its open upvalues. Stack
//! positions are plain indices, so growing a stack never invalidates anything held by the
//! interpreter. Growth is still reported through the stack listener so cached views can be
//! refreshed.

use std::{collections::BTreeMap, mem::size_of};

use bitflags::bitflags;
use log::{debug, trace};

use crate::{
    common::constants::{BASIC_CALL_INFO_SIZE, BASIC_STACK_SIZE, EXTRA_STACK, MIN_STACK},
    gc::{GcPtr, GcVisitor},
};

use super::{
    call_info::{CallInfo, CallStack, FrameId, MULTIPLE_RESULTS},
    error::{LuaError, LuaResult},
    state::Lua,
    upvalue::UpVal,
    value::Value,
};

/// Status of a coroutine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadStatus {
    #[default]
    Ok,
    Yield,
    ErrRun,
    ErrSyntax,
    ErrMem,
    ErrErr,
}

bitflags! {
    /// Events a debug hook is called for
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HookMask: u8 {
        const CALL = 1 << 0;
        const RETURN = 1 << 1;
        const LINE = 1 << 2;
        const COUNT = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    TailCall,
    Line(u32),
    Count,
}

impl HookEvent {
    fn mask(self) -> HookMask {
        match self {
            HookEvent::Call | HookEvent::TailCall => HookMask::CALL,
            HookEvent::Return => HookMask::RETURN,
            HookEvent::Line(_) => HookMask::LINE,
            HookEvent::Count => HookMask::COUNT,
        }
    }
}

pub type HookFunction = fn(&mut Lua, GcPtr<Coroutine>, HookEvent);

#[derive(Clone, Copy, Debug)]
pub struct HookState {
    pub function: Option<HookFunction>,
    pub mask: HookMask,
    /// Instructions between count events
    pub base_count: u32,
    /// Instructions left until the next count event
    pub count: u32,
    /// Cleared while a hook is running
    pub allow: bool,
}

impl Default for HookState {
    fn default() -> Self {
        HookState { function: None, mask: HookMask::empty(), base_count: 0, count: 0, allow: true }
    }
}

/// Reported to the stack listener whenever a coroutine's value stack changes size
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackReallocation {
    pub thread: GcPtr<Coroutine>,
    pub old_size: usize,
    pub new_size: usize,
}

pub type StackListener = Box<dyn FnMut(StackReallocation) + Send>;

pub struct Coroutine {
    /// Value stack. Its length is the allocated stack size.
    pub(crate) stack: Vec<Value>,
    /// First free slot
    pub(crate) top: usize,
    /// Base of the running frame
    pub(crate) base: usize,
    pub(crate) frames: CallStack,
    /// Program counter of the running frame
    pub(crate) saved_pc: usize,
    pub(crate) status: ThreadStatus,
    /// Table of globals
    pub(crate) globals: Value,
    /// Open upvalues keyed by stack slot
    pub(crate) open_upvalues: BTreeMap<usize, GcPtr<UpVal>>,
    pub(crate) hook: HookState,
    /// Depth of nested native calls
    pub(crate) native_calls: u16,
}

impl Coroutine {
    pub(crate) fn new(globals: Value) -> Coroutine {
        let stack = vec![Value::Nil; BASIC_STACK_SIZE + EXTRA_STACK];

        // Slot 0 holds the function entry of the base frame
        let base_frame = CallInfo {
            func: 0,
            base: 1,
            top: 1 + MIN_STACK,
            saved_pc: 0,
            expected_results: MULTIPLE_RESULTS,
            tail_calls: 0,
        };

        Coroutine {
            stack,
            top: 1,
            base: 1,
            frames: CallStack::new(base_frame),
            saved_pc: 0,
            status: ThreadStatus::Ok,
            globals,
            open_upvalues: BTreeMap::new(),
            hook: HookState::default(),
            native_calls: 0,
        }
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    /// Allocated stack size, including the extra slots
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Last usable stack slot, leaving room for the extra slots
    #[inline]
    pub(crate) fn stack_last(&self) -> usize {
        self.stack.len() - EXTRA_STACK
    }

    #[inline]
    pub fn frames(&self) -> &CallStack {
        &self.frames
    }

    /// Slots of the stack that may hold live values, including slots of open upvalues above the
    /// top
    #[inline]
    pub(crate) fn stack_in_use(&self) -> usize {
        let upvalue_top = self.open_upvalues.keys().next_back().map_or(0, |slot| slot + 1);
        self.top.max(self.frames.max_top()).max(upvalue_top).min(self.stack.len())
    }

    pub fn heap_size(&self) -> usize {
        size_of::<Coroutine>() + self.stack.len() * size_of::<Value>() + self.frames.heap_size()
    }

    pub fn visit_pointers(&self, visitor: &mut impl GcVisitor) {
        visitor.visit_value(&self.globals);
        for value in &self.stack[..self.stack_in_use()] {
            visitor.visit_value(value);
        }
        for upvalue in self.open_upvalues.values() {
            visitor.visit(*upvalue);
        }
    }

    /// Give back stack and frame space that has gone unused. Returns the old and new stack
    /// sizes if the value stack shrank.
    pub(crate) fn shrink(&mut self, max_call_depth: usize) -> Option<(usize, usize)> {
        // Do not touch the stacks while handling an overflow
        if self.frames.capacity() > max_call_depth {
            return None;
        }

        let frames_used = self.frames.len();
        let capacity = self.frames.capacity();
        if 4 * frames_used < capacity && 2 * BASIC_CALL_INFO_SIZE < capacity {
            self.frames.set_capacity(capacity / 2);
        }

        // Clear dead slots so they hold no stale handles
        let stack_used = self.stack_in_use();
        for value in &mut self.stack[stack_used..] {
            *value = Value::Nil;
        }

        let stack_size = self.stack.len();
        if 4 * stack_used < stack_size && 2 * (BASIC_STACK_SIZE + EXTRA_STACK) < stack_size {
            let new_size = stack_size / 2;
            self.stack.truncate(new_size);
            self.stack.shrink_to_fit();
            return Some((stack_size, new_size));
        }

        None
    }
}

impl Lua {
    /// Create a new coroutine sharing the globals and hook settings of `parent`
    pub fn new_thread(&mut self, parent: GcPtr<Coroutine>) -> LuaResult<GcPtr<Coroutine>> {
        let parent_state = self.thread(parent);
        let globals = parent_state.globals;
        let hook = HookState { allow: true, count: parent_state.hook.base_count, ..parent_state.hook };

        self.with_pinned(&[Value::Thread(parent), globals], |lua| {
            lua.check_gc();

            let mut coroutine = Coroutine::new(globals);
            coroutine.hook = hook;
            lua.alloc(coroutine)
        })
    }

    pub fn thread_status(&self, thread: GcPtr<Coroutine>) -> ThreadStatus {
        self.thread(thread).status
    }

    pub fn set_thread_status(&mut self, thread: GcPtr<Coroutine>, status: ThreadStatus) {
        self.thread_mut(thread).status = status;
    }

    pub fn globals(&self, thread: GcPtr<Coroutine>) -> Value {
        self.thread(thread).globals
    }

    pub fn set_globals(&mut self, thread: GcPtr<Coroutine>, globals: Value) {
        self.thread_mut(thread).globals = globals;
        self.g.barrier(thread.id(), &globals);
    }

    // ========================================================================
    // Value stack
    // ========================================================================

    pub fn top(&self, thread: GcPtr<Coroutine>) -> usize {
        self.thread(thread).top
    }

    /// Set the stack top. Slots exposed by raising the top are set to nil.
    pub fn set_top(&mut self, thread: GcPtr<Coroutine>, top: usize) -> LuaResult<()> {
        let current = self.thread(thread).top;
        if top > current {
            self.check_stack(thread, top - current)?;
        }

        let coroutine = self.thread_mut(thread);
        for value in &mut coroutine.stack[current.min(top)..top.max(current)] {
            *value = Value::Nil;
        }
        coroutine.top = top;

        Ok(())
    }

    pub fn push(&mut self, thread: GcPtr<Coroutine>, value: Value) -> LuaResult<()> {
        self.check_stack(thread, 1)?;

        let coroutine = self.thread_mut(thread);
        let top = coroutine.top;
        coroutine.stack[top] = value;
        coroutine.top += 1;

        Ok(())
    }

    /// Pop the top value. Never pops below the base of the running frame.
    pub fn pop(&mut self, thread: GcPtr<Coroutine>) -> Value {
        let coroutine = self.thread_mut(thread);
        if coroutine.top <= coroutine.base {
            return Value::Nil;
        }

        coroutine.top -= 1;
        let top = coroutine.top;
        std::mem::take(&mut coroutine.stack[top])
    }

    pub fn stack_get(&self, thread: GcPtr<Coroutine>, slot: usize) -> Value {
        self.thread(thread).stack.get(slot).copied().unwrap_or_default()
    }

    /// Write a stack slot. Slots at or above the top are dead and must be exposed with
    /// [`Lua::set_top`] first.
    pub fn stack_set(&mut self, thread: GcPtr<Coroutine>, slot: usize, value: Value) {
        let coroutine = self.thread_mut(thread);
        assert!(slot < coroutine.top, "stack slot {slot} is above the top");
        coroutine.stack[slot] = value;
    }

    pub fn stack_size(&self, thread: GcPtr<Coroutine>) -> usize {
        self.thread(thread).stack.len()
    }

    /// Make sure at least `n` more values can be pushed
    pub fn check_stack(&mut self, thread: GcPtr<Coroutine>, n: usize) -> LuaResult<()> {
        let coroutine = self.thread(thread);
        let needed = coroutine.top.checked_add(n).ok_or(LuaError::StackOverflow)?;
        if coroutine.stack_last() > needed {
            return Ok(());
        }

        let size = coroutine.stack.len();
        if n <= size {
            self.realloc_stack(thread, 2 * size)
        } else {
            self.realloc_stack(thread, size.checked_add(n).ok_or(LuaError::StackOverflow)?)
        }
    }

    fn realloc_stack(&mut self, thread: GcPtr<Coroutine>, new_size: usize) -> LuaResult<()> {
        let real_size = match new_size.checked_add(1 + EXTRA_STACK) {
            Some(real_size) if real_size <= self.g.options.max_stack_size => real_size,
            _ => return Err(LuaError::StackOverflow),
        };

        let old_size = self.thread(thread).stack.len();
        let object_size = self.thread(thread).heap_size() + (real_size - old_size) * size_of::<Value>();
        self.resize_object(thread.id(), object_size)?;

        self.thread_mut(thread).stack.resize(real_size, Value::Nil);
        debug!("grew stack of {:?} from {} to {} slots", thread.id(), old_size, real_size);

        self.g.notify_stack_reallocated(StackReallocation { thread, old_size, new_size: real_size });

        Ok(())
    }

    /// Move `n` values from the top of one coroutine's stack to another's
    pub fn xmove(&mut self, from: GcPtr<Coroutine>, to: GcPtr<Coroutine>, n: usize) -> LuaResult<()> {
        if from == to || n == 0 {
            return Ok(());
        }

        self.check_stack(to, n)?;

        let source = self.thread_mut(from);
        assert!(n <= source.top - source.base, "not enough values to move");
        let start = source.top - n;
        let values: Vec<Value> = source.stack[start..source.top].iter_mut().map(std::mem::take).collect();
        source.top = start;

        let target = self.thread_mut(to);
        let top = target.top;
        target.stack[top..top + n].copy_from_slice(&values);
        target.top += n;

        Ok(())
    }

    // ========================================================================
    // Call frames
    // ========================================================================

    /// Push a frame for the function at stack slot `func`, whose arguments are the values above
    /// it. The frame gets `frame_size` register slots starting right after the function.
    pub fn push_frame(
        &mut self,
        thread: GcPtr<Coroutine>,
        func: usize,
        frame_size: usize,
        expected_results: i32,
    ) -> LuaResult<FrameId> {
        let top = self.thread(thread).top;
        assert!(func < top, "function slot {func} is not below the top");

        let base = func + 1;
        self.check_stack(thread, (base + frame_size).saturating_sub(top))?;

        if self.thread(thread).frames.is_full() {
            self.grow_frames(thread)?;
        }

        let coroutine = self.thread_mut(thread);
        let saved_pc = coroutine.saved_pc;
        coroutine.frames.current_mut().saved_pc = saved_pc;

        let id = coroutine.frames.push(CallInfo {
            func,
            base,
            top: base + frame_size,
            saved_pc: 0,
            expected_results,
            tail_calls: 0,
        });
        coroutine.base = base;
        coroutine.saved_pc = 0;

        trace!("push frame {} on {:?}", id.depth(), thread.id());
        self.call_hook(thread, HookEvent::Call);

        Ok(id)
    }

    /// Pop the running frame, moving its last `results` stack values to where its function was.
    ///
    /// Upvalues over the frame's slots are closed, and the caller's base and program counter are
    /// restored. Returns the number of values left for the caller.
    pub fn pop_frame(&mut self, thread: GcPtr<Coroutine>, results: usize) -> LuaResult<usize> {
        self.call_hook(thread, HookEvent::Return);

        let frame = *self.thread(thread).frames.current();
        assert!(self.thread(thread).frames.len() > 1, "cannot pop the base frame");
        self.close_upvalues(thread, frame.base);

        // Negative means all results
        let wanted = usize::try_from(frame.expected_results).unwrap_or(results);

        let top = self.thread(thread).top;
        if frame.func + wanted > top {
            self.check_stack(thread, frame.func + wanted - top)?;
        }

        let coroutine = self.thread_mut(thread);
        coroutine.frames.pop();

        let first_result = coroutine.top - results.min(coroutine.top);
        for i in 0..wanted {
            coroutine.stack[frame.func + i] = if i < results {
                coroutine.stack[first_result + i]
            } else {
                Value::Nil
            };
        }

        let new_top = frame.func + wanted;
        for value in &mut coroutine.stack[new_top..coroutine.top.max(new_top)] {
            *value = Value::Nil;
        }
        coroutine.top = new_top;

        let caller = *coroutine.frames.current();
        coroutine.base = caller.base;
        coroutine.saved_pc = caller.saved_pc;

        Ok(wanted)
    }

    /// Replace the running frame with a call to the function at stack slot `func`, whose
    /// arguments are the values above it.
    pub fn tail_call(
        &mut self,
        thread: GcPtr<Coroutine>,
        func: usize,
        frame_size: usize,
    ) -> LuaResult<FrameId> {
        let frame = *self.thread(thread).frames.current();
        let top = self.thread(thread).top;
        assert!(frame.base <= func && func < top, "tail called function is not in the frame");

        self.close_upvalues(thread, frame.base);

        let moved = top - func;
        let base = frame.func + 1;
        let new_top = frame.func + moved;
        if base + frame_size > new_top {
            self.check_stack(thread, (base + frame_size).saturating_sub(top))?;
        }

        let coroutine = self.thread_mut(thread);
        coroutine.stack.copy_within(func..top, frame.func);
        for value in &mut coroutine.stack[new_top..top] {
            *value = Value::Nil;
        }
        coroutine.top = new_top;
        coroutine.base = base;
        coroutine.saved_pc = 0;

        let current = coroutine.frames.current_mut();
        current.base = base;
        current.top = base + frame_size;
        current.saved_pc = 0;
        current.tail_calls += 1;
        let id = coroutine.frames.current_id();

        self.call_hook(thread, HookEvent::TailCall);

        Ok(id)
    }

    pub fn current_frame(&self, thread: GcPtr<Coroutine>) -> CallInfo {
        *self.thread(thread).frames.current()
    }

    pub fn frame(&self, thread: GcPtr<Coroutine>, id: FrameId) -> Option<CallInfo> {
        self.thread(thread).frames.get(id).copied()
    }

    /// Save the program counter of the running frame
    pub fn set_saved_pc(&mut self, thread: GcPtr<Coroutine>, pc: usize) {
        self.thread_mut(thread).saved_pc = pc;
    }

    pub fn saved_pc(&self, thread: GcPtr<Coroutine>) -> usize {
        self.thread(thread).saved_pc
    }

    fn grow_frames(&mut self, thread: GcPtr<Coroutine>) -> LuaResult<()> {
        let capacity = self.thread(thread).frames.capacity();
        let max_call_depth = self.g.options.max_call_depth;

        // Overflowed again while handling an overflow
        if capacity > max_call_depth {
            return Err(LuaError::ErrorHandlerOverflow);
        }

        let new_capacity = 2 * capacity;
        let object_size = self.thread(thread).heap_size() + capacity * CallStack::FRAME_SIZE;
        self.resize_object(thread.id(), object_size)?;
        self.thread_mut(thread).frames.set_capacity(new_capacity);

        // The grown array leaves room for error handlers to run
        if new_capacity > max_call_depth {
            return Err(LuaError::StackOverflow);
        }

        Ok(())
    }

    // ========================================================================
    // Hooks and native calls
    // ========================================================================

    pub fn set_hook(
        &mut self,
        thread: GcPtr<Coroutine>,
        function: Option<HookFunction>,
        mask: HookMask,
        count: u32,
    ) {
        let hook = &mut self.thread_mut(thread).hook;
        let mask = if function.is_none() { HookMask::empty() } else { mask };

        hook.function = if mask.is_empty() { None } else { function };
        hook.mask = mask;
        hook.base_count = count;
        hook.count = count;
    }

    pub fn hook_mask(&self, thread: GcPtr<Coroutine>) -> HookMask {
        self.thread(thread).hook.mask
    }

    /// Call the hook of `thread` for an event, unless the event is masked out or a hook is
    /// already running.
    pub fn call_hook(&mut self, thread: GcPtr<Coroutine>, event: HookEvent) {
        let hook = self.thread(thread).hook;
        let Some(function) = hook.function else {
            return;
        };

        if !hook.allow || !hook.mask.contains(event.mask()) {
            return;
        }

        self.thread_mut(thread).hook.allow = false;
        function(self, thread, event);
        self.thread_mut(thread).hook.allow = true;
    }

    /// Count one instruction. Fires the count hook when the counter runs out.
    pub fn count_instruction(&mut self, thread: GcPtr<Coroutine>) {
        let hook = &mut self.thread_mut(thread).hook;
        if !hook.mask.contains(HookMask::COUNT) {
            return;
        }

        hook.count = hook.count.saturating_sub(1);
        if hook.count == 0 {
            hook.count = hook.base_count;
            self.call_hook(thread, HookEvent::Count);
        }
    }

    /// Enter a nested native call.
    ///
    /// Past the limit a first error is raised. A further band of calls is allowed for error
    /// handling, after which the overflow is reported as an error in error handling.
    pub fn enter_native_call(&mut self, thread: GcPtr<Coroutine>) -> LuaResult<()> {
        let max = self.g.options.max_native_calls;
        let coroutine = self.thread_mut(thread);
        coroutine.native_calls = coroutine.native_calls.saturating_add(1);

        let calls = coroutine.native_calls;
        if calls == max {
            Err(LuaError::NativeCallOverflow)
        } else if calls >= max.saturating_add(max >> 3) {
            Err(LuaError::ErrorHandlerOverflow)
        } else {
            Ok(())
        }
    }

    pub fn leave_native_call(&mut self, thread: GcPtr<Coroutine>) {
        let coroutine = self.thread_mut(thread);
        coroutine.native_calls = coroutine.native_calls.saturating_sub(1);
    }

    pub fn native_calls(&self, thread: GcPtr<Coroutine>) -> u16 {
        self.thread(thread).native_calls
    }

    /// Restore the native call depth saved at a protected call boundary
    pub fn restore_native_calls(&mut self, thread: GcPtr<Coroutine>, native_calls: u16) {
        self.thread_mut(thread).native_calls = native_calls;
    }
}
