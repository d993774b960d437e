//! Incremental tri-color collector
//!
//! A cycle moves through these phases:
//! - `Pause`: nothing to do. The next step marks the roots and starts propagation.
//! - `Propagate`: gray objects are traversed a few at a time. When the gray list runs dry the
//!   atomic phase finishes marking in one go, clears weak tables and flips the current white.
//! - `SweepStrings`: the string table is swept one bucket per step.
//! - `SweepObjects`: all other objects are swept a bounded number of slots per step.
//! - `Finalize`: finalizers of unreachable userdata run one per step.
//!
//! The mutator runs between steps. Write barriers keep the invariant that no black object refers
//! to a white one while marking is in progress.

use core::mem;

use log::{debug, trace, warn};

use crate::{
    common::constants::{GC_FINALIZE_COST, GC_STEP_SIZE, GC_SWEEP_COST, GC_SWEEP_MAX, MIN_STRING_TABLE_SIZE},
    runtime::{
        error::{LuaError, LuaResult},
        global_state::GlobalState,
        object::HeapObject,
        state::Lua,
        string::LuaString,
        string_table::StringTable,
        upvalue::UpvalueState,
        userdata::Userdata,
        value::Value,
        TagMethod,
    },
};

use super::{
    gc_header::{GcColor, GcFlags, GcHeader, GcPhase, ObjectKind},
    gray_queue::GrayQueue,
    heap::Heap,
    pointer::{GcPtr, ObjectId},
    visitor::GcVisitor,
};

/// Commands accepted by [`Lua::gc`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcCommand {
    /// Stop automatic collection until restarted
    Stop,
    /// Restart automatic collection
    Restart,
    /// Run a full collection cycle
    Collect,
    /// Accounted memory in kilobytes
    Count,
    /// Remainder of accounted memory in bytes after dividing by 1024
    CountBytes,
    /// Perform collector steps as if this many kilobytes had been allocated. Returns 1 if a cycle
    /// finished.
    Step(usize),
    /// Set the pause percentage, returning the previous value
    SetPause(usize),
    /// Set the step multiplier, returning the previous value
    SetStepMultiplier(usize),
}

/// Snapshot of the collector's counters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcStats {
    pub phase: GcPhase,
    pub total_bytes: usize,
    pub threshold: usize,
    pub estimate: usize,
    pub debt: usize,
    pub pause: usize,
    pub step_multiplier: usize,
    pub num_objects: usize,
    pub cycles: u64,
    pub string_table_size: usize,
    pub num_strings: usize,
}

// ============================================================================
// Marking
// ============================================================================

/// Marker - implements GcVisitor for tracing
///
/// Borrows only the headers and the gray list so objects can be read while marking.
pub struct Marker<'a> {
    headers: &'a mut [GcHeader],
    gray: &'a mut GrayQueue,
}

impl Marker<'_> {
    /// Mark a white object. Strings have no children and go straight to black.
    #[inline]
    fn mark(&mut self, id: ObjectId) {
        let Some(header) = self.headers.get_mut(id.index()) else {
            return;
        };

        if header.generation() != id.generation() {
            trace!("ignoring stale handle {:?} while marking", id);
            return;
        }

        if !header.color().is_white() {
            return;
        }

        if header.kind() == ObjectKind::String {
            header.set_color(GcColor::Black);
        } else {
            header.set_color(GcColor::Gray);
            self.gray.push(id);
        }
    }
}

impl GcVisitor for Marker<'_> {
    #[inline]
    fn visit_object(&mut self, id: ObjectId) {
        self.mark(id);
    }
}

/// What to do with an object after traversing it
enum Traversal {
    /// Fully traversed
    Black,
    /// Stays gray without being listed anywhere
    Gray,
    /// Must be traversed again in the atomic phase
    GrayAgain,
    /// Weak table, cleared in the atomic phase
    Weak(GcFlags),
}

/// Weak mode of a table, from the `__mode` field of its metatable
fn weak_mode(
    metatable: Option<GcPtr<crate::runtime::Table>>,
    objects: &[Option<HeapObject>],
    mode_key: Option<GcPtr<LuaString>>,
) -> GcFlags {
    let (Some(metatable), Some(mode_key)) = (metatable, mode_key) else {
        return GcFlags::empty();
    };

    let Some(Some(HeapObject::Table(metatable))) = objects.get(metatable.id().index()) else {
        return GcFlags::empty();
    };

    let Value::String(mode) = metatable.get(&Value::String(mode_key)) else {
        return GcFlags::empty();
    };

    let Some(Some(HeapObject::String(mode))) = objects.get(mode.id().index()) else {
        return GcFlags::empty();
    };

    let mut flags = GcFlags::empty();
    flags.set(GcFlags::WEAK_KEYS, mode.as_bytes().contains(&b'k'));
    flags.set(GcFlags::WEAK_VALUES, mode.as_bytes().contains(&b'v'));
    flags
}

/// Mark the children of an object
fn traverse(
    object: &HeapObject,
    objects: &[Option<HeapObject>],
    marker: &mut Marker,
    mode_key: Option<GcPtr<LuaString>>,
) -> Traversal {
    match object {
        HeapObject::Table(table) => {
            marker.visit_opt(table.metatable());

            let mode = weak_mode(table.metatable(), objects, mode_key);
            let weak_keys = mode.contains(GcFlags::WEAK_KEYS);
            let weak_values = mode.contains(GcFlags::WEAK_VALUES);
            table.visit_entries(marker, !weak_keys, !weak_values);

            if mode.is_empty() {
                Traversal::Black
            } else {
                Traversal::Weak(mode)
            }
        }
        HeapObject::Upvalue(upvalue) => match upvalue.state() {
            UpvalueState::Closed(value) => {
                marker.visit_value(&value);
                Traversal::Black
            }
            // Open upvalues are never black, their value lives on a stack that can change
            // without a barrier
            UpvalueState::Open { thread, slot } => {
                if let Some(Some(HeapObject::Thread(coroutine))) = objects.get(thread.id().index()) {
                    if let Some(value) = coroutine.stack.get(slot) {
                        marker.visit_value(value);
                    }
                }
                Traversal::Gray
            }
        },
        // Stacks change without barriers, so threads are always traversed again atomically
        HeapObject::Thread(coroutine) => {
            coroutine.visit_pointers(marker);
            Traversal::GrayAgain
        }
        HeapObject::String(_)
        | HeapObject::Function(_)
        | HeapObject::Proto(_)
        | HeapObject::Userdata(_) => {
            object.visit_pointers(marker);
            Traversal::Black
        }
    }
}

impl GlobalState {
    #[inline]
    fn marker(&mut self) -> Marker<'_> {
        Marker { headers: &mut self.heap.headers, gray: &mut self.heap.gray }
    }

    /// Mark every root: the main thread, the registry, the type metatables, pinned values,
    /// userdata awaiting finalization and external roots.
    fn mark_roots(&mut self) {
        let main_thread = self.main_thread;
        let registry = self.registry;
        let type_metatables = self.type_metatables;

        let mut marker = Marker { headers: &mut self.heap.headers, gray: &mut self.heap.gray };
        marker.visit(main_thread);
        marker.visit_value(&registry);
        for metatable in type_metatables {
            marker.visit_opt(metatable);
        }
        for id in &self.pinned {
            marker.visit_object(*id);
        }
        for id in &self.heap.to_finalize {
            marker.visit_object(*id);
        }

        if let Some(roots) = self.external_roots.as_mut() {
            roots.visit_roots(&mut marker);
        }
    }

    /// Start a new cycle
    fn start_cycle(&mut self) {
        trace!("gc: {:?} -> {:?}", self.heap.phase, GcPhase::Propagate);

        self.heap.gray.clear();
        self.heap.gray_again.clear();
        self.heap.weak.clear();
        self.heap.bytes_freed_this_cycle = 0;
        self.heap.objects_freed_this_cycle = 0;

        self.mark_roots();
        self.heap.phase = GcPhase::Propagate;
    }

    /// Traverse one gray object. Returns the work done, in bytes traversed.
    fn propagate_mark(&mut self) -> usize {
        let mode_key = self.tag_method_names.get(TagMethod::Mode as usize).copied();
        let heap = &mut self.heap;

        let Some(id) = heap.gray.pop() else {
            return 0;
        };

        let slot = id.index();
        if heap.headers[slot].generation() != id.generation() {
            return 0;
        }

        let Some(object) = heap.objects[slot].as_ref() else {
            return 0;
        };

        heap.headers[slot].set_color(GcColor::Black);

        let mut marker = Marker { headers: &mut heap.headers, gray: &mut heap.gray };
        let traversal = traverse(object, &heap.objects, &mut marker, mode_key);

        let header = &mut heap.headers[slot];
        header.set_flags(GcFlags::WEAK_KEYS | GcFlags::WEAK_VALUES, false);
        match traversal {
            Traversal::Black => {}
            Traversal::Gray => header.set_color(GcColor::Gray),
            Traversal::GrayAgain => {
                header.set_color(GcColor::Gray);
                heap.gray_again.push(id);
            }
            Traversal::Weak(mode) => {
                header.set_color(GcColor::Gray);
                header.set_flags(mode, true);
                heap.weak.push(id);
            }
        }

        header.alloc_size()
    }

    /// Traverse gray objects until none are left. Returns the work done.
    fn propagate_all(&mut self) -> usize {
        let mut work = 0;
        while !self.heap.gray.is_empty() {
            work += self.propagate_mark();
        }
        work
    }

    /// Mark the values of open upvalues that were reached during marking. Their coroutines may
    /// be unreachable, in which case nothing else keeps the values alive.
    fn remark_upvalues(&mut self) {
        let heap = &mut self.heap;
        for id in self.open_upvalues.iter() {
            if heap.color(*id) != Some(GcColor::Gray) {
                continue;
            }

            let Some(HeapObject::Upvalue(upvalue)) = heap.objects[id.index()].as_ref() else {
                continue;
            };

            let UpvalueState::Open { thread, slot } = upvalue.state() else {
                continue;
            };

            let value = match heap.objects.get(thread.id().index()) {
                Some(Some(HeapObject::Thread(coroutine))) => coroutine.stack.get(slot).copied(),
                _ => None,
            };

            if let Some(value) = value {
                let mut marker = Marker { headers: &mut heap.headers, gray: &mut heap.gray };
                marker.visit_value(&value);
            }
        }
    }

    /// Finish marking without interruption, then prepare for sweeping.
    fn atomic(&mut self) {
        self.remark_upvalues();
        self.propagate_all();

        // Weak tables are traversed again along with the roots
        let weak = self.heap.weak.take();
        for id in weak.iter() {
            self.heap.gray.push(id);
        }
        self.mark_roots();
        self.propagate_all();

        let gray_again = self.heap.gray_again.take();
        for id in gray_again.iter() {
            self.heap.gray.push(id);
        }
        self.propagate_all();

        // Unreachable userdata with finalizers are kept alive until their finalizers have run
        let mut finalizable_bytes = self.separate_finalizable(false);
        {
            let heap = &mut self.heap;
            let mut marker = Marker { headers: &mut heap.headers, gray: &mut heap.gray };
            for id in &heap.to_finalize {
                marker.visit_object(*id);
            }
        }
        finalizable_bytes += self.propagate_all();

        self.clear_weak_tables();

        if self.options.verify_heap {
            if let Err(error) = self.verify() {
                self.raise_panic(&error);
            }
        }

        let heap = &mut self.heap;
        heap.current_white = heap.current_white.other_white();
        heap.sweep_string_pos = 0;
        heap.sweep_pos = 0;
        heap.estimate = heap.total_bytes.saturating_sub(finalizable_bytes);

        trace!("gc: {:?} -> {:?}", heap.phase, GcPhase::SweepStrings);
        heap.phase = GcPhase::SweepStrings;
    }

    /// Move userdata with finalizers out of the finalizable list. With `all` every userdata is
    /// separated, otherwise only unreachable ones. Returns the bytes of separated userdata.
    pub(crate) fn separate_finalizable(&mut self, all: bool) -> usize {
        let finalizable = mem::take(&mut self.heap.finalizable);
        let mut separated_bytes = 0;

        for id in finalizable {
            let Some(header) = self.heap.header(id) else {
                continue;
            };

            if !(all || header.color().is_white()) || header.flags().contains(GcFlags::FINALIZED) {
                self.heap.finalizable.push(id);
                continue;
            }

            let alloc_size = header.alloc_size();
            if let Some(header) = self.heap.header_mut(id) {
                header.set_flags(GcFlags::FINALIZED, true);
                header.set_flags(GcFlags::FINALIZABLE, false);
            }

            // The metatable may have lost its finalizer since registration
            if !self.gc_metamethod(id).is_nil() {
                separated_bytes += alloc_size;
                self.heap.to_finalize.push_back(id);
            }
        }

        separated_bytes
    }

    /// Remove entries with collected keys or values from every weak table
    fn clear_weak_tables(&mut self) {
        let heap = &mut self.heap;
        let weak = heap.weak.take();

        for id in weak.iter() {
            let headers = &mut heap.headers;
            let weak_values = headers[id.index()].flags().contains(GcFlags::WEAK_VALUES);
            let Some(HeapObject::Table(table)) = heap.objects[id.index()].as_mut() else {
                continue;
            };

            table.clear_entries(weak_values, |value, is_key| is_cleared(headers, value, is_key));
        }
    }

    // ========================================================================
    // Sweeping
    // ========================================================================

    /// Sweep one bucket of the string table
    fn sweep_strings_step(&mut self) {
        let old_total = self.heap.total_bytes;

        let position = self.heap.sweep_string_pos;
        self.strings.sweep_bucket(position, &mut self.heap);
        self.heap.sweep_string_pos += 1;

        if self.heap.sweep_string_pos >= self.strings.size() {
            trace!("gc: {:?} -> {:?}", self.heap.phase, GcPhase::SweepObjects);
            self.heap.phase = GcPhase::SweepObjects;
        }

        let freed = old_total.saturating_sub(self.heap.total_bytes);
        self.heap.estimate = self.heap.estimate.saturating_sub(freed);
    }

    /// Sweep a bounded number of arena slots
    fn sweep_objects_step(&mut self) {
        let old_total = self.heap.total_bytes;
        let dead_white = self.heap.current_white.other_white();

        let start = self.heap.sweep_pos;
        let end = (start + GC_SWEEP_MAX).min(self.heap.num_slots());

        for slot in start..end {
            let Some(id) = self.heap.id_at(slot) else {
                continue;
            };

            let header = &self.heap.headers[slot];
            match header.kind() {
                // Swept through the string table
                ObjectKind::String => continue,
                _ if header.color() == dead_white && !header.is_fixed() => self.free_object(id),
                ObjectKind::Thread => {
                    self.heap.make_white(id);
                    self.shrink_thread(id);
                }
                _ => self.heap.make_white(id),
            }
        }

        self.heap.sweep_pos = end;
        if end >= self.heap.num_slots() {
            self.check_sizes();
            trace!("gc: {:?} -> {:?}", self.heap.phase, GcPhase::Finalize);
            self.heap.phase = GcPhase::Finalize;
        }

        let freed = old_total.saturating_sub(self.heap.total_bytes);
        self.heap.estimate = self.heap.estimate.saturating_sub(freed);
    }

    fn shrink_thread(&mut self, id: ObjectId) {
        // A pinned thread may be in the middle of growing its stack
        if self.pinned.contains(&id) {
            return;
        }

        let max_call_depth = self.options.max_call_depth;
        let thread = GcPtr::from_id(id);

        let Some(coroutine) = self.heap.get_mut::<crate::runtime::Coroutine>(thread) else {
            return;
        };

        let shrunk = coroutine.shrink(max_call_depth);
        let new_size = coroutine.heap_size();
        let _ = self.heap.resize(id, new_size);

        if let Some((old_size, new_size)) = shrunk {
            debug!("shrank stack of {:?} from {} to {} slots", id, old_size, new_size);
            self.notify_stack_reallocated(crate::runtime::StackReallocation {
                thread,
                old_size,
                new_size,
            });
        }
    }

    /// Shrink the string table if it has become sparse
    fn check_sizes(&mut self) {
        let size = self.strings.size();
        if self.strings.len() < size / 4 && size > MIN_STRING_TABLE_SIZE * 2 {
            self.resize_string_table(size / 2);
        }
    }

    /// Resize the string table, accounting for its bucket array. Skipped while the table is
    /// being swept.
    pub(crate) fn resize_string_table(&mut self, new_size: usize) -> bool {
        if self.heap.phase == GcPhase::SweepStrings {
            return false;
        }

        let old_bytes = StringTable::bytes_for_size(self.strings.size());
        let new_bytes = StringTable::bytes_for_size(new_size);
        if self.heap.realloc(old_bytes, new_bytes).is_err() {
            return false;
        }

        debug!("resizing string table from {} to {} buckets", self.strings.size(), new_size);
        self.strings.resize(new_size);
        true
    }

    /// Free a dead object, detaching it from the structures that refer to it without keeping it
    /// alive.
    pub(crate) fn free_object(&mut self, id: ObjectId) {
        let flags = self.heap.flags(id);
        let Some(object) = self.heap.free(id) else {
            return;
        };

        match object {
            HeapObject::Upvalue(upvalue) => {
                self.open_upvalues.remove(&id);
                if let UpvalueState::Open { thread, slot } = upvalue.state() {
                    if let Some(coroutine) = self.heap.get_mut(thread) {
                        if coroutine.open_upvalues.get(&slot).map(|upvalue| upvalue.id()) == Some(id) {
                            coroutine.open_upvalues.remove(&slot);
                        }
                    }
                }
            }
            HeapObject::Thread(coroutine) => {
                // Upvalues still reachable from closures outlive the thread
                for (slot, upvalue) in &coroutine.open_upvalues {
                    self.open_upvalues.remove(&upvalue.id());
                    let value = coroutine.stack.get(*slot).copied().unwrap_or_default();
                    if let Some(upvalue) = self.heap.get_mut(*upvalue) {
                        upvalue.close(value);
                    }
                }
            }
            HeapObject::Userdata(_) if flags.contains(GcFlags::FINALIZABLE) => {
                self.heap.finalizable.retain(|finalizable| *finalizable != id);
            }
            _ => {}
        }
    }

    /// Free every object. Used when the runtime is closed.
    pub(crate) fn free_all(&mut self) {
        for slot in 0..self.heap.num_slots() {
            if let Some(id) = self.heap.id_at(slot) {
                self.heap.free(id);
            }
        }

        self.open_upvalues.clear();
        self.heap.finalizable.clear();
        self.heap.to_finalize.clear();
        self.strings = StringTable::new(1);
    }

    // ========================================================================
    // Barriers
    // ========================================================================

    /// Write barrier, called after `value` is stored into `container`.
    ///
    /// Tables get a backward barrier: the table turns gray again and is rescanned atomically.
    /// Other objects get a forward barrier: while marking the stored object is marked, during
    /// sweeping the container is whitened so no further barriers fire for it.
    pub(crate) fn barrier(&mut self, container: ObjectId, value: &Value) {
        if let Some(target) = value.object_id() {
            self.barrier_object(container, target);
        }
    }

    pub(crate) fn barrier_object(&mut self, container: ObjectId, target: ObjectId) {
        if !self.heap.is_black(container) || !self.heap.is_white(target) {
            return;
        }

        if self.heap.kind(container) == Some(ObjectKind::Table) {
            self.barrier_back(container);
        } else if self.heap.phase == GcPhase::Propagate {
            self.marker().mark(target);
        } else {
            self.heap.make_white(container);
        }
    }

    fn barrier_back(&mut self, table: ObjectId) {
        if let Some(header) = self.heap.header_mut(table) {
            header.set_color(GcColor::Gray);
        }
        self.heap.gray_again.push(table);
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Check that no live object refers to a freed one and, while marking, that no black object
    /// refers to a white one.
    pub(crate) fn verify(&self) -> LuaResult<()> {
        let check_colors = self.heap.phase == GcPhase::Propagate;

        for slot in 0..self.heap.num_slots() {
            let Some(id) = self.heap.id_at(slot) else {
                continue;
            };
            // Unreachable objects may refer to objects swept before them
            if self.heap.is_dead(id) {
                continue;
            }
            let (Some(header), Some(object)) = (self.heap.header(id), self.heap.object(id)) else {
                continue;
            };

            let mut checker = Checker {
                heap: &self.heap,
                kind: header.kind(),
                color: header.color(),
                check_colors: check_colors && header.is_black(),
                error: None,
            };
            object.visit_pointers(&mut checker);

            if let Some(error) = checker.error {
                return Err(error);
            }
        }

        Ok(())
    }
}

/// Whether a weak table entry refers to a collected object. Strings are values, not references,
/// so they are never cleared and get marked instead. Finalized userdata are cleared as values
/// but kept as keys.
fn is_cleared(headers: &mut [GcHeader], value: &Value, is_key: bool) -> bool {
    let Some(id) = value.object_id() else {
        return false;
    };

    let Some(header) = headers.get_mut(id.index()) else {
        return true;
    };

    if header.generation() != id.generation() {
        return true;
    }

    if header.kind() == ObjectKind::String {
        header.set_color(GcColor::Black);
        return false;
    }

    header.color().is_white()
        || (header.kind() == ObjectKind::Userdata
            && !is_key
            && header.flags().contains(GcFlags::FINALIZED))
}

struct Checker<'a> {
    heap: &'a Heap,
    kind: ObjectKind,
    color: GcColor,
    check_colors: bool,
    error: Option<LuaError>,
}

impl GcVisitor for Checker<'_> {
    fn visit_object(&mut self, id: ObjectId) {
        if self.error.is_some() {
            return;
        }

        let Some(child) = self.heap.header(id) else {
            self.error = Some(LuaError::DanglingReference { kind: self.kind });
            return;
        };

        if self.check_colors && child.color().is_white() {
            self.error = Some(LuaError::CollectorInvariantViolation {
                kind: self.kind,
                color: self.color,
                child_kind: child.kind(),
                child_color: child.color(),
            });
        }
    }
}

// ============================================================================
// Driving the collector
// ============================================================================

impl Lua {
    /// Run a collector step if enough has been allocated since the last one
    pub fn check_gc(&mut self) {
        if self.g.gc_running || self.g.in_finalizer || self.g.closed {
            return;
        }

        if self.g.options.gc_stress_test {
            self.full_gc();
            return;
        }

        if self.g.heap.total_bytes >= self.g.heap.threshold {
            self.gc_step();
        }
    }

    /// Perform one increment of collection work, sized by the step multiplier, and schedule the
    /// next one.
    pub fn gc_step(&mut self) {
        if self.g.gc_running || self.g.in_finalizer {
            return;
        }
        self.g.gc_running = true;

        let heap = &mut self.g.heap;
        let mut limit = ((GC_STEP_SIZE / 100) * heap.step_multiplier) as isize;
        if limit == 0 {
            limit = isize::MAX / 2;
        }
        heap.debt += heap.total_bytes.saturating_sub(heap.threshold);

        loop {
            limit -= self.single_step() as isize;
            if self.g.heap.phase == GcPhase::Pause || limit <= 0 {
                break;
            }
        }

        let heap = &mut self.g.heap;
        if heap.phase != GcPhase::Pause {
            if heap.debt < GC_STEP_SIZE {
                heap.threshold = heap.total_bytes + GC_STEP_SIZE;
            } else {
                heap.debt -= GC_STEP_SIZE;
                heap.threshold = heap.total_bytes;
            }
        } else {
            self.set_threshold();
        }

        self.g.gc_running = false;
    }

    /// Advance the collector by a single state machine step. Returns the work done.
    pub fn gc_single_step(&mut self) -> usize {
        if self.g.gc_running || self.g.in_finalizer {
            return 0;
        }

        self.g.gc_running = true;
        let work = self.single_step();
        self.g.gc_running = false;

        work
    }

    fn single_step(&mut self) -> usize {
        match self.g.heap.phase {
            GcPhase::Pause => {
                self.g.start_cycle();
                0
            }
            GcPhase::Propagate => {
                if self.g.heap.gray.is_empty() {
                    self.g.atomic();
                    0
                } else {
                    self.g.propagate_mark()
                }
            }
            GcPhase::SweepStrings => {
                self.g.sweep_strings_step();
                GC_SWEEP_COST
            }
            GcPhase::SweepObjects => {
                self.g.sweep_objects_step();
                GC_SWEEP_MAX * GC_SWEEP_COST
            }
            GcPhase::Finalize => match self.g.heap.to_finalize.pop_front() {
                Some(userdata) => {
                    self.run_finalizer(userdata);
                    let heap = &mut self.g.heap;
                    if heap.estimate > GC_FINALIZE_COST {
                        heap.estimate -= GC_FINALIZE_COST;
                    }
                    GC_FINALIZE_COST
                }
                None => {
                    let heap = &mut self.g.heap;
                    heap.phase = GcPhase::Pause;
                    heap.debt = 0;
                    heap.cycles += 1;
                    debug!(
                        "gc cycle {} complete: freed {} objects ({} bytes), {} bytes in use",
                        heap.cycles,
                        heap.objects_freed_this_cycle,
                        heap.bytes_freed_this_cycle,
                        heap.total_bytes
                    );
                    0
                }
            },
        }
    }

    /// Run a complete collection cycle, finishing any cycle in progress first
    pub fn full_gc(&mut self) {
        if self.g.gc_running || self.g.in_finalizer || self.g.closed {
            return;
        }

        self.g.gc_running = true;
        let heap = &mut self.g.heap;

        // Abandon an unfinished mark phase. Sweeping without a white flip frees nothing and
        // whitens every object.
        if matches!(heap.phase, GcPhase::Pause | GcPhase::Propagate) {
            heap.sweep_string_pos = 0;
            heap.sweep_pos = 0;
            heap.gray.clear();
            heap.gray_again.clear();
            heap.weak.clear();
            heap.phase = GcPhase::SweepStrings;
        }

        while self.g.heap.phase != GcPhase::Finalize {
            self.single_step();
        }

        self.g.start_cycle();
        while self.g.heap.phase != GcPhase::Pause {
            self.single_step();
        }

        self.set_threshold();
        self.g.gc_running = false;
    }

    fn set_threshold(&mut self) {
        let heap = &mut self.g.heap;
        heap.threshold = (heap.estimate / 100).saturating_mul(heap.pause);
    }

    /// Run the `__gc` metamethod of an unreachable userdata. The userdata is whitened and stays
    /// alive until the next cycle finds it unreachable again.
    fn run_finalizer(&mut self, id: ObjectId) {
        self.g.heap.make_white(id);

        let method = self.g.gc_metamethod(id);
        if method.is_nil() {
            return;
        }

        let Some(mut finalizer) = self.g.finalizer.take() else {
            return;
        };

        // No collection while the finalizer runs
        let heap = &mut self.g.heap;
        let old_threshold = mem::replace(&mut heap.threshold, heap.total_bytes.saturating_mul(2));
        self.g.in_finalizer = true;

        trace!("running finalizer of {:?}", id);
        finalizer.finalize(self, GcPtr::<Userdata>::from_id(id), method);

        self.g.in_finalizer = false;
        self.g.heap.threshold = old_threshold;
        if self.g.finalizer.is_none() {
            self.g.finalizer = Some(finalizer);
        }
    }

    /// Run every pending finalizer
    pub(crate) fn run_pending_finalizers(&mut self) {
        while let Some(userdata) = self.g.heap.to_finalize.pop_front() {
            self.run_finalizer(userdata);
        }
    }

    /// Control the collector. Results follow the command, see [`GcCommand`].
    pub fn gc(&mut self, command: GcCommand) -> usize {
        let heap = &mut self.g.heap;
        match command {
            GcCommand::Stop => {
                heap.threshold = usize::MAX;
                0
            }
            GcCommand::Restart => {
                heap.threshold = heap.total_bytes;
                0
            }
            GcCommand::Collect => {
                self.full_gc();
                0
            }
            GcCommand::Count => heap.total_bytes >> 10,
            GcCommand::CountBytes => heap.total_bytes & 0x3ff,
            GcCommand::Step(kilobytes) => {
                if self.g.gc_running || self.g.in_finalizer {
                    return 0;
                }

                let heap = &mut self.g.heap;
                heap.threshold = heap.total_bytes.saturating_sub(kilobytes << 10);
                while self.g.heap.threshold <= self.g.heap.total_bytes {
                    self.gc_step();
                    if self.g.heap.phase == GcPhase::Pause {
                        return 1;
                    }
                }
                0
            }
            GcCommand::SetPause(pause) => mem::replace(&mut heap.pause, pause),
            GcCommand::SetStepMultiplier(step_multiplier) => {
                mem::replace(&mut heap.step_multiplier, step_multiplier)
            }
        }
    }

    pub fn gc_stats(&self) -> GcStats {
        let heap = &self.g.heap;
        GcStats {
            phase: heap.phase,
            total_bytes: heap.total_bytes,
            threshold: heap.threshold,
            estimate: heap.estimate,
            debt: heap.debt,
            pause: heap.pause,
            step_multiplier: heap.step_multiplier,
            num_objects: heap.num_objects(),
            cycles: heap.cycles,
            string_table_size: self.g.strings.size(),
            num_strings: self.g.strings.len(),
        }
    }

    /// Check the heap for references to freed objects and, while marking, for black objects
    /// that refer to white ones.
    pub fn verify_heap(&self) -> LuaResult<()> {
        self.g.verify()
    }

    /// Report a memory request that was refused, then run an emergency collection
    pub(crate) fn emergency_gc(&mut self, requested: usize) -> bool {
        if self.g.gc_running || self.g.in_finalizer || self.g.closed {
            return false;
        }

        warn!("allocation of {} bytes refused, running an emergency collection", requested);
        self.full_gc();
        true
    }
}
