//! Heap - arena of GC-managed objects with memory accounting
//!
//! Design:
//! - Objects live in slots of an arena. Headers and objects are stored in parallel vectors so
//!   the marker can recolor headers while reading objects.
//! - Freed slots are reused. Every reuse bumps the slot generation, invalidating old handles.
//! - Every change in accounted bytes goes through [`Heap::realloc`], which consults the
//!   [`MemoryHook`].
//!
//! The collector state machine that drives marking and sweeping lives in `collector.rs`.

use std::collections::VecDeque;
use std::fmt;

use crate::common::constants::{DEFAULT_GC_PAUSE, DEFAULT_GC_STEP_MULTIPLIER};
use crate::runtime::object::{HeapItem, HeapObject};

use super::{
    gc_header::{GcColor, GcFlags, GcHeader, GcPhase, ObjectKind},
    gray_queue::GrayQueue,
    memory::{MemoryHook, SystemAllocator},
    pointer::{GcPtr, ObjectId},
};

/// Result type for allocations
pub type AllocResult<T> = Result<T, AllocError>;

/// Allocation refused by the memory hook
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("allocation refused")
    }
}

/// The managed heap
pub struct Heap {
    /// One header per arena slot, live or free
    pub(crate) headers: Vec<GcHeader>,

    /// Objects, parallel to `headers`. `None` for free slots.
    pub(crate) objects: Vec<Option<HeapObject>>,

    /// Free slot indices available for reuse
    free_slots: Vec<u32>,

    /// Number of objects currently allocated
    num_objects: usize,

    /// Hook consulted on every change of accounted memory
    hook: Box<dyn MemoryHook>,

    /// Number of bytes currently accounted
    pub(crate) total_bytes: usize,

    /// White assigned to new objects. Flipped at the end of every mark phase.
    pub(crate) current_white: GcColor,

    /// Current GC phase
    pub(crate) phase: GcPhase,

    /// Gray objects waiting to be traversed
    pub(crate) gray: GrayQueue,

    /// Objects that must be traversed again in the atomic phase
    pub(crate) gray_again: GrayQueue,

    /// Weak tables found during marking, cleared in the atomic phase
    pub(crate) weak: GrayQueue,

    /// Userdata with a finalizer that have not been separated yet
    pub(crate) finalizable: Vec<ObjectId>,

    /// Unreachable userdata whose finalizers have yet to run
    pub(crate) to_finalize: VecDeque<ObjectId>,

    /// Next string table bucket to sweep
    pub(crate) sweep_string_pos: usize,

    /// Next arena slot to sweep
    pub(crate) sweep_pos: usize,

    /// Allocation total at which the next collector step runs
    pub(crate) threshold: usize,

    /// Estimate of the bytes in use by live objects
    pub(crate) estimate: usize,

    /// Allocation debt the collector has not yet paid off
    pub(crate) debt: usize,

    /// Percentage of the live estimate to wait for before starting a new cycle
    pub(crate) pause: usize,

    /// Collector work per unit of allocation, as a percentage
    pub(crate) step_multiplier: usize,

    /// Number of completed cycles
    pub(crate) cycles: u64,

    /// Stats for current GC cycle
    pub(crate) bytes_freed_this_cycle: usize,
    pub(crate) objects_freed_this_cycle: usize,
}

impl Heap {
    /// Create a new heap
    pub fn new() -> Heap {
        Heap::with_memory_hook(Box::new(SystemAllocator))
    }

    pub fn with_memory_hook(hook: Box<dyn MemoryHook>) -> Heap {
        Heap {
            headers: Vec::new(),
            objects: Vec::new(),
            free_slots: Vec::new(),
            num_objects: 0,
            hook,
            total_bytes: 0,
            current_white: GcColor::White0,
            phase: GcPhase::Pause,
            gray: GrayQueue::new(),
            gray_again: GrayQueue::new(),
            weak: GrayQueue::new(),
            finalizable: Vec::new(),
            to_finalize: VecDeque::new(),
            sweep_string_pos: 0,
            sweep_pos: 0,
            threshold: usize::MAX,
            estimate: 0,
            debt: 0,
            pause: DEFAULT_GC_PAUSE,
            step_multiplier: DEFAULT_GC_STEP_MULTIPLIER,
            cycles: 0,
            bytes_freed_this_cycle: 0,
            objects_freed_this_cycle: 0,
        }
    }

    /// Get current GC phase
    #[inline]
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Get bytes currently accounted
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Get number of objects currently allocated
    #[inline]
    pub fn num_objects(&self) -> usize {
        self.num_objects
    }

    #[inline]
    pub fn current_white(&self) -> GcColor {
        self.current_white
    }

    /// Number of arena slots, live or free
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.headers.len()
    }

    // ========================================================================
    // Memory accounting
    // ========================================================================

    /// Change the accounted size of a block from `old_size` to `new_size`.
    ///
    /// Growth may be refused by the memory hook. Shrinking always succeeds.
    pub fn realloc(&mut self, old_size: usize, new_size: usize) -> AllocResult<()> {
        let accepted = self.hook.realloc(old_size, new_size);
        if !accepted && new_size > old_size {
            return Err(AllocError);
        }

        self.total_bytes = self.total_bytes - old_size.min(self.total_bytes) + new_size;
        Ok(())
    }

    /// Change the bytes accounted to a live object.
    pub fn resize(&mut self, id: ObjectId, new_size: usize) -> AllocResult<()> {
        let Some(old_size) = self.header(id).map(GcHeader::alloc_size) else {
            return Ok(());
        };

        self.realloc(old_size, new_size)?;
        self.headers[id.index()].set_alloc_size(new_size);

        Ok(())
    }

    pub fn set_memory_hook(&mut self, hook: Box<dyn MemoryHook>) -> Box<dyn MemoryHook> {
        core::mem::replace(&mut self.hook, hook)
    }

    // ========================================================================
    // Slots
    // ========================================================================

    /// Place a fully constructed object in the arena. Its bytes must already have been
    /// accounted with [`Heap::realloc`].
    ///
    /// New objects get the current white. During sweeping this keeps them alive until the next
    /// cycle, during marking they are caught by the write barrier once stored somewhere black.
    pub fn insert(&mut self, object: HeapObject, alloc_size: usize) -> ObjectId {
        let kind = object.kind();
        let color = self.current_white;
        self.num_objects += 1;

        match self.free_slots.pop() {
            Some(index) => {
                let slot = index as usize;
                self.headers[slot].reset(kind, color, alloc_size);
                self.objects[slot] = Some(object);
                ObjectId::new(index, self.headers[slot].generation())
            }
            None => {
                let index = self.headers.len() as u32;
                self.headers.push(GcHeader::new(kind, color, alloc_size));
                self.objects.push(Some(object));
                ObjectId::new(index, 0)
            }
        }
    }

    /// Remove an object from the arena and release its accounted bytes.
    pub fn free(&mut self, id: ObjectId) -> Option<HeapObject> {
        if !self.contains(id) {
            return None;
        }

        let slot = id.index();
        let object = self.objects[slot].take();
        let alloc_size = self.headers[slot].alloc_size();
        let _ = self.realloc(alloc_size, 0);

        self.headers[slot].retire();
        self.free_slots.push(id.index() as u32);
        self.num_objects -= 1;
        self.bytes_freed_this_cycle += alloc_size;
        self.objects_freed_this_cycle += 1;

        object
    }

    /// Id of the live object in a slot, if any
    #[inline]
    pub(crate) fn id_at(&self, slot: usize) -> Option<ObjectId> {
        match self.objects.get(slot) {
            Some(Some(_)) => Some(ObjectId::new(slot as u32, self.headers[slot].generation())),
            _ => None,
        }
    }

    /// Whether the handle refers to an object that has not been freed
    #[inline]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.header(id).is_some()
    }

    #[inline]
    pub fn header(&self, id: ObjectId) -> Option<&GcHeader> {
        let slot = id.index();
        let header = self.headers.get(slot)?;
        if header.generation() != id.generation() || self.objects[slot].is_none() {
            return None;
        }

        Some(header)
    }

    #[inline]
    pub fn header_mut(&mut self, id: ObjectId) -> Option<&mut GcHeader> {
        let slot = id.index();
        if self.header(id).is_none() {
            return None;
        }

        Some(&mut self.headers[slot])
    }

    #[inline]
    pub fn object(&self, id: ObjectId) -> Option<&HeapObject> {
        self.header(id)?;
        self.objects[id.index()].as_ref()
    }

    #[inline]
    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.header(id)?;
        self.objects[id.index()].as_mut()
    }

    #[inline]
    pub fn get<T: HeapItem>(&self, ptr: GcPtr<T>) -> Option<&T> {
        self.object(ptr.id()).and_then(T::from_object)
    }

    #[inline]
    pub fn get_mut<T: HeapItem>(&mut self, ptr: GcPtr<T>) -> Option<&mut T> {
        self.object_mut(ptr.id()).and_then(T::from_object_mut)
    }

    // ========================================================================
    // Colors
    // ========================================================================

    #[inline]
    pub fn color(&self, id: ObjectId) -> Option<GcColor> {
        self.header(id).map(GcHeader::color)
    }

    #[inline]
    pub fn kind(&self, id: ObjectId) -> Option<ObjectKind> {
        self.header(id).map(GcHeader::kind)
    }

    #[inline]
    pub fn is_white(&self, id: ObjectId) -> bool {
        self.color(id).is_some_and(GcColor::is_white)
    }

    #[inline]
    pub fn is_black(&self, id: ObjectId) -> bool {
        self.color(id) == Some(GcColor::Black)
    }

    /// An object is dead when it still carries the previous white after a mark phase.
    #[inline]
    pub fn is_dead(&self, id: ObjectId) -> bool {
        match self.header(id) {
            Some(header) => {
                header.color() == self.current_white.other_white() && !header.is_fixed()
            }
            None => true,
        }
    }

    /// Give an object the current white
    #[inline]
    pub fn make_white(&mut self, id: ObjectId) {
        let white = self.current_white;
        if let Some(header) = self.header_mut(id) {
            header.set_color(white);
        }
    }

    /// Exclude an object from collection forever
    pub fn fix(&mut self, id: ObjectId) {
        if let Some(header) = self.header_mut(id) {
            header.set_flags(GcFlags::FIXED, true);
        }
    }

    #[inline]
    pub fn flags(&self, id: ObjectId) -> GcFlags {
        self.header(id).map(GcHeader::flags).unwrap_or_default()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
