//! Handles to GC-managed objects
//!
//! Objects live in slots of the heap arena. A handle names a slot together with the generation
//! the slot had when the object was allocated, so a handle to a freed object never aliases a
//! newer object placed in the same slot.

use core::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
};

/// An untyped handle to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> ObjectId {
        ObjectId { index, generation }
    }

    /// Index of the arena slot holding the object
    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Generation of the slot at the time the object was allocated
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// A typed handle to a GC-managed object.
///
/// Copying a `GcPtr` does not keep the object alive. An object survives a collection only while
/// it is reachable from the roots of its runtime.
#[repr(transparent)]
pub struct GcPtr<T> {
    id: ObjectId,
    phantom: PhantomData<fn() -> T>,
}

impl<T> GcPtr<T> {
    /// Create a typed handle from an id. The caller must know the object has type `T`.
    #[inline]
    pub(crate) const fn from_id(id: ObjectId) -> GcPtr<T> {
        GcPtr { id, phantom: PhantomData }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Whether two handles refer to the same object
    #[inline]
    pub fn ptr_eq(&self, other: &GcPtr<T>) -> bool {
        self.id == other.id
    }
}

impl<T> Clone for GcPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GcPtr<T> {}

impl<T> PartialEq for GcPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for GcPtr<T> {}

impl<T> Hash for GcPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for GcPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcPtr({:?})", self.id)
    }
}
