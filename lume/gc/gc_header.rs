//! GC header for tri-color marking
//!
//! Every slot of the heap arena has a header tracking the color, flags, type tag and accounted
//! size of the object stored in it. Headers outlive their objects so that the slot generation is
//! preserved across reuse.

use bitflags::bitflags;

/// Colors used in tri-color marking.
///
/// There are two whites. After each mark phase the meaning of "current white" flips, so objects
/// still carrying the previous white are known to be dead without a separate unmarking pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GcColor {
    White0 = 0,
    White1 = 1,
    /// Visited but children not yet scanned
    Gray = 2,
    /// Visited and all children scanned
    Black = 3,
}

impl Default for GcColor {
    fn default() -> Self {
        GcColor::White0
    }
}

impl GcColor {
    #[inline]
    pub fn is_white(self) -> bool {
        matches!(self, GcColor::White0 | GcColor::White1)
    }

    /// The white that is not this one. Only meaningful for whites.
    #[inline]
    pub fn other_white(self) -> GcColor {
        match self {
            GcColor::White0 => GcColor::White1,
            GcColor::White1 => GcColor::White0,
            other => other,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct GcFlags: u8 {
        /// Never collected
        const FIXED = 1 << 0;
        /// Finalizer has been scheduled, never schedule it again
        const FINALIZED = 1 << 1;
        /// Table has weak keys for the current traversal
        const WEAK_KEYS = 1 << 2;
        /// Table has weak values for the current traversal
        const WEAK_VALUES = 1 << 3;
        /// Userdata registered for finalization
        const FINALIZABLE = 1 << 4;
    }
}

/// Phases of an incremental collection cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcPhase {
    /// No cycle in progress
    Pause,
    /// Incrementally marking gray objects. Ends with the atomic phase.
    Propagate,
    /// Sweeping the string table one bucket at a time
    SweepStrings,
    /// Sweeping all other objects
    SweepObjects,
    /// Running finalizers of unreachable userdata
    Finalize,
}

impl Default for GcPhase {
    fn default() -> Self {
        GcPhase::Pause
    }
}

/// Type tag of a heap object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    String,
    Table,
    Function,
    Proto,
    Upvalue,
    Userdata,
    Thread,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::String => "string",
            ObjectKind::Table => "table",
            ObjectKind::Function => "function",
            ObjectKind::Proto => "proto",
            ObjectKind::Upvalue => "upvalue",
            ObjectKind::Userdata => "userdata",
            ObjectKind::Thread => "thread",
        }
    }
}

/// Header kept for every slot in the heap arena
#[derive(Clone, Debug)]
pub struct GcHeader {
    /// Incremented every time the slot is freed
    generation: u32,
    /// Current color in tri-color marking
    color: GcColor,
    flags: GcFlags,
    /// Type tag of the object in the slot
    kind: ObjectKind,
    /// Bytes accounted to the object
    alloc_size: usize,
}

impl GcHeader {
    /// Create a new GC header for an allocation
    #[inline]
    pub fn new(kind: ObjectKind, color: GcColor, alloc_size: usize) -> GcHeader {
        GcHeader { generation: 0, color, flags: GcFlags::empty(), kind, alloc_size }
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Get the color of this object
    #[inline]
    pub fn color(&self) -> GcColor {
        self.color
    }

    /// Set the color of this object
    #[inline]
    pub fn set_color(&mut self, color: GcColor) {
        self.color = color;
    }

    #[inline]
    pub fn flags(&self) -> GcFlags {
        self.flags
    }

    #[inline]
    pub fn set_flags(&mut self, flags: GcFlags, value: bool) {
        self.flags.set(flags, value);
    }

    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.flags.contains(GcFlags::FIXED)
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Get the number of bytes accounted to this object
    #[inline]
    pub fn alloc_size(&self) -> usize {
        self.alloc_size
    }

    #[inline]
    pub fn set_alloc_size(&mut self, alloc_size: usize) {
        self.alloc_size = alloc_size;
    }

    /// Check if this object is marked (gray or black)
    #[inline]
    pub fn is_marked(&self) -> bool {
        !self.color.is_white()
    }

    /// Check if this object is black
    #[inline]
    pub fn is_black(&self) -> bool {
        self.color == GcColor::Black
    }

    /// Reuse the slot for a new object, keeping the generation.
    pub(crate) fn reset(&mut self, kind: ObjectKind, color: GcColor, alloc_size: usize) {
        self.color = color;
        self.flags = GcFlags::empty();
        self.kind = kind;
        self.alloc_size = alloc_size;
    }

    /// Retire the slot. Handles created before this call no longer match the slot.
    pub(crate) fn retire(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.flags = GcFlags::empty();
        self.alloc_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_header_color() {
        let mut header = GcHeader::new(ObjectKind::Table, GcColor::White0, 64);
        assert_eq!(header.color(), GcColor::White0);
        assert!(!header.is_marked());

        header.set_color(GcColor::Gray);
        assert_eq!(header.color(), GcColor::Gray);
        assert!(header.is_marked());

        header.set_color(GcColor::Black);
        assert!(header.is_black());
    }

    #[test]
    fn test_other_white() {
        assert_eq!(GcColor::White0.other_white(), GcColor::White1);
        assert_eq!(GcColor::White1.other_white(), GcColor::White0);
        assert!(!GcColor::Gray.is_white());
    }

    #[test]
    fn test_retire_bumps_generation() {
        let mut header = GcHeader::new(ObjectKind::String, GcColor::White1, 32);
        header.set_flags(GcFlags::FIXED, true);
        header.retire();

        assert_eq!(header.generation(), 1);
        assert!(!header.is_fixed());
        assert_eq!(header.alloc_size(), 0);
    }
}
