//! Garbage collector
//!
//! An incremental tri-color mark-sweep collector over an arena of heap objects.
//!
//! Key types:
//! - `GcPtr<T>`: A generation-checked handle to a heap object
//! - `GcHeader`: Color, flags and size of each object
//! - `Heap`: The arena, memory accounting and collector lists
//!
//! Key traits:
//! - `GcVisitor`: Implemented by the collector, used by objects to report references
//! - `ExternalRoots`: Implemented by embedders holding references outside the runtime
//! - `MemoryHook`: The authority on whether memory may be allocated

mod collector;
mod gc_header;
mod gray_queue;
mod heap;
mod memory;
mod pointer;
mod visitor;

pub use collector::{GcCommand, GcStats, Marker};
pub use gc_header::{GcColor, GcFlags, GcHeader, GcPhase, ObjectKind};
pub use gray_queue::GrayQueue;
pub use heap::{AllocError, AllocResult, Heap};
pub use memory::{LimitedAllocator, MemoryHook, SystemAllocator};
pub use pointer::{GcPtr, ObjectId};
pub use visitor::{ExternalRoots, GcVisitor};

#[cfg(test)]
mod tests;
