//! Visitor traits for GC tracing

use crate::runtime::Value;

use super::pointer::{GcPtr, ObjectId};

/// Visitor for GC tracing - implemented by the GC, used by objects
///
/// Objects implement `visit_pointers` to report their pointers to the visitor.
///
/// # Example
/// ```ignore
/// impl Table {
///     pub fn visit_pointers(&self, visitor: &mut impl GcVisitor) {
///         visitor.visit_opt(self.metatable);
///         for value in &self.array {
///             visitor.visit_value(value);
///         }
///     }
/// }
/// ```
pub trait GcVisitor {
    /// Visit a strongly held object
    fn visit_object(&mut self, id: ObjectId);

    /// Visit a strongly held value. Values that are not heap objects are ignored.
    #[inline]
    fn visit_value(&mut self, value: &Value) {
        if let Some(id) = value.object_id() {
            self.visit_object(id);
        }
    }

    /// Visit a strongly held typed pointer
    #[inline]
    fn visit<T>(&mut self, ptr: GcPtr<T>)
    where
        Self: Sized,
    {
        self.visit_object(ptr.id());
    }

    /// Visit an optional pointer
    #[inline]
    fn visit_opt<T>(&mut self, ptr: Option<GcPtr<T>>)
    where
        Self: Sized,
    {
        if let Some(ptr) = ptr {
            self.visit_object(ptr.id());
        }
    }
}

/// Roots held outside of the runtime, e.g. by an embedder or an interpreter loop.
///
/// Visited at the start of every cycle and again during the atomic phase.
pub trait ExternalRoots: Send {
    fn visit_roots(&mut self, visitor: &mut dyn GcVisitor);
}
