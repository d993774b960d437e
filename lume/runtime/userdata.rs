use std::{any::Any, mem::size_of};

use crate::gc::{GcPtr, GcVisitor};

use super::{table::Table, value::Value};

/// A block of embedder data managed by the collector.
///
/// The payload is dropped when the userdata is freed, after its `__gc` metamethod (if any) has
/// been run.
pub struct Userdata {
    metatable: Option<GcPtr<Table>>,
    env: Value,
    payload: Box<dyn Any + Send>,
    payload_size: usize,
}

impl Userdata {
    pub fn new<T: Any + Send>(payload: T) -> Userdata {
        Userdata {
            metatable: None,
            env: Value::Nil,
            payload: Box::new(payload),
            payload_size: size_of::<T>(),
        }
    }

    #[inline]
    pub fn metatable(&self) -> Option<GcPtr<Table>> {
        self.metatable
    }

    #[inline]
    pub(crate) fn set_metatable(&mut self, metatable: Option<GcPtr<Table>>) {
        self.metatable = metatable;
    }

    #[inline]
    pub fn env(&self) -> Value {
        self.env
    }

    #[inline]
    pub(crate) fn set_env(&mut self, env: Value) {
        self.env = env;
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut()
    }

    pub fn heap_size(&self) -> usize {
        size_of::<Userdata>() + self.payload_size
    }

    pub fn visit_pointers(&self, visitor: &mut impl GcVisitor) {
        visitor.visit_opt(self.metatable);
        visitor.visit_value(&self.env);
    }
}
