use crate::gc::{GcVisitor, ObjectKind};

use super::{
    coroutine::Coroutine,
    function::{Closure, Proto},
    string::LuaString,
    table::Table,
    upvalue::UpVal,
    userdata::Userdata,
};

/// Every kind of object stored on the heap
pub enum HeapObject {
    String(LuaString),
    Table(Table),
    Function(Closure),
    Proto(Proto),
    Upvalue(UpVal),
    Userdata(Userdata),
    Thread(Box<Coroutine>),
}

impl HeapObject {
    #[inline]
    pub fn kind(&self) -> ObjectKind {
        match self {
            HeapObject::String(_) => ObjectKind::String,
            HeapObject::Table(_) => ObjectKind::Table,
            HeapObject::Function(_) => ObjectKind::Function,
            HeapObject::Proto(_) => ObjectKind::Proto,
            HeapObject::Upvalue(_) => ObjectKind::Upvalue,
            HeapObject::Userdata(_) => ObjectKind::Userdata,
            HeapObject::Thread(_) => ObjectKind::Thread,
        }
    }

    /// Bytes accounted to the object
    pub fn heap_size(&self) -> usize {
        match self {
            HeapObject::String(string) => string.heap_size(),
            HeapObject::Table(table) => table.heap_size(),
            HeapObject::Function(closure) => closure.heap_size(),
            HeapObject::Proto(proto) => proto.heap_size(),
            HeapObject::Upvalue(upvalue) => upvalue.heap_size(),
            HeapObject::Userdata(userdata) => userdata.heap_size(),
            HeapObject::Thread(thread) => thread.heap_size(),
        }
    }

    /// Visit every strong reference held by the object
    pub fn visit_pointers(&self, visitor: &mut impl GcVisitor) {
        match self {
            HeapObject::String(string) => string.visit_pointers(visitor),
            HeapObject::Table(table) => table.visit_pointers(visitor),
            HeapObject::Function(closure) => closure.visit_pointers(visitor),
            HeapObject::Proto(proto) => proto.visit_pointers(visitor),
            HeapObject::Upvalue(upvalue) => upvalue.visit_pointers(visitor),
            HeapObject::Userdata(userdata) => userdata.visit_pointers(visitor),
            HeapObject::Thread(thread) => thread.visit_pointers(visitor),
        }
    }
}

/// Trait implemented by every type stored in a [`HeapObject`] variant
pub trait HeapItem: Sized {
    const KIND: ObjectKind;

    fn into_object(self) -> HeapObject;

    fn from_object(object: &HeapObject) -> Option<&Self>;

    fn from_object_mut(object: &mut HeapObject) -> Option<&mut Self>;
}

macro_rules! heap_item {
    ($ty:ty, $variant:ident) => {
        impl HeapItem for $ty {
            const KIND: ObjectKind = ObjectKind::$variant;

            #[inline]
            fn into_object(self) -> HeapObject {
                HeapObject::$variant(self)
            }

            #[inline]
            fn from_object(object: &HeapObject) -> Option<&Self> {
                match object {
                    HeapObject::$variant(item) => Some(item),
                    _ => None,
                }
            }

            #[inline]
            fn from_object_mut(object: &mut HeapObject) -> Option<&mut Self> {
                match object {
                    HeapObject::$variant(item) => Some(item),
                    _ => None,
                }
            }
        }
    };
}

heap_item!(LuaString, String);
heap_item!(Table, Table);
heap_item!(Closure, Function);
heap_item!(Proto, Proto);
heap_item!(UpVal, Upvalue);
heap_item!(Userdata, Userdata);

impl HeapItem for Coroutine {
    const KIND: ObjectKind = ObjectKind::Thread;

    #[inline]
    fn into_object(self) -> HeapObject {
        HeapObject::Thread(Box::new(self))
    }

    #[inline]
    fn from_object(object: &HeapObject) -> Option<&Self> {
        match object {
            HeapObject::Thread(thread) => Some(thread),
            _ => None,
        }
    }

    #[inline]
    fn from_object_mut(object: &mut HeapObject) -> Option<&mut Self> {
        match object {
            HeapObject::Thread(thread) => Some(thread),
            _ => None,
        }
    }
}
