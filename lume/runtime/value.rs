use std::fmt;

use crate::gc::{GcPtr, ObjectId};

use super::{
    coroutine::Coroutine, error::ConversionError, function::Closure, string::LuaString,
    table::Table, userdata::Userdata,
};

/// A Lua value.
///
/// Values are `Copy`. Heap-backed variants hold a handle, not ownership: the object stays alive
/// only while the collector can reach it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    /// Opaque pointer-sized value that the collector never traces
    LightUserdata(usize),
    Number(f64),
    String(GcPtr<LuaString>),
    Table(GcPtr<Table>),
    Function(GcPtr<Closure>),
    Userdata(GcPtr<Userdata>),
    Thread(GcPtr<Coroutine>),
}

/// Basic type of a value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Boolean,
    LightUserdata,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}

impl ValueKind {
    /// Number of basic types
    pub const COUNT: usize = 9;

    pub const ALL: [ValueKind; ValueKind::COUNT] = [
        ValueKind::Nil,
        ValueKind::Boolean,
        ValueKind::LightUserdata,
        ValueKind::Number,
        ValueKind::String,
        ValueKind::Table,
        ValueKind::Function,
        ValueKind::Userdata,
        ValueKind::Thread,
    ];

    /// Name of the type as reported by `type()`
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Boolean => "boolean",
            ValueKind::LightUserdata | ValueKind::Userdata => "userdata",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Table => "table",
            ValueKind::Function => "function",
            ValueKind::Thread => "thread",
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    #[inline]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::LightUserdata(_) => ValueKind::LightUserdata,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Table(_) => ValueKind::Table,
            Value::Function(_) => ValueKind::Function,
            Value::Userdata(_) => ValueKind::Userdata,
            Value::Thread(_) => ValueKind::Thread,
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Only nil and false are falsy
    #[inline]
    pub fn is_falsy(&self) -> bool {
        matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Whether this value refers to a heap object
    #[inline]
    pub fn is_collectable(&self) -> bool {
        self.object_id().is_some()
    }

    /// The heap object referenced by this value, if any
    #[inline]
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Value::String(ptr) => Some(ptr.id()),
            Value::Table(ptr) => Some(ptr.id()),
            Value::Function(ptr) => Some(ptr.id()),
            Value::Userdata(ptr) => Some(ptr.id()),
            Value::Thread(ptr) => Some(ptr.id()),
            Value::Nil | Value::Boolean(_) | Value::LightUserdata(_) | Value::Number(_) => None,
        }
    }

    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(*number),
            _ => None,
        }
    }

    #[inline]
    pub fn as_table(&self) -> Option<GcPtr<Table>> {
        match self {
            Value::Table(table) => Some(*table),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string(&self) -> Option<GcPtr<LuaString>> {
        match self {
            Value::String(string) => Some(*string),
            _ => None,
        }
    }

    pub fn to_number(&self) -> Result<f64, ConversionError> {
        match self {
            Value::Number(number) => Ok(*number),
            _ => Err(ConversionError::NotANumber { from: self.kind() }),
        }
    }

    /// Convert to an integer type, refusing fractional numbers and numbers outside the range of
    /// the target type.
    pub fn to_integer<T: TryFrom<i64>>(&self) -> Result<T, ConversionError> {
        let number = self.to_number()?;
        if !number.is_finite() || number.fract() != 0.0 {
            return Err(ConversionError::NotAnInteger(number));
        }

        // 2^63 is the first float past the range of i64
        if number < i64::MIN as f64 || number >= 9_223_372_036_854_775_808.0 {
            return Err(ConversionError::OutOfRange {
                value: number,
                target: core::any::type_name::<T>(),
            });
        }

        T::try_from(number as i64).map_err(|_| ConversionError::OutOfRange {
            value: number,
            target: core::any::type_name::<T>(),
        })
    }

    /// The integer this number is equal to, if any. Used for array indexing.
    #[inline]
    pub(crate) fn as_array_index(&self) -> Option<usize> {
        match self {
            Value::Number(number) if *number >= 1.0 && number.fract() == 0.0 => {
                let index = *number as usize;
                if index as f64 == *number {
                    Some(index)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

macro_rules! impl_try_from_value {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<Value> for $ty {
                type Error = ConversionError;

                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    value.to_integer()
                }
            }
        )*
    };
}

impl_try_from_value!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl TryFrom<Value> for f64 {
    type Error = ConversionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.to_number()
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value as f64)
    }
}

impl From<GcPtr<LuaString>> for Value {
    fn from(value: GcPtr<LuaString>) -> Self {
        Value::String(value)
    }
}

impl From<GcPtr<Table>> for Value {
    fn from(value: GcPtr<Table>) -> Self {
        Value::Table(value)
    }
}

impl From<GcPtr<Closure>> for Value {
    fn from(value: GcPtr<Closure>) -> Self {
        Value::Function(value)
    }
}

impl From<GcPtr<Userdata>> for Value {
    fn from(value: GcPtr<Userdata>) -> Self {
        Value::Userdata(value)
    }
}

impl From<GcPtr<Coroutine>> for Value {
    fn from(value: GcPtr<Coroutine>) -> Self {
        Value::Thread(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falsy_values() {
        assert!(Value::Nil.is_falsy());
        assert!(Value::Boolean(false).is_falsy());
        assert!(!Value::Boolean(true).is_falsy());
        assert!(!Value::Number(0.0).is_falsy());
    }

    #[test]
    fn test_integer_conversion() {
        assert_eq!(i32::try_from(Value::Number(42.0)), Ok(42));
        assert_eq!(
            i32::try_from(Value::Number(1.5)),
            Err(ConversionError::NotAnInteger(1.5))
        );
        assert!(matches!(
            u8::try_from(Value::Number(300.0)),
            Err(ConversionError::OutOfRange { value, .. }) if value == 300.0
        ));
        assert!(matches!(
            u32::try_from(Value::Number(-1.0)),
            Err(ConversionError::OutOfRange { .. })
        ));
        assert_eq!(
            i64::try_from(Value::Boolean(true)),
            Err(ConversionError::NotANumber { from: ValueKind::Boolean })
        );
        assert!(matches!(
            i64::try_from(Value::Number(f64::INFINITY)),
            Err(ConversionError::NotAnInteger(_))
        ));
    }

    #[test]
    fn test_array_index() {
        assert_eq!(Value::Number(3.0).as_array_index(), Some(3));
        assert_eq!(Value::Number(0.0).as_array_index(), None);
        assert_eq!(Value::Number(2.5).as_array_index(), None);
        assert_eq!(Value::Boolean(true).as_array_index(), None);
    }

    #[test]
    fn test_non_heap_values_have_no_object() {
        assert_eq!(Value::LightUserdata(0xdead).object_id(), None);
        assert_eq!(Value::Number(1.0).object_id(), None);
        assert_eq!(Value::LightUserdata(1).kind().name(), "userdata");
    }
}
