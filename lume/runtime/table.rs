use std::{
    hash::{Hash, Hasher},
    mem::{discriminant, size_of},
};

use hashbrown::HashMap;

use crate::gc::{GcPtr, GcVisitor};

use super::{
    error::{InvalidKeyKind, LuaError, LuaResult},
    value::Value,
};

/// A value usable as a table key: anything except nil and NaN.
///
/// Keys compare with raw equality. Negative zero is stored as zero so both find the same entry.
#[derive(Clone, Copy, Debug)]
pub struct TableKey(Value);

impl TableKey {
    pub fn new(value: Value) -> LuaResult<TableKey> {
        match value {
            Value::Nil => Err(LuaError::InvalidKey(InvalidKeyKind::Nil)),
            Value::Number(number) if number.is_nan() => {
                Err(LuaError::InvalidKey(InvalidKeyKind::NaN))
            }
            Value::Number(number) if number == 0.0 => Ok(TableKey(Value::Number(0.0))),
            _ => Ok(TableKey(value)),
        }
    }

    #[inline]
    pub fn value(&self) -> Value {
        self.0
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

// NaN is never a key, so equality is reflexive
impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        discriminant(&self.0).hash(state);
        match self.0 {
            Value::Nil => {}
            Value::Boolean(boolean) => boolean.hash(state),
            Value::LightUserdata(pointer) => pointer.hash(state),
            Value::Number(number) => number.to_bits().hash(state),
            Value::String(ptr) => ptr.hash(state),
            Value::Table(ptr) => ptr.hash(state),
            Value::Function(ptr) => ptr.hash(state),
            Value::Userdata(ptr) => ptr.hash(state),
            Value::Thread(ptr) => ptr.hash(state),
        }
    }
}

/// A Lua table with an array part for keys `1..=n` and a hash part for everything else.
pub struct Table {
    array: Vec<Value>,
    hash: HashMap<TableKey, Value>,
    metatable: Option<GcPtr<Table>>,
}

/// Bytes accounted per array or hash slot
pub(crate) const SLOT_SIZE: usize = size_of::<(TableKey, Value)>();

impl Table {
    pub fn new() -> Table {
        Table::with_capacity(0, 0)
    }

    pub fn with_capacity(array: usize, hash: usize) -> Table {
        Table {
            array: Vec::with_capacity(array),
            hash: HashMap::with_capacity(hash),
            metatable: None,
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

    pub fn get(&self, key: &Value) -> Value {
        if let Some(index) = key.as_array_index() {
            if index <= self.array.len() {
                return self.array[index - 1];
            }
        }

        match TableKey::new(*key) {
            Ok(key) => self.hash.get(&key).copied().unwrap_or_default(),
            Err(_) => Value::Nil,
        }
    }

    /// Whether storing a non-nil value under `key` adds a new slot
    pub(crate) fn is_new_slot(&self, key: &Value, value: &Value) -> bool {
        if value.is_nil() {
            return false;
        }

        if let Some(index) = key.as_array_index() {
            if index <= self.array.len() {
                return false;
            }
        }

        match TableKey::new(*key) {
            Ok(key) => !self.hash.contains_key(&key),
            Err(_) => false,
        }
    }

    /// Raw assignment without metamethods or write barrier.
    pub(crate) fn set(&mut self, key: Value, value: Value) -> LuaResult<()> {
        let table_key = TableKey::new(key)?;

        if let Some(index) = key.as_array_index() {
            if index <= self.array.len() {
                self.array[index - 1] = value;
                return Ok(());
            }

            if index == self.array.len() + 1 && !value.is_nil() {
                self.hash.remove(&table_key);
                self.array.push(value);
                self.migrate_to_array();
                return Ok(());
            }
        }

        if value.is_nil() {
            self.hash.remove(&table_key);
        } else {
            self.hash.insert(table_key, value);
        }

        Ok(())
    }

    /// Move keys that now continue the array part out of the hash part
    fn migrate_to_array(&mut self) {
        loop {
            let next = Value::Number((self.array.len() + 1) as f64);
            let Ok(key) = TableKey::new(next) else {
                return;
            };

            match self.hash.remove(&key) {
                Some(value) => self.array.push(value),
                None => return,
            }
        }
    }

    /// A border of the table: an index `n` where `t[n]` is non-nil and `t[n + 1]` is nil, or
    /// zero if `t[1]` is nil.
    pub fn length(&self) -> usize {
        let len = self.array.len();
        if len > 0 && self.array[len - 1].is_nil() {
            // Binary search for a border inside the array part
            let (mut low, mut high) = (0, len);
            while high - low > 1 {
                let mid = (low + high) / 2;
                if self.array[mid - 1].is_nil() {
                    high = mid;
                } else {
                    low = mid;
                }
            }

            return low;
        }

        if self.hash.is_empty() {
            return len;
        }

        let mut border = len;
        while !self.get(&Value::Number((border + 1) as f64)).is_nil() {
            border += 1;
        }

        border
    }

    /// Number of non-nil entries
    pub fn count(&self) -> usize {
        self.array.iter().filter(|value| !value.is_nil()).count() + self.hash.len()
    }

    /// Iterate over all non-nil entries
    pub fn pairs(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.is_nil())
            .map(|(i, value)| (Value::Number((i + 1) as f64), *value));
        let hash = self.hash.iter().map(|(key, value)| (key.value(), *value));

        array.chain(hash)
    }

    pub fn heap_size(&self) -> usize {
        size_of::<Table>() + (self.array.len() + self.hash.len()) * SLOT_SIZE
    }

    pub fn visit_pointers(&self, visitor: &mut impl GcVisitor) {
        visitor.visit_opt(self.metatable);
        self.visit_entries(visitor, true, true);
    }

    /// Visit the keys and/or values of every entry
    pub(crate) fn visit_entries(
        &self,
        visitor: &mut impl GcVisitor,
        visit_keys: bool,
        visit_values: bool,
    ) {
        if visit_values {
            for value in &self.array {
                visitor.visit_value(value);
            }
        }

        for (key, value) in &self.hash {
            if visit_keys {
                visitor.visit_value(&key.0);
            }
            if visit_values {
                visitor.visit_value(value);
            }
        }
    }

    /// Remove entries whose key or value is cleared. `is_cleared` receives each value along with
    /// whether it is a key.
    ///
    /// Array entries are only ever cleared through their values, and only in tables with weak
    /// values.
    pub(crate) fn clear_entries(
        &mut self,
        weak_values: bool,
        mut is_cleared: impl FnMut(&Value, bool) -> bool,
    ) {
        if weak_values {
            for value in &mut self.array {
                if is_cleared(value, false) {
                    *value = Value::Nil;
                }
            }
        }

        self.hash
            .retain(|key, value| !is_cleared(&key.0, true) && !is_cleared(value, false));
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn test_invalid_keys() {
        let mut table = Table::new();
        assert_eq!(
            table.set(Value::Nil, num(1.0)),
            Err(LuaError::InvalidKey(InvalidKeyKind::Nil))
        );
        assert_eq!(
            table.set(num(f64::NAN), num(1.0)),
            Err(LuaError::InvalidKey(InvalidKeyKind::NaN))
        );
        assert_eq!(table.get(&Value::Nil), Value::Nil);
    }

    #[test]
    fn test_negative_zero_key() {
        let mut table = Table::new();
        table.set(num(-0.0), Value::Boolean(true)).unwrap();
        assert_eq!(table.get(&num(0.0)), Value::Boolean(true));
    }

    #[test]
    fn test_hash_keys_migrate_to_array() {
        let mut table = Table::new();
        table.set(num(3.0), num(30.0)).unwrap();
        table.set(num(2.0), num(20.0)).unwrap();
        assert_eq!(table.array.len(), 0);

        table.set(num(1.0), num(10.0)).unwrap();
        assert_eq!(table.array.len(), 3);
        assert!(table.hash.is_empty());
        assert_eq!(table.get(&num(3.0)), num(30.0));
        assert_eq!(table.length(), 3);
    }

    #[test]
    fn test_length_with_holes() {
        let mut table = Table::new();
        for i in 1..=8 {
            table.set(num(i as f64), num(i as f64)).unwrap();
        }
        table.set(num(8.0), Value::Nil).unwrap();
        assert_eq!(table.length(), 7);

        table.set(num(1.0), Value::Nil).unwrap();
        let border = table.length();
        assert!(border == 0 || !table.get(&num(border as f64)).is_nil());
        assert!(table.get(&num((border + 1) as f64)).is_nil());
    }

    #[test]
    fn test_clear_entries_skips_array_without_weak_values() {
        let mut table = Table::new();
        table.set(num(1.0), Value::Boolean(true)).unwrap();
        table.set(Value::Boolean(false), Value::Boolean(true)).unwrap();

        table.clear_entries(false, |value, _| *value == Value::Boolean(true));
        assert_eq!(table.get(&num(1.0)), Value::Boolean(true));
        assert_eq!(table.get(&Value::Boolean(false)), Value::Nil);

        table.clear_entries(true, |value, _| *value == Value::Boolean(true));
        assert_eq!(table.get(&num(1.0)), Value::Nil);
    }

    #[test]
    fn test_slot_accounting() {
        let mut table = Table::new();
        let base = table.heap_size();
        assert!(table.is_new_slot(&num(1.0), &num(1.0)));
        table.set(num(1.0), num(1.0)).unwrap();
        table.set(Value::Boolean(true), num(2.0)).unwrap();
        assert_eq!(table.heap_size(), base + 2 * SLOT_SIZE);

        assert!(!table.is_new_slot(&num(1.0), &num(5.0)));
        assert!(!table.is_new_slot(&num(9.0), &Value::Nil));

        table.set(Value::Boolean(true), Value::Nil).unwrap();
        assert_eq!(table.heap_size(), base + SLOT_SIZE);
        assert_eq!(table.count(), 1);
    }
}
