//! Interning table for strings
//!
//! Chained hash table keyed by string contents. The table does not keep strings alive: the
//! collector sweeps it one bucket at a time and drops entries for dead strings.

use std::mem::size_of;

use crate::gc::{GcPtr, Heap};

use super::string::LuaString;

#[derive(Clone, Copy)]
struct Entry {
    string: GcPtr<LuaString>,
    hash: u32,
}

pub struct StringTable {
    buckets: Vec<Vec<Entry>>,
    /// Number of strings in the table
    count: usize,
}

impl StringTable {
    /// Create a table with at least `size` buckets
    pub fn new(size: usize) -> StringTable {
        let size = size.max(1).next_power_of_two();
        StringTable { buckets: vec![Vec::new(); size], count: 0 }
    }

    /// Number of buckets
    #[inline]
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Number of interned strings
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Bytes accounted to a bucket array of the given size
    #[inline]
    pub fn bytes_for_size(size: usize) -> usize {
        size * size_of::<Vec<Entry>>()
    }

    #[inline]
    fn bucket_index(&self, hash: u32) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Find the string with the given contents, dead or alive
    pub fn find(&self, heap: &Heap, hash: u32, bytes: &[u8]) -> Option<GcPtr<LuaString>> {
        self.buckets[self.bucket_index(hash)]
            .iter()
            .filter(|entry| entry.hash == hash)
            .find(|entry| {
                heap.get(entry.string)
                    .is_some_and(|string| string.as_bytes() == bytes)
            })
            .map(|entry| entry.string)
    }

    pub fn insert(&mut self, string: GcPtr<LuaString>, hash: u32) {
        let index = self.bucket_index(hash);
        self.buckets[index].push(Entry { string, hash });
        self.count += 1;
    }

    /// Rehash every entry into `new_size` buckets
    pub fn resize(&mut self, new_size: usize) {
        let new_size = new_size.max(1).next_power_of_two();
        let mut buckets = vec![Vec::new(); new_size];
        for entry in self.buckets.drain(..).flatten() {
            buckets[(entry.hash as usize) & (new_size - 1)].push(entry);
        }

        self.buckets = buckets;
    }

    /// Free the dead strings of one bucket and whiten the survivors.
    ///
    /// Returns the number of strings freed.
    pub fn sweep_bucket(&mut self, index: usize, heap: &mut Heap) -> usize {
        let Some(bucket) = self.buckets.get_mut(index) else {
            return 0;
        };

        let before = bucket.len();
        bucket.retain(|entry| {
            let id = entry.string.id();
            if heap.is_dead(id) {
                heap.free(id);
                false
            } else {
                heap.make_white(id);
                true
            }
        });

        let freed = before - bucket.len();
        self.count -= freed;
        freed
    }

    /// Iterate over all interned strings
    pub fn iter(&self) -> impl Iterator<Item = GcPtr<LuaString>> + '_ {
        self.buckets.iter().flatten().map(|entry| entry.string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{object::HeapObject, string::hash_bytes};

    fn add(heap: &mut Heap, table: &mut StringTable, bytes: &[u8]) -> GcPtr<LuaString> {
        let id = heap.insert(HeapObject::String(LuaString::new(bytes)), 0);
        let string = GcPtr::from_id(id);
        table.insert(string, hash_bytes(bytes));
        string
    }

    #[test]
    fn test_find_after_resize() {
        let mut heap = Heap::new();
        let mut table = StringTable::new(4);

        let names: Vec<String> = (0..50).map(|i| format!("name{i}")).collect();
        let strings: Vec<_> = names
            .iter()
            .map(|name| add(&mut heap, &mut table, name.as_bytes()))
            .collect();

        table.resize(64);
        assert_eq!(table.size(), 64);
        assert_eq!(table.len(), 50);

        for (name, string) in names.iter().zip(&strings) {
            let found = table.find(&heap, hash_bytes(name.as_bytes()), name.as_bytes());
            assert_eq!(found, Some(*string));
        }

        assert_eq!(table.find(&heap, hash_bytes(b"missing"), b"missing"), None);
    }

    #[test]
    fn test_sweep_drops_dead_strings() {
        let mut heap = Heap::new();
        let mut table = StringTable::new(1);
        let live = add(&mut heap, &mut table, b"live");
        let dead = add(&mut heap, &mut table, b"dead");

        // Simulate the white flip at the end of a mark phase with only `live` marked
        heap.headers[live.id().index()].set_color(crate::gc::GcColor::Black);
        heap.current_white = heap.current_white.other_white();

        assert_eq!(table.sweep_bucket(0, &mut heap), 1);
        assert_eq!(table.len(), 1);
        assert!(heap.contains(live.id()));
        assert!(!heap.contains(dead.id()));
        assert_eq!(heap.color(live.id()), Some(heap.current_white()));
    }
}
