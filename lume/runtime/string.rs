use std::{borrow::Cow, fmt, mem::size_of};

use crate::gc::GcVisitor;

/// An immutable, interned byte string.
///
/// Two strings with equal contents are the same object, so strings compare by handle.
pub struct LuaString {
    bytes: Box<[u8]>,
    hash: u32,
}

impl LuaString {
    pub fn new(bytes: &[u8]) -> LuaString {
        LuaString { bytes: bytes.into(), hash: hash_bytes(bytes) }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn to_str_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Bytes accounted to a string of the given length, including the terminator slot
    #[inline]
    pub fn size_for_len(len: usize) -> usize {
        size_of::<LuaString>() + len + 1
    }

    pub fn heap_size(&self) -> usize {
        Self::size_for_len(self.bytes.len())
    }

    /// Strings hold no references
    #[inline]
    pub fn visit_pointers(&self, _visitor: &mut impl GcVisitor) {}
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_str_lossy())
    }
}

/// Hash of a byte string. Long strings are sampled, hashing at most 32 bytes or so.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut hash = len as u32;
    let step = (len >> 5) + 1;

    let mut i = len;
    while i >= step {
        hash ^= (hash << 5)
            .wrapping_add(hash >> 2)
            .wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }

    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_content_based() {
        assert_eq!(hash_bytes(b"hello"), hash_bytes(b"hello"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"hellp"));
        assert_eq!(hash_bytes(b""), 0);
    }

    #[test]
    fn test_long_strings_are_sampled() {
        let long = vec![b'x'; 1000];
        let mut other = long.clone();
        // Step is 32 for this length, so byte 998 is not sampled
        other[998] = b'y';
        assert_eq!(hash_bytes(&long), hash_bytes(&other));
        assert_eq!(LuaString::new(&long).len(), 1000);
    }
}
