//! Deduplicating string storage for command names.

use std::collections::HashMap;

/// Handle to an interned string. `StringId::NULL` is the empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StringId(pub u32);

impl StringId {
    pub const NULL: StringId = StringId(0);
}

pub trait StringInterner {
    fn intern(&mut self, bytes: &[u8]) -> StringId;
}

/// Append-only string pool. Ids are never reused and strings never change, so
/// an id handed out once stays valid for the life of the pool.
#[derive(Debug)]
pub struct StringPool {
    strings: Vec<Box<str>>,
    /// Keyed on the raw bytes so comms that only differ in invalid UTF-8
    /// stay distinct.
    index: HashMap<Box<[u8]>, StringId>,
}

impl StringPool {
    pub fn new() -> Self {
        let mut index = HashMap::new();
        index.insert(Box::<[u8]>::from(&b""[..]), StringId::NULL);
        Self {
            strings: vec![Box::from("")],
            index,
        }
    }

    pub fn get(&self, id: StringId) -> Option<&str> {
        self.strings.get(id.0 as usize).map(|s| &**s)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        // The null string is always present.
        false
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringInterner for StringPool {
    /// Kernel comm fields are ASCII; anything else is displayed lossily.
    fn intern(&mut self, bytes: &[u8]) -> StringId {
        if let Some(id) = self.index.get(bytes) {
            return *id;
        }
        let id = StringId(self.strings.len() as u32);
        self.strings
            .push(String::from_utf8_lossy(bytes).into_owned().into_boxed_str());
        self.index.insert(bytes.into(), id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedups() {
        let mut pool = StringPool::new();
        let a = pool.intern(b"swapper/0");
        let b = pool.intern(b"kworker/1:2");
        let c = pool.intern(b"swapper/0");

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.get(a), Some("swapper/0"));
        assert_eq!(pool.get(b), Some("kworker/1:2"));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_empty_is_null() {
        let mut pool = StringPool::new();
        assert_eq!(pool.intern(b""), StringId::NULL);
        assert_eq!(pool.get(StringId::NULL), Some(""));
        assert_eq!(pool.get(StringId(42)), None);
    }

    #[test]
    fn test_invalid_utf8_stays_distinct() {
        let mut pool = StringPool::new();
        let a = pool.intern(b"comm\xff");
        let b = pool.intern(b"comm\xfe");

        assert_ne!(a, b);
        assert_eq!(pool.intern(b"comm\xff"), a);
        // Both render the same once made printable.
        assert_eq!(pool.get(a), Some("comm\u{fffd}"));
        assert_eq!(pool.get(b), Some("comm\u{fffd}"));
        assert_eq!(pool.len(), 3);
        assert!(!pool.is_empty());
    }
}
