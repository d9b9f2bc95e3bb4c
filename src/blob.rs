//! Shared, immutable views over trace bytes.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// A window into a reference counted byte buffer.
///
/// Slicing never copies, so a verbose ftrace event can be handed to the sorter
/// as a sub-view of its bundle and outlive the tokenizer call that produced it.
#[derive(Clone)]
pub struct TraceBlobView {
    blob: Arc<[u8]>,
    range: Range<usize>,
}

impl TraceBlobView {
    pub fn data(&self) -> &[u8] {
        &self.blob[self.range.clone()]
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Sub-view of `len` bytes starting `offset` bytes into this view.
    pub fn slice(&self, offset: usize, len: usize) -> Option<TraceBlobView> {
        let start = self.range.start.checked_add(offset)?;
        let end = start.checked_add(len)?;
        if end > self.range.end {
            return None;
        }
        Some(TraceBlobView {
            blob: Arc::clone(&self.blob),
            range: start..end,
        })
    }
}

impl From<Vec<u8>> for TraceBlobView {
    fn from(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        TraceBlobView {
            blob: bytes.into(),
            range: 0..len,
        }
    }
}

impl From<&[u8]> for TraceBlobView {
    fn from(bytes: &[u8]) -> Self {
        TraceBlobView {
            blob: bytes.into(),
            range: 0..bytes.len(),
        }
    }
}

impl PartialEq for TraceBlobView {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

impl Eq for TraceBlobView {}

impl fmt::Debug for TraceBlobView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceBlobView")
            .field("offset", &self.range.start)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_shares_buffer() {
        let view = TraceBlobView::from(vec![0u8, 1, 2, 3, 4, 5]);
        let inner = view.slice(2, 3).unwrap();
        assert_eq!(inner.data(), &[2, 3, 4]);

        let nested = inner.slice(1, 2).unwrap();
        assert_eq!(nested.data(), &[3, 4]);
        assert!(Arc::ptr_eq(&view.blob, &nested.blob));
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let view = TraceBlobView::from(vec![0u8; 4]);
        assert!(view.slice(2, 3).is_none());
        assert!(view.slice(usize::MAX, 2).is_none());
        assert!(view.slice(4, 0).unwrap().is_empty());
    }
}
