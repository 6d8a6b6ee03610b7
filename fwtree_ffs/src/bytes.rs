//! Shared byte views over the image buffer.
//!
//! Every tree node holds [`Bytes`] views of its header/body/tail rather
//! than copies. A view is a reference-counted slice: cloning is O(1) and
//! sub-slicing shares the same backing allocation. Decompressed payloads
//! become new backing buffers with their own views.
//!
//! Range arguments saturate to the buffer bounds, so callers can express
//! "the rest of the buffer" without pre-clamping.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// A cheap view into a shared byte buffer.
#[derive(Clone)]
pub struct Bytes {
    data: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl Bytes {
    /// An empty view.
    pub fn new() -> Self {
        Self { data: Arc::from(Vec::new()), start: 0, end: 0 }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// View of the first `len` bytes (saturating).
    pub fn left(&self, len: usize) -> Self {
        self.mid(0, len)
    }

    /// View of the last `len` bytes (saturating).
    pub fn right(&self, len: usize) -> Self {
        let len = len.min(self.len());
        self.mid(self.len() - len, len)
    }

    /// View of `len` bytes starting at `start`; both saturate.
    pub fn mid(&self, start: usize, len: usize) -> Self {
        let start = self.start + start.min(self.len());
        let end = start + len.min(self.end - start);
        Self { data: Arc::clone(&self.data), start, end }
    }

    /// View of everything from `start` on.
    pub fn from_offset(&self, start: usize) -> Self {
        self.mid(start, self.len())
    }

    /// Offset of the first occurrence of `pattern` at or after `from`.
    pub fn index_of(&self, pattern: &[u8], from: usize) -> Option<usize> {
        if pattern.is_empty() || from >= self.len() {
            return None;
        }
        let slice = self.as_slice();
        slice[from..].windows(pattern.len()).position(|w| w == pattern).map(|pos| pos + from)
    }

    /// Offset of the last occurrence of `pattern`.
    pub fn last_index_of(&self, pattern: &[u8]) -> Option<usize> {
        if pattern.is_empty() {
            return None;
        }
        let slice = self.as_slice();
        slice.windows(pattern.len()).rposition(|w| w == pattern)
    }

    /// Number of bytes equal to `byte`.
    pub fn count(&self, byte: u8) -> usize {
        self.as_slice().iter().filter(|&&b| b == byte).count()
    }

    /// Whether every byte equals `byte`. True for an empty view.
    pub fn all(&self, byte: u8) -> bool {
        self.as_slice().iter().all(|&b| b == byte)
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.as_slice().starts_with(prefix)
    }

    /// Little-endian u16 at `offset`, if in bounds.
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.as_slice().get(offset..offset + 2)?;
        Some(u16::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Little-endian u32 at `offset`, if in bounds.
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.as_slice().get(offset..offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Little-endian u64 at `offset`, if in bounds.
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let bytes = self.as_slice().get(offset..offset + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Reads a `#[repr(C)]` structure at `offset`, if in bounds.
    ///
    /// Only sound for structures whose on-flash layout has no padding;
    /// every such structure in `fwtree_pi` documents that property.
    pub fn read_struct<T: Copy>(&self, offset: usize) -> Option<T> {
        let bytes = self.as_slice().get(offset..offset + core::mem::size_of::<T>())?;
        // Safety: length checked above, read_unaligned has no alignment
        // requirement, and T: Copy guarantees no drop obligations.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }
}

impl Default for Bytes {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes({:#x} bytes)", self.len())
    }
}

impl PartialEq for Bytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Bytes {}

impl From<Vec<u8>> for Bytes {
    fn from(data: Vec<u8>) -> Self {
        let data: Arc<[u8]> = Arc::from(data);
        let end = data.len();
        Self { data, start: 0, end }
    }
}

impl From<&[u8]> for Bytes {
    fn from(data: &[u8]) -> Self {
        data.to_vec().into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn views_share_backing_and_saturate() {
        let bytes = Bytes::from(vec![0u8, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(bytes.left(3).as_slice(), &[0, 1, 2]);
        assert_eq!(bytes.right(2).as_slice(), &[6, 7]);
        assert_eq!(bytes.mid(2, 3).as_slice(), &[2, 3, 4]);
        // Out-of-range arguments clamp instead of panicking.
        assert_eq!(bytes.mid(6, 100).as_slice(), &[6, 7]);
        assert_eq!(bytes.mid(100, 1).len(), 0);
        assert_eq!(bytes.left(100).len(), 8);
    }

    #[test]
    fn nested_views_stay_relative() {
        let bytes = Bytes::from(vec![9u8, 8, 7, 6, 5, 4]);
        let inner = bytes.mid(2, 3);
        assert_eq!(inner.as_slice(), &[7, 6, 5]);
        assert_eq!(inner.mid(1, 1).as_slice(), &[6]);
        assert_eq!(inner.from_offset(1).as_slice(), &[6, 5]);
    }

    #[test]
    fn search_operations() {
        let bytes = Bytes::from(b"ab_FVH__FVHx".as_slice());
        assert_eq!(bytes.index_of(b"_FVH", 0), Some(2));
        assert_eq!(bytes.index_of(b"_FVH", 3), Some(7));
        assert_eq!(bytes.index_of(b"_FVH", 8), None);
        assert_eq!(bytes.last_index_of(b"_FVH"), Some(7));
        assert_eq!(bytes.index_of(b"zz", 0), None);
    }

    #[test]
    fn count_and_all() {
        let bytes = Bytes::from(vec![0xFFu8; 16]);
        assert!(bytes.all(0xFF));
        assert_eq!(bytes.count(0xFF), 16);
        let mixed = Bytes::from(vec![0xFFu8, 0x00, 0xFF]);
        assert!(!mixed.all(0xFF));
        assert_eq!(mixed.count(0xFF), 2);
        assert!(Bytes::new().all(0xFF));
    }

    #[test]
    fn scalar_reads_are_bounds_checked() {
        let bytes = Bytes::from(vec![0x78u8, 0x56, 0x34, 0x12]);
        assert_eq!(bytes.read_u16(0), Some(0x5678));
        assert_eq!(bytes.read_u32(0), Some(0x12345678));
        assert_eq!(bytes.read_u32(1), None);
        assert_eq!(bytes.read_u64(0), None);
    }
}
