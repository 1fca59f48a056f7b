//! Segment-relative shared memory handles.
//!
//! A [`ShmPtr`] is a 32-bit value: the high byte is the segment index, the
//! low 24 bits are the byte offset inside that segment. It stays meaningful
//! across address spaces and must be resolved through
//! [`ShmContext::ptr_to_ptr`](crate::ShmContext::ptr_to_ptr) before use.

use pal::consts::MAX_SEGMENT_OFFSET;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to a block in shared memory. `0` is the null handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ShmPtr(u32);

impl ShmPtr {
    /// The universal null handle.
    pub const NULL: ShmPtr = ShmPtr(0);

    /// Build a handle from a segment index and an offset.
    ///
    /// Offsets wider than 24 bits are truncated.
    #[inline]
    pub const fn new(segment: u8, offset: u32) -> Self {
        Self(((segment as u32) << 24) | (offset & MAX_SEGMENT_OFFSET))
    }

    /// Reinterpret a raw 32-bit value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw 32-bit value, as stored in link words.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Segment index (high byte).
    #[inline]
    pub const fn segment(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Byte offset inside the segment (low 24 bits).
    #[inline]
    pub const fn offset(self) -> u32 {
        self.0 & MAX_SEGMENT_OFFSET
    }

    /// True for the null handle.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Handle `bytes` further into the same segment.
    #[inline]
    pub(crate) const fn add(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for ShmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShmPtr({:#010x})", self.0)
    }
}

impl fmt::Display for ShmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
