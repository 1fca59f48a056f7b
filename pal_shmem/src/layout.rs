//! In-segment header structures.
//!
//! Every segment starts with a [`SegmentHeader`]. Segment 0 instead starts
//! with a [`FirstHeader`], which embeds the plain header and adds the global
//! state: the spinlock word, the pool records and the info slots.
//!
//! All structs are `#[repr(C)]` with fixed-size fields only so that every
//! process mapping the same file sees the same layout.

use crate::shmptr::ShmPtr;
use pal::consts::{POOL_ALIGNMENT, POOL_CLASS_COUNT, SEGMENT_NAME_LEN, round_up};
use static_assertions::const_assert_eq;
use std::sync::atomic::AtomicU32;

/// Per-segment header.
///
/// `first_pool_blocks[c]..=last_pool_blocks[c]` is the contiguous range of
/// class `c` blocks carved out of this segment. `next_segment` names the
/// file of the following segment in file-backed deployments (NUL = none).
#[repr(C)]
pub struct SegmentHeader {
    /// Name suffix of the next segment, NUL-padded.
    pub next_segment: [u8; SEGMENT_NAME_LEN],
    /// First block of each size class in this segment.
    pub first_pool_blocks: [ShmPtr; POOL_CLASS_COUNT],
    /// Last block of each size class in this segment.
    pub last_pool_blocks: [ShmPtr; POOL_CLASS_COUNT],
}

/// Free-list record for one size class, spanning all segments.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PoolInfo {
    /// Size of one block in bytes.
    pub item_size: u32,
    /// Total number of blocks.
    pub num_items: u32,
    /// Number of blocks currently on the free list.
    pub free_items: u32,
    /// Head of the intrusive free list (null when empty).
    pub first_free: ShmPtr,
}

/// Well-known anchors stored in segment 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ShmInfoId {
    /// Per-process bookkeeping list.
    ProcessInfo = 0,
    /// Head of the named-object directory.
    NamedObjects = 1,
    /// Head of the shared file-lock list.
    FileLocks = 2,
}

impl ShmInfoId {
    /// Number of info slots.
    pub const COUNT: usize = 3;

    /// Convert from raw `u32` value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::ProcessInfo),
            1 => Some(Self::NamedObjects),
            2 => Some(Self::FileLocks),
            _ => None,
        }
    }
}

/// Header of segment 0.
#[repr(C)]
pub struct FirstHeader {
    /// Plain per-segment header.
    pub header: SegmentHeader,
    /// Cross-process spinlock word: 0 or the holder's PID.
    pub spinlock: AtomicU32,
    /// Global pool records, one per size class.
    pub pools: [PoolInfo; POOL_CLASS_COUNT],
    /// Info slots, indexed by [`ShmInfoId`].
    pub shm_info: [ShmPtr; ShmInfoId::COUNT],
}

const_assert_eq!(core::mem::size_of::<ShmPtr>(), 4);
const_assert_eq!(core::mem::size_of::<PoolInfo>(), 16);
const_assert_eq!(core::mem::size_of::<SegmentHeader>(), SEGMENT_NAME_LEN + 8 * POOL_CLASS_COUNT);

/// Offset of the first pool in segment 0.
pub const FIRST_POOL_OFFSET: u32 =
    round_up(core::mem::size_of::<FirstHeader>() as u32, POOL_ALIGNMENT);

/// Offset of the first pool in every other segment.
pub const SEGMENT_POOL_OFFSET: u32 =
    round_up(core::mem::size_of::<SegmentHeader>() as u32, POOL_ALIGNMENT);

/// Smallest offset a block may have in `segment`.
#[inline]
pub const fn pool_offset(segment: u8) -> u32 {
    if segment == 0 {
        FIRST_POOL_OFFSET
    } else {
        SEGMENT_POOL_OFFSET
    }
}

/// Size of each class' sub-region in segment 0.
///
/// Segment 0 is split evenly between the classes, each share rounded down
/// to the pool alignment.
#[inline]
pub const fn first_segment_pool_size(segment_size: u32) -> u32 {
    if segment_size <= FIRST_POOL_OFFSET {
        return 0;
    }
    ((segment_size - FIRST_POOL_OFFSET) / POOL_CLASS_COUNT as u32) & !(POOL_ALIGNMENT - 1)
}
