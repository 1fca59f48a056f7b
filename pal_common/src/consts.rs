//! Shared memory geometry constants.
//!
//! These constants are the defaults for the PAL shared memory allocator.
//! They are the single source of truth - the allocator crate and its
//! configuration defaults import from here.

use static_assertions::const_assert;

/// Default size of one shared memory segment in bytes (256 KiB).
pub const SEGMENT_SIZE: u32 = 0x40000;

/// Hard upper bound on the number of segments.
///
/// The segment index occupies the high byte of a `ShmPtr`, so no more than
/// 256 segments can ever be addressed.
pub const MAX_SEGMENTS: u32 = 256;

/// Largest byte offset representable in the low 24 bits of a `ShmPtr`.
pub const MAX_SEGMENT_OFFSET: u32 = 0x00FF_FFFF;

/// Classic Win32 path limit, in UTF-16 code units.
pub const MAX_PATH: u32 = 260;

/// Alignment of every pool start and block size.
pub const POOL_ALIGNMENT: u32 = 8;

/// Number of fixed block-size classes.
pub const POOL_CLASS_COUNT: usize = 4;

/// Default block sizes, smallest first.
///
/// The last class holds a NUL-terminated UTF-16 path of `MAX_PATH` units.
pub const DEFAULT_BLOCK_SIZES: [u32; POOL_CLASS_COUNT] =
    [16, 32, 64, round_up((MAX_PATH + 1) * 2, POOL_ALIGNMENT)];

/// Default number of spin iterations between two holder liveness probes.
pub const LIVENESS_CHECK_INTERVAL: u32 = 8;

/// Length of the segment name suffix stored in each segment header.
pub const SEGMENT_NAME_LEN: usize = 16;

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

const_assert!(SEGMENT_SIZE <= MAX_SEGMENT_OFFSET);
const_assert!(MAX_SEGMENTS <= 256);
const_assert!(LIVENESS_CHECK_INTERVAL.is_power_of_two());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_size_is_256k() {
        assert_eq!(SEGMENT_SIZE, 256 * 1024);
    }

    #[test]
    fn test_long_path_class() {
        assert_eq!(DEFAULT_BLOCK_SIZES[POOL_CLASS_COUNT - 1], 528);
        assert!(DEFAULT_BLOCK_SIZES.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(522, 8), 528);
    }
}
