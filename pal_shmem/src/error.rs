//! Error types for shared memory operations

use crate::shmptr::ShmPtr;
use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Zero-byte allocation requested
    #[error("Requested a 0-byte shared memory block")]
    ZeroSize,

    /// Request exceeds the largest size class
    #[error("Requested {size} bytes; largest block size is {max}")]
    TooLarge {
        /// Requested size in bytes
        size: usize,
        /// Largest block size
        max: u32,
    },

    /// No more segments can be created
    #[error("Maximum number of segments ({max}) reached")]
    SegmentLimit {
        /// Configured segment limit
        max: u32,
    },

    /// Growing a size class could not produce any block
    #[error("Segment of {segment_size} bytes cannot hold one block of every size class")]
    SegmentTooSmall {
        /// Configured segment size
        segment_size: u32,
    },

    /// The OS refused to map a segment
    #[error("Failed to map shared memory segment: {source}")]
    MapFailed {
        /// Source IO error
        source: std::io::Error,
    },

    /// Handle does not designate a block of this allocator
    #[error("Invalid shared memory pointer {ptr}")]
    InvalidPointer {
        /// Offending handle
        ptr: ShmPtr,
    },

    /// Handle refers to a segment this process cannot map
    #[error("Segment {segment} is unknown to this process")]
    UnknownSegment {
        /// Segment index
        segment: u8,
    },

    /// Free-list head and free count disagree
    #[error("Free list of the {item_size}-byte pool is corrupted")]
    PoolCorrupted {
        /// Block size of the pool
        item_size: u32,
    },

    /// Lock guard passed in belongs to another context
    #[error("Lock guard does not belong to this shared memory context")]
    ForeignGuard,

    /// Data does not fit in the block
    #[error("{len} bytes do not fit in a {block_size}-byte block")]
    BlockOverflow {
        /// Requested length
        len: usize,
        /// Size of the target block
        block_size: u32,
    },

    /// String has no terminator inside its block
    #[error("String at {ptr} is not terminated within its block")]
    Unterminated {
        /// Handle of the string
        ptr: ShmPtr,
    },

    /// A named object with this name is already registered
    #[error("A named object with this name already exists")]
    NameInUse,

    /// Invalid configuration
    #[error("Invalid shared memory configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
