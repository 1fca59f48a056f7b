//! Prelude module for common re-exports.
//!
//! ```rust
//! use pal_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel};

// ─── Segment Geometry ───────────────────────────────────────────────
pub use crate::consts::{
    DEFAULT_BLOCK_SIZES, LIVENESS_CHECK_INTERVAL, MAX_SEGMENT_OFFSET, MAX_SEGMENTS,
    POOL_ALIGNMENT, POOL_CLASS_COUNT, SEGMENT_SIZE,
};
