//! Shared memory allocator configuration.
//!
//! # TOML Example
//!
//! ```toml
//! segment_size = 262144
//! max_segments = 256
//! block_sizes = [16, 32, 64, 528]
//! liveness_check_interval = 8
//! log_level = "debug"
//!
//! [backing]
//! kind = "files"
//! dir = "/var/run/pal"
//! prefix = ".pal_shm"
//! ```

use crate::layout::first_segment_pool_size;
use pal::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_prefix() -> String {
    ".pal_shm".to_string()
}

/// Where segments live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SegmentBacking {
    /// Process-private anonymous mappings.
    #[default]
    Anonymous,
    /// Shared files under `dir`, discoverable by other processes.
    Files {
        /// Directory holding segment and lock files.
        dir: PathBuf,
        /// File name prefix.
        #[serde(default = "default_prefix")]
        prefix: String,
    },
}

/// Allocator configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    /// Bytes per segment.
    pub segment_size: u32,
    /// Maximum number of segments.
    pub max_segments: u32,
    /// Block size of each class, smallest first.
    pub block_sizes: [u32; POOL_CLASS_COUNT],
    /// Spin attempts between two liveness probes of the lock holder.
    pub liveness_check_interval: u32,
    /// Segment backing store.
    pub backing: SegmentBacking,
    /// File receiving a JSON waste report at cleanup.
    pub waste_log: Option<PathBuf>,
    /// Diagnostic verbosity used by [`init_tracing`](crate::init_tracing).
    pub log_level: LogLevel,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            segment_size: SEGMENT_SIZE,
            max_segments: MAX_SEGMENTS,
            block_sizes: DEFAULT_BLOCK_SIZES,
            liveness_check_interval: LIVENESS_CHECK_INTERVAL,
            backing: SegmentBacking::Anonymous,
            waste_log: None,
            log_level: LogLevel::default(),
        }
    }
}

impl ShmConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Largest block size.
    #[inline]
    pub fn largest_block(&self) -> u32 {
        self.block_sizes[POOL_CLASS_COUNT - 1]
    }

    /// Index of the smallest class able to hold `size` bytes.
    pub fn size_class(&self, size: usize) -> Option<usize> {
        self.block_sizes.iter().position(|&b| size <= b as usize)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the geometry cannot be
    /// addressed by a `ShmPtr` or cannot give every class a block.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.segment_size > MAX_SEGMENT_OFFSET {
            return invalid(format!(
                "segment_size {} does not fit a 24-bit offset",
                self.segment_size
            ));
        }
        if self.max_segments == 0 || self.max_segments > MAX_SEGMENTS {
            return invalid(format!(
                "max_segments must be in 1..={MAX_SEGMENTS}, got {}",
                self.max_segments
            ));
        }
        if self.block_sizes[0] < POOL_ALIGNMENT {
            return invalid(format!("smallest block must be at least {POOL_ALIGNMENT} bytes"));
        }
        if self.block_sizes.iter().any(|b| b % POOL_ALIGNMENT != 0) {
            return invalid(format!("block sizes must be multiples of {POOL_ALIGNMENT}"));
        }
        if self.block_sizes.windows(2).any(|w| w[0] >= w[1]) {
            return invalid("block sizes must be strictly ascending".to_string());
        }
        let pool_size = first_segment_pool_size(self.segment_size);
        if pool_size < self.largest_block() {
            return invalid(format!(
                "segment_size {} leaves {pool_size} bytes per pool, less than one {}-byte block",
                self.segment_size,
                self.largest_block()
            ));
        }
        if !self.liveness_check_interval.is_power_of_two() {
            return invalid(format!(
                "liveness_check_interval must be a power of two, got {}",
                self.liveness_check_interval
            ));
        }
        if let SegmentBacking::Files { prefix, .. } = &self.backing {
            if prefix.is_empty() || prefix.contains('/') {
                return invalid(format!("invalid segment file prefix {prefix:?}"));
            }
        }
        Ok(())
    }
}
