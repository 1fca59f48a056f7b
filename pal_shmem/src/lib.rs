//! # PAL Shared Memory Pool Allocator
//!
//! A segment-based block allocator whose state lives entirely in shared
//! memory, so that cooperating processes can hand each other handles to
//! blocks, strings and named objects.
//!
//! ## Features
//!
//! - **Position-independent handles**: a [`ShmPtr`] is a segment index plus
//!   an offset and stays valid in every process mapping the segments
//! - **Size-class pools**: four fixed block sizes, one intrusive free list
//!   each, spanning every segment
//! - **On-demand growth**: an exhausted class adds a segment whose space is
//!   shared out in proportion to current usage
//! - **Crash-tolerant locking**: a PID-tagged spinlock word whose holder is
//!   evicted when it no longer runs
//! - **Named objects**: a shared directory of named entries
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── segment 0 ─────────────────────────────┐
//! │ SegmentHeader │ spinlock │ pools[4] │ info[3] │ 16B │ 32B │ 64B │ 528B │
//! └────────────────────────────────────────────────────────────────────┘
//! ┌──────────────────────────── segment N ─────────────────────────────┐
//! │ SegmentHeader │ 16B blocks │ 32B blocks │ 64B blocks │ 528B blocks │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Free lists are threaded through the blocks: the first 4 bytes of a free
//! block hold the handle of the next one.
//!
//! ## Usage
//!
//! ```rust
//! use pal_shmem::{NamedObjectLookup, NamedObjectType, ShmConfig, ShmContext};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = ShmContext::initialize(ShmConfig::default())?;
//!
//! let ptr = ctx.allocate(24)?;
//! ctx.write_bytes(ptr, b"payload")?;
//! assert_eq!(ctx.read_bytes(ptr, 7)?, b"payload");
//! ctx.free(ptr)?;
//!
//! let name: Vec<u16> = "Global\\ready".encode_utf16().collect();
//! let event = ctx.create_named_object(&name, NamedObjectType::Event)?;
//! assert_eq!(
//!     ctx.find_named_object(&name, NamedObjectType::Event)?,
//!     NamedObjectLookup::Found(event)
//! );
//! ctx.delete_named_object(event)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sharing Between Processes
//!
//! With [`SegmentBacking::Files`] every segment is a file under one
//! directory. Processes register in a lock file; the first one creates the
//! segments, the last one to clean up removes them. Segments added by one
//! process are discovered by the others the next time they take the lock or
//! resolve a handle into them.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod error;
pub mod layout;
pub mod monitoring;
pub mod named;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod segment;
pub mod shmptr;
pub mod spinlock;

pub use config::{SegmentBacking, ShmConfig};
pub use context::{ShmContext, ShmLockGuard};
pub use error::{ShmError, ShmResult};
pub use layout::ShmInfoId;
pub use monitoring::{ClassWaste, PoolStats, WasteReport};
pub use named::{NamedObject, NamedObjectLookup, NamedObjectType};
pub use platform::{OsProcess, ProcessIdentity};
pub use shmptr::ShmPtr;

use pal::config::LogLevel;

/// Initialize tracing at `level`. `RUST_LOG` takes precedence when set.
pub fn init_tracing(level: LogLevel) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
