//! Pool usage statistics and allocation waste accounting

use crate::error::ShmResult;
use crate::layout::PoolInfo;
use pal::consts::POOL_CLASS_COUNT;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::debug;

/// Snapshot of one size class: the global pool record plus this
/// process' allocation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Block size of the class
    pub block_size: u32,
    /// Blocks carved out across all segments
    pub num_items: u32,
    /// Blocks currently free
    pub free_items: u32,
    /// Allocations served by this process
    pub allocations: u64,
    /// Bytes wasted by this process' allocations
    pub wasted_bytes: u64,
}

impl PoolStats {
    /// Combine a pool record with the matching waste counters.
    pub fn new(pool: &PoolInfo, waste: &ClassWaste) -> Self {
        Self {
            block_size: pool.item_size,
            num_items: pool.num_items,
            free_items: pool.free_items,
            allocations: waste.allocations,
            wasted_bytes: waste.wasted_bytes,
        }
    }

    /// Blocks currently handed out.
    #[inline]
    pub fn used_items(&self) -> u32 {
        self.num_items - self.free_items
    }

    /// Bytes currently handed out.
    #[inline]
    pub fn used_bytes(&self) -> u64 {
        self.used_items() as u64 * self.block_size as u64
    }
}

/// Waste accumulated by one size class in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassWaste {
    /// Block size of the class
    pub block_size: u32,
    /// Allocations served by the class
    pub allocations: u64,
    /// Bytes requested below the block size, summed
    pub wasted_bytes: u64,
}

impl ClassWaste {
    /// Average waste per allocation.
    pub fn average(&self) -> u64 {
        self.wasted_bytes.checked_div(self.allocations).unwrap_or(0)
    }
}

/// Per-process waste summary, appended to the waste log at cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasteReport {
    /// Reporting process
    pub pid: u32,
    /// Time of the report
    pub timestamp: SystemTime,
    /// One entry per size class
    pub classes: Vec<ClassWaste>,
}

impl WasteReport {
    /// Append the report as one JSON line.
    pub fn append_to(&self, path: &Path) -> ShmResult<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(self)?;
        writeln!(file, "{line}")?;
        debug!(path = %path.display(), "waste report written");
        Ok(())
    }
}

/// Lock-free per-class allocation counters.
#[derive(Debug, Default)]
pub struct WasteTracker {
    allocations: [AtomicU64; POOL_CLASS_COUNT],
    wasted: [AtomicU64; POOL_CLASS_COUNT],
}

impl WasteTracker {
    /// Record one allocation of `requested` bytes from a `block_size` block.
    #[inline]
    pub fn record(&self, class: usize, block_size: u32, requested: usize) {
        let waste = (block_size as u64).saturating_sub(requested as u64);
        self.allocations[class].fetch_add(1, Ordering::Relaxed);
        self.wasted[class].fetch_add(waste, Ordering::Relaxed);
    }

    /// Current counters.
    pub fn snapshot(&self, block_sizes: &[u32; POOL_CLASS_COUNT]) -> Vec<ClassWaste> {
        block_sizes
            .iter()
            .enumerate()
            .map(|(class, &block_size)| ClassWaste {
                block_size,
                allocations: self.allocations[class].load(Ordering::Relaxed),
                wasted_bytes: self.wasted[class].load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Build a report for `pid`.
    pub fn report(&self, pid: u32, block_sizes: &[u32; POOL_CLASS_COUNT]) -> WasteReport {
        WasteReport {
            pid,
            timestamp: SystemTime::now(),
            classes: self.snapshot(block_sizes),
        }
    }
}
