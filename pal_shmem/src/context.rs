//! Shared memory context: lifecycle, allocator and locking.
//!
//! A [`ShmContext`] owns everything a process knows about one shared memory
//! instance: the mapped segments, the in-process critical section and the
//! lock depth. Several independent contexts may live in one process.
//!
//! # Locking
//!
//! Threads of this process first enter a re-entrant critical section, then
//! only the outermost [`ShmContext::lock`] of the owning thread contends for
//! the cross-process spinlock. Every public operation pairs lock and unlock
//! internally; callers only lock explicitly to group several operations or
//! to use the info slots.
//!
//! # Examples
//!
//! ```no_run
//! use pal_shmem::{ShmConfig, ShmContext};
//! use std::ffi::CString;
//!
//! let ctx = ShmContext::initialize(ShmConfig::default())?;
//! let name = CString::new("hello").unwrap();
//! let ptr = ctx.strdup(&name)?;
//! assert_eq!(ctx.read_cstr(ptr)?, name);
//! ctx.free(ptr)?;
//! # Ok::<(), pal_shmem::ShmError>(())
//! ```

use crate::config::{SegmentBacking, ShmConfig};
use crate::error::{ShmError, ShmResult};
use crate::layout::{FirstHeader, ShmInfoId};
use crate::monitoring::{PoolStats, WasteTracker};
use crate::platform::{OsProcess, ProcessIdentity};
use crate::pool;
use crate::registry::Registry;
use crate::segment::{self, SegmentTable};
use crate::shmptr::ShmPtr;
use crate::spinlock::SpinLock;
use pal::consts::POOL_CLASS_COUNT;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info, trace, warn};

/// Per-process handle on a shared memory instance.
pub struct ShmContext {
    config: ShmConfig,
    identity: Arc<dyn ProcessIdentity>,
    pid: u32,
    table: SegmentTable,
    first: NonNull<FirstHeader>,
    critical_section: ReentrantMutex<()>,
    depth: AtomicU32,
    registry: Option<Registry>,
    waste: WasteTracker,
    detached: bool,
}

// SAFETY: `first` points into a mapping owned by `table`, which lives as long
// as the context. Shared header fields are only mutated under the lock.
unsafe impl Send for ShmContext {}
unsafe impl Sync for ShmContext {}

/// Proof that the calling thread holds the shared memory lock.
///
/// Released when dropped. Nested guards of the same thread only adjust the
/// depth; the cross-process spinlock is released with the outermost one.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ShmLockGuard<'a> {
    ctx: &'a ShmContext,
    _section: ReentrantMutexGuard<'a, ()>,
}

impl ShmLockGuard<'_> {
    /// Current nesting depth, `1` for the outermost guard.
    pub fn depth(&self) -> u32 {
        self.ctx.depth.load(Ordering::Relaxed)
    }

    /// Release this level and return the remaining depth.
    pub fn unlock(self) -> u32 {
        let remaining = self.depth() - 1;
        drop(self);
        remaining
    }
}

impl Drop for ShmLockGuard<'_> {
    fn drop(&mut self) {
        let ctx = self.ctx;
        let depth = ctx.depth.load(Ordering::Relaxed) - 1;
        ctx.depth.store(depth, Ordering::Relaxed);
        if depth == 0 {
            if let Err(holder) = ctx.spinlock().release(ctx.pid) {
                panic!(
                    "shared memory spinlock is held by process {holder}, not by releasing process {}",
                    ctx.pid
                );
            }
            trace!(pid = ctx.pid, "shared memory spinlock released");
        }
    }
}

impl ShmContext {
    /// Set up shared memory for the calling process.
    pub fn initialize(config: ShmConfig) -> ShmResult<Self> {
        Self::with_identity(config, Arc::new(OsProcess))
    }

    /// Set up shared memory with a custom process identity source.
    ///
    /// Anonymous instances always start with a fresh segment 0. File-backed
    /// instances create segment 0 when no live process is registered and
    /// attach to the existing one otherwise.
    pub fn with_identity(
        config: ShmConfig,
        identity: Arc<dyn ProcessIdentity>,
    ) -> ShmResult<Self> {
        config
            .validate()
            .map_err(|e| ShmError::InvalidConfig(e.to_string()))?;

        let pid = identity.current_pid();
        let table = SegmentTable::new(&config);
        let registry = match &config.backing {
            SegmentBacking::Anonymous => {
                segment::create_first_segment(&table, &config.block_sizes)?;
                None
            }
            SegmentBacking::Files { dir, prefix } => {
                let registry = Registry::new(dir, prefix);
                let mut lock = registry.lock()?;
                let mut pids = lock.live_pids(identity.as_ref())?;
                if pids.is_empty() {
                    segment::create_first_segment(&table, &config.block_sizes)?;
                } else {
                    debug!(peers = ?pids, "attaching to shared memory in use");
                    segment::attach_first_segment(&table)?;
                }
                pids.push(pid);
                lock.write_pids(&pids)?;
                Some(registry)
            }
        };
        let first = table
            .first_header()
            .ok_or(ShmError::UnknownSegment { segment: 0 })?;

        info!(
            pid,
            segment_size = config.segment_size,
            block_sizes = ?config.block_sizes,
            backing = ?config.backing,
            "shared memory initialized"
        );

        Ok(Self {
            config,
            identity,
            pid,
            table,
            first,
            critical_section: ReentrantMutex::new(()),
            depth: AtomicU32::new(0),
            registry,
            waste: WasteTracker::default(),
            detached: false,
        })
    }

    /// Detach from shared memory, reporting failures.
    ///
    /// Dropping the context does the same and logs failures instead.
    pub fn cleanup(mut self) -> ShmResult<()> {
        self.detach()
    }

    fn detach(&mut self) -> ShmResult<()> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;

        if let Some(path) = &self.config.waste_log {
            let report = self.waste.report(self.pid, &self.config.block_sizes);
            if let Err(e) = report.append_to(path) {
                warn!(path = %path.display(), error = %e, "unable to write waste report");
            }
        }

        let Some(registry) = &self.registry else {
            self.table.unmap_all();
            info!(pid = self.pid, "shared memory cleaned up");
            return Ok(());
        };

        let mut lock = match registry.lock() {
            Ok(lock) => lock,
            Err(e) => {
                self.table.unmap_all();
                return Err(e);
            }
        };
        let mut pids = lock.live_pids(self.identity.as_ref())?;
        if let Some(index) = pids.iter().position(|&p| p == self.pid) {
            pids.remove(index);
        }
        self.table.unmap_all();

        if pids.is_empty() {
            let removed = registry.unlink_segments();
            lock.remove_file();
            info!(pid = self.pid, removed, "last process detached; segment files removed");
        } else {
            lock.write_pids(&pids)?;
            info!(pid = self.pid, remaining = pids.len(), "shared memory detached");
        }
        Ok(())
    }

    /// Configuration in use.
    pub fn config(&self) -> &ShmConfig {
        &self.config
    }

    /// PID this context locks with.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Number of segments currently mapped by this process.
    pub fn segment_count(&self) -> usize {
        self.table.len()
    }

    fn spinlock(&self) -> SpinLock<'_> {
        // SAFETY: the lock word is atomic and lives as long as the mapping.
        SpinLock::new(unsafe { &(*self.first.as_ptr()).spinlock })
    }

    /// Enter the shared memory critical section.
    pub fn lock(&self) -> ShmLockGuard<'_> {
        let section = self.critical_section.lock();
        let depth = self.depth.load(Ordering::Relaxed) + 1;
        if depth == 1 {
            let spins = self.spinlock().acquire(
                self.pid,
                self.identity.as_ref(),
                self.config.liveness_check_interval,
            );
            trace!(pid = self.pid, spins, "shared memory spinlock acquired");
        }
        self.depth.store(depth, Ordering::Relaxed);
        ShmLockGuard {
            ctx: self,
            _section: section,
        }
    }

    fn check_guard(&self, guard: &ShmLockGuard<'_>) -> ShmResult<()> {
        if std::ptr::eq(guard.ctx, self) {
            Ok(())
        } else {
            Err(ShmError::ForeignGuard)
        }
    }

    /// Map segments other processes added since we last looked.
    pub(crate) fn sync_segments(&self, _guard: &ShmLockGuard<'_>) -> ShmResult<()> {
        segment::map_unknown_segments(&self.table).map(|_| ())
    }

    /// Read an info slot. The caller must hold the lock.
    pub fn get_info(&self, guard: &ShmLockGuard<'_>, id: ShmInfoId) -> ShmResult<ShmPtr> {
        self.check_guard(guard)?;
        // SAFETY: info slots are only accessed under the lock.
        Ok(unsafe { (*self.first.as_ptr()).shm_info[id as usize] })
    }

    /// Write an info slot. The caller must hold the lock.
    pub fn set_info(&self, guard: &ShmLockGuard<'_>, id: ShmInfoId, ptr: ShmPtr) -> ShmResult<()> {
        self.check_guard(guard)?;
        // SAFETY: info slots are only accessed under the lock.
        unsafe { (*self.first.as_ptr()).shm_info[id as usize] = ptr };
        Ok(())
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Grows the segment set once if the size class is exhausted.
    pub fn allocate(&self, size: usize) -> ShmResult<ShmPtr> {
        if size == 0 {
            warn!("got a request for a 0-byte shared memory block");
            return Err(ShmError::ZeroSize);
        }
        let class = self.config.size_class(size).ok_or_else(|| {
            warn!(size, "requested size is larger than the largest block size");
            ShmError::TooLarge {
                size,
                max: self.config.largest_block(),
            }
        })?;
        let block_size = self.config.block_sizes[class];

        let guard = self.lock();
        let ptr = self.pop_or_grow(&guard, class)?;
        drop(guard);

        self.waste.record(class, block_size, size);
        trace!(%ptr, size, block_size, "shared memory block allocated");
        Ok(ptr)
    }

    fn pop_or_grow(&self, guard: &ShmLockGuard<'_>, class: usize) -> ShmResult<ShmPtr> {
        self.sync_segments(guard)?;
        let pools = unsafe { std::ptr::addr_of_mut!((*self.first.as_ptr()).pools) };

        // SAFETY: pool records are only touched under the lock.
        if let Some(ptr) = pool::pop(&self.table, unsafe { &mut (*pools)[class] }) {
            return Ok(ptr);
        }

        let item_size = self.config.block_sizes[class];
        debug!(item_size, "no free blocks left; adding a segment");
        segment::add_segment(&self.table, &self.config.block_sizes)?;

        pool::pop(&self.table, unsafe { &mut (*pools)[class] }).ok_or_else(|| {
            error!(item_size, "no free block after adding a segment");
            ShmError::PoolCorrupted { item_size }
        })
    }

    /// Return a block to its pool. Freeing the null handle does nothing.
    ///
    /// # Errors
    ///
    /// `ShmError::InvalidPointer` for handles that do not designate the start
    /// of a block; no pool is modified in that case.
    pub fn free(&self, ptr: ShmPtr) -> ShmResult<()> {
        if ptr.is_null() {
            warn!("trying to free a null shared memory pointer");
            return Ok(());
        }

        let guard = self.lock();
        self.sync_segments(&guard)?;
        let class = self.class_of(ptr).inspect_err(|_| {
            error!(%ptr, "free of a pointer that is not a shared memory block");
        })?;

        let pools = unsafe { std::ptr::addr_of_mut!((*self.first.as_ptr()).pools) };
        // SAFETY: pool records are only touched under the lock.
        pool::push(&self.table, unsafe { &mut (*pools)[class] }, ptr)?;
        drop(guard);

        trace!(%ptr, "shared memory block freed");
        Ok(())
    }

    fn class_of(&self, ptr: ShmPtr) -> ShmResult<usize> {
        let header = self
            .table
            .header(ptr.segment() as usize)
            .ok_or(ShmError::InvalidPointer { ptr })?;
        // SAFETY: segment headers are written once when the segment is created.
        pool::class_of(unsafe { header.as_ref() }, &self.config.block_sizes, ptr)
    }

    /// Size of the block `ptr` designates.
    pub fn block_size(&self, ptr: ShmPtr) -> ShmResult<u32> {
        self.ptr_to_ptr(ptr).ok_or(ShmError::InvalidPointer { ptr })?;
        self.class_of(ptr).map(|class| self.config.block_sizes[class])
    }

    /// Resolve a handle to a local address.
    ///
    /// Segments created by other processes are mapped on demand. Returns
    /// `None` for the null handle, header offsets, offsets past the segment
    /// end and segments that cannot be found.
    pub fn ptr_to_ptr(&self, ptr: ShmPtr) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return None;
        }
        if let Some(addr) = self.table.block_addr(ptr) {
            return Some(addr);
        }
        if (ptr.segment() as usize) < self.table.len() || !self.table.is_file_backed() {
            warn!(%ptr, "pointer does not designate shared memory");
            return None;
        }

        let guard = self.lock();
        if let Err(e) = self.sync_segments(&guard) {
            error!(%ptr, error = %e, "unable to map unknown segments");
        }
        drop(guard);

        let addr = self.table.block_addr(ptr);
        if addr.is_none() {
            warn!(%ptr, segments = self.table.len(), "pointer refers to an unknown segment");
        }
        addr
    }

    fn block(&self, ptr: ShmPtr, len: usize) -> ShmResult<NonNull<u8>> {
        let block_size = self.block_size(ptr)?;
        if len > block_size as usize {
            return Err(ShmError::BlockOverflow { len, block_size });
        }
        self.ptr_to_ptr(ptr).ok_or(ShmError::InvalidPointer { ptr })
    }

    /// Copy `data` to the start of a block.
    pub fn write_bytes(&self, ptr: ShmPtr, data: &[u8]) -> ShmResult<()> {
        let addr = self.block(ptr, data.len())?;
        // SAFETY: the block holds at least data.len() bytes.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr.as_ptr(), data.len()) };
        Ok(())
    }

    /// Copy `len` bytes from the start of a block.
    pub fn read_bytes(&self, ptr: ShmPtr, len: usize) -> ShmResult<Vec<u8>> {
        let addr = self.block(ptr, len)?;
        // SAFETY: the block holds at least len bytes.
        Ok(unsafe { std::slice::from_raw_parts(addr.as_ptr(), len) }.to_vec())
    }

    /// Copy a string into a new block, terminator included.
    pub fn strdup(&self, s: &CStr) -> ShmResult<ShmPtr> {
        self.dup_bytes(s.to_bytes_with_nul())
    }

    /// Copy a wide string into a new block and terminate it.
    ///
    /// `s` must not contain the terminator.
    pub fn wstrdup(&self, s: &[u16]) -> ShmResult<ShmPtr> {
        let bytes: Vec<u8> = s
            .iter()
            .chain(std::iter::once(&0))
            .flat_map(|unit| unit.to_ne_bytes())
            .collect();
        self.dup_bytes(&bytes)
    }

    fn dup_bytes(&self, bytes: &[u8]) -> ShmResult<ShmPtr> {
        let ptr = self.allocate(bytes.len())?;
        if let Err(e) = self.write_bytes(ptr, bytes) {
            error!(%ptr, error = %e, "string copy failed; releasing block");
            self.free(ptr)?;
            return Err(e);
        }
        Ok(ptr)
    }

    /// Read back a string written by [`strdup`](Self::strdup).
    pub fn read_cstr(&self, ptr: ShmPtr) -> ShmResult<CString> {
        let bytes = self.read_bytes(ptr, self.block_size(ptr)? as usize)?;
        CStr::from_bytes_until_nul(&bytes)
            .map(CStr::to_owned)
            .map_err(|_| ShmError::Unterminated { ptr })
    }

    /// Read back a wide string written by [`wstrdup`](Self::wstrdup),
    /// without its terminator.
    pub fn read_wstr(&self, ptr: ShmPtr) -> ShmResult<Vec<u16>> {
        let bytes = self.read_bytes(ptr, self.block_size(ptr)? as usize)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
            .collect();
        let len = units
            .iter()
            .position(|&unit| unit == 0)
            .ok_or(ShmError::Unterminated { ptr })?;
        Ok(units[..len].to_vec())
    }

    /// Usage of every size class.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let guard = self.lock();
        // SAFETY: pool records are only touched under the lock.
        let pools = unsafe { (*self.first.as_ptr()).pools };
        drop(guard);

        let waste = self.waste.snapshot(&self.config.block_sizes);
        pools
            .iter()
            .zip(waste.iter())
            .map(|(pool, waste)| PoolStats::new(pool, waste))
            .collect()
    }

    /// Usage of one size class.
    pub fn class_stats(&self, class: usize) -> Option<PoolStats> {
        (class < POOL_CLASS_COUNT).then(|| self.pool_stats()[class])
    }
}

impl Drop for ShmContext {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            error!(pid = self.pid, error = %e, "shared memory cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FIRST_POOL_OFFSET;
    use std::collections::HashSet;

    struct FakeIdentity {
        pid: u32,
        dead: HashSet<u32>,
    }

    impl ProcessIdentity for FakeIdentity {
        fn current_pid(&self) -> u32 {
            self.pid
        }

        fn is_alive(&self, pid: u32) -> bool {
            !self.dead.contains(&pid)
        }
    }

    fn small_config() -> ShmConfig {
        ShmConfig {
            segment_size: FIRST_POOL_OFFSET + 4 * 64,
            block_sizes: [16, 32, 48, 64],
            ..ShmConfig::default()
        }
    }

    fn spin_word(ctx: &ShmContext) -> &AtomicU32 {
        unsafe { &(*ctx.first.as_ptr()).spinlock }
    }

    #[test]
    fn test_lock_is_reentrant() {
        let ctx = ShmContext::initialize(ShmConfig::default()).unwrap();
        let outer = ctx.lock();
        assert_eq!(outer.depth(), 1);
        assert_eq!(spin_word(&ctx).load(Ordering::Relaxed), ctx.pid());

        let inner = ctx.lock();
        assert_eq!(inner.depth(), 2);
        assert_eq!(inner.unlock(), 1);
        assert_eq!(spin_word(&ctx).load(Ordering::Relaxed), ctx.pid());

        assert_eq!(outer.unlock(), 0);
        assert_eq!(spin_word(&ctx).load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_operations_nest_inside_explicit_lock() {
        let ctx = ShmContext::initialize(ShmConfig::default()).unwrap();
        let guard = ctx.lock();
        let ptr = ctx.allocate(10).unwrap();
        ctx.free(ptr).unwrap();
        assert_eq!(guard.depth(), 1);
    }

    #[test]
    fn test_info_slots_require_own_guard() {
        let ctx = ShmContext::initialize(ShmConfig::default()).unwrap();
        let other = ShmContext::initialize(ShmConfig::default()).unwrap();
        let ptr = ShmPtr::new(0, FIRST_POOL_OFFSET);

        let guard = ctx.lock();
        assert!(ctx.get_info(&guard, ShmInfoId::FileLocks).unwrap().is_null());
        ctx.set_info(&guard, ShmInfoId::FileLocks, ptr).unwrap();
        assert_eq!(ctx.get_info(&guard, ShmInfoId::FileLocks).unwrap(), ptr);

        let foreign = other.lock();
        assert!(matches!(
            ctx.get_info(&foreign, ShmInfoId::FileLocks),
            Err(ShmError::ForeignGuard)
        ));
        assert!(matches!(
            ctx.set_info(&foreign, ShmInfoId::ProcessInfo, ptr),
            Err(ShmError::ForeignGuard)
        ));
    }

    #[test]
    fn test_lock_evicts_dead_holder() {
        let identity = Arc::new(FakeIdentity {
            pid: 10,
            dead: [99].into_iter().collect(),
        });
        let ctx = ShmContext::with_identity(small_config(), identity).unwrap();
        spin_word(&ctx).store(99, Ordering::Release);

        let guard = ctx.lock();
        assert_eq!(spin_word(&ctx).load(Ordering::Relaxed), 10);
        drop(guard);
    }

    #[test]
    #[should_panic(expected = "held by process 99")]
    fn test_release_by_non_holder_panics() {
        let identity = Arc::new(FakeIdentity {
            pid: 10,
            dead: [99].into_iter().collect(),
        });
        let ctx = ShmContext::with_identity(small_config(), identity).unwrap();

        let guard = ctx.lock();
        spin_word(&ctx).store(99, Ordering::Release);
        drop(guard);
    }

    #[test]
    fn test_growth_adds_exactly_one_segment() {
        let ctx = ShmContext::initialize(small_config()).unwrap();
        assert_eq!(ctx.class_stats(0).unwrap().num_items, 4);

        let ptrs: Vec<ShmPtr> = (0..4).map(|_| ctx.allocate(1).unwrap()).collect();
        assert_eq!(ctx.segment_count(), 1);
        assert!(ptrs.iter().all(|p| p.segment() == 0));

        let fifth = ctx.allocate(1).unwrap();
        assert_eq!(ctx.segment_count(), 2);
        assert_eq!(fifth.segment(), 1);
    }

    #[test]
    fn test_access_helpers_are_bounded() {
        let ctx = ShmContext::initialize(ShmConfig::default()).unwrap();
        let ptr = ctx.allocate(20).unwrap();
        assert_eq!(ctx.block_size(ptr).unwrap(), 32);

        ctx.write_bytes(ptr, &[7; 32]).unwrap();
        assert_eq!(ctx.read_bytes(ptr, 32).unwrap(), vec![7; 32]);
        assert!(matches!(
            ctx.write_bytes(ptr, &[0; 33]),
            Err(ShmError::BlockOverflow {
                len: 33,
                block_size: 32
            })
        ));
        assert!(matches!(ctx.read_cstr(ptr), Err(ShmError::Unterminated { .. })));
    }

    #[test]
    fn test_waste_is_counted() {
        let ctx = ShmContext::initialize(ShmConfig::default()).unwrap();
        ctx.allocate(10).unwrap();
        ctx.allocate(60).unwrap();

        let stats = ctx.pool_stats();
        assert_eq!(stats[0].allocations, 1);
        assert_eq!(stats[0].wasted_bytes, 6);
        assert_eq!(stats[2].wasted_bytes, 4);
        assert_eq!(stats[0].used_items(), 1);
    }
}
