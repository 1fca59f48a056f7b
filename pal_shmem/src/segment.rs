//! Segment mapping and growth.
//!
//! The [`SegmentTable`] is the per-process view of the segment set: for each
//! known segment index it publishes the local base address. Addresses are
//! published once and never change until the table is torn down, so
//! resolving a handle in an already known segment needs no lock.
//!
//! Segment creation, growth and discovery mutate shared headers and must be
//! called with the cross-process lock held (segment 0 creation excepted,
//! which happens before anybody else can see the segment).

use crate::config::{SegmentBacking, ShmConfig};
use crate::error::{ShmError, ShmResult};
use crate::layout::{
    FIRST_POOL_OFFSET, FirstHeader, PoolInfo, SEGMENT_POOL_OFFSET, SegmentHeader, ShmInfoId,
    first_segment_pool_size, pool_offset,
};
use crate::platform::{create_segment_file, map_anonymous, map_file, map_segment_file};
use crate::pool::{init_pool, link_pool};
use crate::shmptr::ShmPtr;
use memmap2::MmapMut;
use pal::consts::{POOL_CLASS_COUNT, SEGMENT_NAME_LEN};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use tracing::{debug, error, trace};

/// Per-process table of mapped segments.
pub struct SegmentTable {
    bases: Box<[AtomicPtr<u8>]>,
    count: AtomicUsize,
    maps: Mutex<Vec<MmapMut>>,
    segment_size: u32,
    max_segments: u32,
    backing: SegmentBacking,
}

impl SegmentTable {
    /// Empty table for the given geometry.
    pub fn new(config: &ShmConfig) -> Self {
        let bases = (0..config.max_segments)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Self {
            bases,
            count: AtomicUsize::new(0),
            maps: Mutex::new(Vec::new()),
            segment_size: config.segment_size,
            max_segments: config.max_segments,
            backing: config.backing.clone(),
        }
    }

    /// Number of segments this process knows about.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// True before segment 0 is mapped and after teardown.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per segment.
    #[inline]
    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    /// Segment limit.
    #[inline]
    pub fn max_segments(&self) -> u32 {
        self.max_segments
    }

    /// Local base address of a known segment.
    #[inline]
    pub fn base(&self, index: usize) -> Option<NonNull<u8>> {
        if index >= self.len() {
            return None;
        }
        NonNull::new(self.bases[index].load(Ordering::Acquire))
    }

    /// Header of a known segment.
    #[inline]
    pub fn header(&self, index: usize) -> Option<NonNull<SegmentHeader>> {
        self.base(index).map(NonNull::cast)
    }

    /// Global header living at the start of segment 0.
    #[inline]
    pub fn first_header(&self) -> Option<NonNull<FirstHeader>> {
        self.base(0).map(NonNull::cast)
    }

    /// Local address of a block handle in a known segment.
    ///
    /// Rejects offsets inside the segment header or past the segment end.
    pub fn block_addr(&self, ptr: ShmPtr) -> Option<NonNull<u8>> {
        let segment = ptr.segment();
        let base = self.base(segment as usize)?;
        let offset = ptr.offset();
        if offset >= self.segment_size || offset < pool_offset(segment) {
            return None;
        }
        // SAFETY: offset < segment_size, the mapping is segment_size bytes long.
        Some(unsafe { base.add(offset as usize) })
    }

    /// Make a mapping visible under the next free index.
    fn publish(&self, mut map: MmapMut) -> ShmResult<usize> {
        let mut maps = self.maps.lock();
        let index = self.count.load(Ordering::Relaxed);
        if index >= self.max_segments as usize {
            return Err(ShmError::SegmentLimit {
                max: self.max_segments,
            });
        }
        self.bases[index].store(map.as_mut_ptr(), Ordering::Release);
        maps.push(map);
        self.count.store(index + 1, Ordering::Release);
        Ok(index)
    }

    /// Unmap every segment.
    pub fn unmap_all(&self) {
        let mut maps = self.maps.lock();
        self.count.store(0, Ordering::Release);
        for base in self.bases.iter() {
            base.store(std::ptr::null_mut(), Ordering::Release);
        }
        let unmapped = maps.len();
        maps.clear();
        debug!(unmapped, "shared memory segments unmapped");
    }

    /// Whether segments are shared files other processes can discover.
    #[inline]
    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, SegmentBacking::Files { .. })
    }

    /// File of the segment named by `suffix`, for file-backed tables.
    pub fn segment_path(&self, suffix: &str) -> Option<PathBuf> {
        match &self.backing {
            SegmentBacking::Anonymous => None,
            SegmentBacking::Files { dir, prefix } => Some(segment_file_path(dir, prefix, suffix)),
        }
    }

    /// Map a fresh, zero-filled segment for `index`.
    fn create_mapping(&self, index: usize) -> ShmResult<MmapMut> {
        let size = self.segment_size as usize;
        let suffix = segment_suffix(index);
        match self.segment_path(&suffix) {
            None => map_anonymous(size),
            Some(path) => {
                debug!(path = %path.display(), "creating segment file");
                let file = create_segment_file(&path, size)?;
                map_file(&file)
            }
        }
    }

    /// Map an existing segment file by name suffix.
    fn attach_mapping(&self, suffix: &str) -> ShmResult<MmapMut> {
        let path = self.segment_path(suffix).ok_or_else(|| {
            ShmError::InvalidConfig("anonymous segments cannot be attached".to_string())
        })?;
        let map = map_segment_file(&path)?;
        if map.len() != self.segment_size as usize {
            return Err(ShmError::InvalidConfig(format!(
                "segment file {} is {} bytes, expected {}",
                path.display(),
                map.len(),
                self.segment_size
            )));
        }
        Ok(map)
    }
}

/// File holding the segment named by `suffix`.
pub fn segment_file_path(dir: &Path, prefix: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{prefix}_{suffix}"))
}

/// Name suffix of segment `index` (0-based).
pub fn segment_suffix(index: usize) -> String {
    format!("segment_{}", index + 1)
}

/// Decode a NUL-padded name suffix. `None` when empty.
pub fn decode_suffix(raw: &[u8; SEGMENT_NAME_LEN]) -> Option<String> {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(SEGMENT_NAME_LEN);
    if len == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&raw[..len]).into_owned())
}

fn encode_suffix(suffix: &str) -> [u8; SEGMENT_NAME_LEN] {
    let mut raw = [0u8; SEGMENT_NAME_LEN];
    let len = suffix.len().min(SEGMENT_NAME_LEN);
    raw[..len].copy_from_slice(&suffix.as_bytes()[..len]);
    raw
}

/// Map segment 0 and initialize the global header and every pool.
///
/// On failure nothing stays mapped.
pub fn create_first_segment(
    table: &SegmentTable,
    block_sizes: &[u32; POOL_CLASS_COUNT],
) -> ShmResult<()> {
    let map = table.create_mapping(0)?;
    let index = table.publish(map)?;
    debug_assert_eq!(index, 0);

    let result = table
        .first_header()
        .ok_or(ShmError::UnknownSegment { segment: 0 })
        .and_then(|header| {
            // SAFETY: segment 0 is freshly mapped and not yet visible to anyone else.
            unsafe { init_first_header(header, table.segment_size(), block_sizes) }
        });

    if let Err(e) = &result {
        error!(error = %e, "failed to initialize first shared memory segment");
        table.unmap_all();
    } else {
        debug!(segment_size = table.segment_size(), "first shared memory segment initialized");
    }
    result
}

/// Map an already initialized segment 0 created by another process.
pub fn attach_first_segment(table: &SegmentTable) -> ShmResult<()> {
    let map = table.attach_mapping(&segment_suffix(0))?;
    table.publish(map)?;
    debug!("attached to existing first shared memory segment");
    Ok(())
}

unsafe fn init_first_header(
    header: NonNull<FirstHeader>,
    segment_size: u32,
    block_sizes: &[u32; POOL_CLASS_COUNT],
) -> ShmResult<()> {
    let base = header.cast::<u8>();
    let hdr = header.as_ptr();
    unsafe {
        (*hdr).spinlock.store(0, Ordering::Release);
        (*hdr).header.next_segment = [0; SEGMENT_NAME_LEN];
        (*hdr).shm_info = [ShmPtr::NULL; ShmInfoId::COUNT];
    }

    let pool_size = first_segment_pool_size(segment_size);
    let mut pool_start = FIRST_POOL_OFFSET;
    for (class, &block_size) in block_sizes.iter().enumerate() {
        let first = ShmPtr::new(0, pool_start);
        // SAFETY: the pool lies in [pool_start, pool_start + pool_size) inside segment 0.
        let last = unsafe {
            init_pool(base, first, block_size, pool_size, &mut (*hdr).pools[class])
        }
        .ok_or(ShmError::SegmentTooSmall { segment_size })?;

        unsafe {
            (*hdr).header.first_pool_blocks[class] = first;
            (*hdr).header.last_pool_blocks[class] = last;
        }
        pool_start += pool_size;
    }
    Ok(())
}

/// Map every segment created by other processes that this one has not seen.
///
/// Follows the `next_segment` chain from the last known segment. A no-op for
/// anonymous tables. Requires the cross-process lock. Returns the number of
/// newly mapped segments.
pub fn map_unknown_segments(table: &SegmentTable) -> ShmResult<usize> {
    if !table.is_file_backed() {
        return Ok(0);
    }

    let mut mapped = 0;
    loop {
        let last = table
            .len()
            .checked_sub(1)
            .ok_or(ShmError::UnknownSegment { segment: 0 })?;
        let header = table
            .header(last)
            .ok_or(ShmError::UnknownSegment { segment: last as u8 })?;
        // SAFETY: the chain link is only written under the cross-process lock, which we hold.
        let raw = unsafe {
            std::ptr::read_volatile(std::ptr::addr_of!((*header.as_ptr()).next_segment))
        };
        let Some(suffix) = decode_suffix(&raw) else {
            break;
        };
        if table.len() >= table.max_segments() as usize {
            error!(max = table.max_segments(), "can't map more segments");
            return Err(ShmError::SegmentLimit {
                max: table.max_segments(),
            });
        }
        let map = table.attach_mapping(&suffix)?;
        let index = table.publish(map)?;
        trace!(index, %suffix, "mapped segment created by another process");
        mapped += 1;
    }

    if mapped > 0 {
        debug!(mapped, total = table.len(), "mapped unknown segments");
    }
    Ok(mapped)
}

/// Create one more segment and share it out between all size classes.
///
/// Each class receives a share of the new segment proportional to the bytes
/// it currently has in use, plus one block so that every class grows. The
/// new blocks are pushed in front of the existing global free lists.
/// Requires the cross-process lock.
pub fn add_segment(table: &SegmentTable, block_sizes: &[u32; POOL_CLASS_COUNT]) -> ShmResult<()> {
    map_unknown_segments(table)?;

    let index = table.len();
    if index >= table.max_segments() as usize {
        error!(max = table.max_segments(), "can't add segment: maximum number reached");
        return Err(ShmError::SegmentLimit {
            max: table.max_segments(),
        });
    }

    // One block of every class is set aside before the proportional split.
    let reserved: u32 = block_sizes.iter().sum();
    let new_size = table
        .segment_size()
        .checked_sub(SEGMENT_POOL_OFFSET + reserved)
        .ok_or(ShmError::SegmentTooSmall {
            segment_size: table.segment_size(),
        })? as u64;

    let first_header = table
        .first_header()
        .ok_or(ShmError::UnknownSegment { segment: 0 })?
        .as_ptr();
    // SAFETY: pool records are only touched under the cross-process lock.
    let pools: &mut [PoolInfo; POOL_CLASS_COUNT] = unsafe { &mut (*first_header).pools };

    let used_size: u64 = pools
        .iter()
        .map(|p| (p.num_items - p.free_items) as u64 * p.item_size as u64)
        .sum();

    debug!(
        segment = index,
        used_size, new_size, "creating shared memory segment"
    );

    let map = table.create_mapping(index)?;
    let index = table.publish(map)?;
    let base = table.base(index).ok_or(ShmError::UnknownSegment {
        segment: index as u8,
    })?;
    let header = base.cast::<SegmentHeader>().as_ptr();

    let mut first = ShmPtr::new(index as u8, SEGMENT_POOL_OFFSET);
    for (class, &block_size) in block_sizes.iter().enumerate() {
        let pool = &mut pools[class];
        let used_pool = (pool.num_items - pool.free_items) as u64 * block_size as u64;
        let share = if used_size == 0 {
            new_size / POOL_CLASS_COUNT as u64
        } else {
            used_pool * new_size / used_size
        };
        let num_new = (share / block_size as u64) as u32 + 1;

        // SAFETY: the blocks fit: sum(share) <= new_size, plus one reserved block per class.
        let last = unsafe { link_pool(base, first, block_size, num_new) };
        unsafe {
            (*header).first_pool_blocks[class] = first;
            (*header).last_pool_blocks[class] = last;
            // Splice the old global list after the new blocks.
            base.add(last.offset() as usize)
                .cast::<u32>()
                .write(pool.first_free.raw());
        }
        pool.first_free = first;
        pool.free_items += num_new;
        pool.num_items += num_new;

        trace!(
            block_size,
            added = num_new,
            total = pool.num_items,
            free = pool.free_items,
            "pool grown"
        );
        first = first.add(num_new * block_size);
    }

    // Let other processes find the new segment from the previous last one.
    if table.is_file_backed() {
        let previous = table
            .header(index - 1)
            .ok_or(ShmError::UnknownSegment {
                segment: (index - 1) as u8,
            })?
            .as_ptr();
        unsafe {
            (*previous).next_segment = encode_suffix(&segment_suffix(index));
        }
    }

    debug!(segments = table.len(), "shared memory segment added");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ShmConfig {
        ShmConfig {
            segment_size: FIRST_POOL_OFFSET + 4 * 64,
            block_sizes: [16, 32, 48, 64],
            ..ShmConfig::default()
        }
    }

    fn pools(table: &SegmentTable) -> [PoolInfo; POOL_CLASS_COUNT] {
        unsafe { (*table.first_header().unwrap().as_ptr()).pools }
    }

    #[test]
    fn test_suffix_encoding() {
        assert_eq!(segment_suffix(0), "segment_1");
        let raw = encode_suffix("segment_12");
        assert_eq!(decode_suffix(&raw).as_deref(), Some("segment_12"));
        assert_eq!(decode_suffix(&[0; SEGMENT_NAME_LEN]), None);
    }

    #[test]
    fn test_first_segment_layout() {
        let config = small_config();
        let table = SegmentTable::new(&config);
        create_first_segment(&table, &config.block_sizes).unwrap();

        assert_eq!(table.len(), 1);
        let pools = pools(&table);
        let counts: Vec<u32> = pools.iter().map(|p| p.num_items).collect();
        assert_eq!(counts, vec![4, 2, 1, 1]);
        assert!(pools.iter().all(|p| p.free_items == p.num_items));
        assert_eq!(pools[0].first_free, ShmPtr::new(0, FIRST_POOL_OFFSET));

        let header = unsafe { &(*table.first_header().unwrap().as_ptr()).header };
        assert_eq!(header.first_pool_blocks[1], ShmPtr::new(0, FIRST_POOL_OFFSET + 64));
        assert_eq!(header.last_pool_blocks[0], ShmPtr::new(0, FIRST_POOL_OFFSET + 48));
    }

    #[test]
    fn test_block_addr_rejects_header_and_overflow() {
        let config = small_config();
        let table = SegmentTable::new(&config);
        create_first_segment(&table, &config.block_sizes).unwrap();

        assert!(table.block_addr(ShmPtr::new(0, FIRST_POOL_OFFSET)).is_some());
        assert!(table.block_addr(ShmPtr::new(0, FIRST_POOL_OFFSET - 8)).is_none());
        assert!(table.block_addr(ShmPtr::new(0, config.segment_size)).is_none());
        assert!(table.block_addr(ShmPtr::new(1, SEGMENT_POOL_OFFSET)).is_none());
    }

    #[test]
    fn test_add_segment_grows_every_class() {
        let config = small_config();
        let table = SegmentTable::new(&config);
        create_first_segment(&table, &config.block_sizes).unwrap();
        let before = pools(&table);

        add_segment(&table, &config.block_sizes).unwrap();

        assert_eq!(table.len(), 2);
        let after = pools(&table);
        for class in 0..POOL_CLASS_COUNT {
            assert!(after[class].num_items > before[class].num_items);
            assert_eq!(after[class].first_free.segment(), 1);
        }
    }

    #[test]
    fn test_add_segment_respects_limit() {
        let config = ShmConfig {
            max_segments: 1,
            ..small_config()
        };
        let table = SegmentTable::new(&config);
        create_first_segment(&table, &config.block_sizes).unwrap();

        let result = add_segment(&table, &config.block_sizes);
        assert!(matches!(result, Err(ShmError::SegmentLimit { max: 1 })));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unmap_all_forgets_segments() {
        let config = small_config();
        let table = SegmentTable::new(&config);
        create_first_segment(&table, &config.block_sizes).unwrap();
        table.unmap_all();
        assert!(table.is_empty());
        assert!(table.base(0).is_none());
    }
}
