//! Fixed-size block pools and their intrusive free lists.
//!
//! The first 4 bytes of every free block hold the raw [`ShmPtr`] of the next
//! free block. A pool record only stores the list head and the counters; the
//! blocks themselves may be spread over any number of segments.
//!
//! Everything here mutates shared state and expects the cross-process lock
//! to be held by the caller.

use crate::error::{ShmError, ShmResult};
use crate::layout::{PoolInfo, SegmentHeader};
use crate::segment::SegmentTable;
use crate::shmptr::ShmPtr;
use pal::consts::POOL_CLASS_COUNT;
use std::ptr::NonNull;
use tracing::{error, trace};

/// Thread `num_blocks` consecutive blocks starting at `first` into a list
/// ending with null. Returns the last block.
///
/// # Safety
///
/// `base` must be the local address of `first`'s segment and the whole
/// range `first .. first + num_blocks * block_size` must lie inside it.
/// `num_blocks` must be at least 1.
pub unsafe fn link_pool(
    base: NonNull<u8>,
    first: ShmPtr,
    block_size: u32,
    num_blocks: u32,
) -> ShmPtr {
    debug_assert!(num_blocks > 0);

    let mut current = first;
    for _ in 1..num_blocks {
        let next = current.add(block_size);
        unsafe { link_word(base, current).write(next.raw()) };
        current = next;
    }
    unsafe { link_word(base, current).write(ShmPtr::NULL.raw()) };
    current
}

/// Carve a `pool_size`-byte region into blocks and make it the whole of
/// `pool`. Returns the last block, or `None` if not a single block fits.
///
/// # Safety
///
/// Same as [`link_pool`] for the `pool_size`-byte region at `first`.
pub unsafe fn init_pool(
    base: NonNull<u8>,
    first: ShmPtr,
    block_size: u32,
    pool_size: u32,
    pool: &mut PoolInfo,
) -> Option<ShmPtr> {
    let num_blocks = pool_size / block_size;
    if num_blocks == 0 {
        return None;
    }

    let last = unsafe { link_pool(base, first, block_size, num_blocks) };
    *pool = PoolInfo {
        item_size: block_size,
        num_items: num_blocks,
        free_items: num_blocks,
        first_free: first,
    };
    trace!(block_size, num_blocks, %first, "pool initialized");
    Some(last)
}

#[inline]
unsafe fn link_word(base: NonNull<u8>, block: ShmPtr) -> NonNull<u32> {
    unsafe { base.add(block.offset() as usize).cast::<u32>() }
}

/// Drop a free list whose head and count disagree.
///
/// The blocks still on it are leaked; the pool stays usable through growth.
fn quarantine(pool: &mut PoolInfo) {
    error!(
        item_size = pool.item_size,
        free_items = pool.free_items,
        first_free = %pool.first_free,
        "free list corrupted; discarding remaining free blocks"
    );
    pool.first_free = ShmPtr::NULL;
    pool.free_items = 0;
}

/// Take the head block off `pool`'s free list.
///
/// Returns `None` when the list is empty. An inconsistent list is
/// quarantined first: the popped block is still handed out when it is
/// valid, the rest of the list is abandoned.
pub fn pop(table: &SegmentTable, pool: &mut PoolInfo) -> Option<ShmPtr> {
    let first = pool.first_free;
    if first.is_null() || pool.free_items == 0 {
        if first.is_null() != (pool.free_items == 0) {
            quarantine(pool);
        }
        return None;
    }

    let Some(addr) = table.block_addr(first) else {
        quarantine(pool);
        return None;
    };
    // SAFETY: `first` resolved inside a mapped segment; link words are 8-aligned.
    let next = ShmPtr::from_raw(unsafe { addr.cast::<u32>().read() });

    pool.first_free = next;
    pool.free_items -= 1;

    if (pool.free_items == 0) != next.is_null()
        || (!next.is_null() && table.block_addr(next).is_none())
    {
        quarantine(pool);
    }
    Some(first)
}

/// Put `block` back at the head of `pool`'s free list.
///
/// # Errors
///
/// Returns `ShmError::InvalidPointer` without touching the pool if the
/// block cannot be resolved, the pool has no block out or the block is
/// already on the free list.
pub fn push(table: &SegmentTable, pool: &mut PoolInfo, block: ShmPtr) -> ShmResult<()> {
    let addr = table
        .block_addr(block)
        .ok_or(ShmError::InvalidPointer { ptr: block })?;
    if pool.free_items >= pool.num_items {
        error!(
            %block,
            item_size = pool.item_size,
            "free of a block from a pool with nothing allocated"
        );
        return Err(ShmError::InvalidPointer { ptr: block });
    }
    if is_free(table, pool, block) {
        error!(%block, item_size = pool.item_size, "double free of a shared memory block");
        return Err(ShmError::InvalidPointer { ptr: block });
    }

    // SAFETY: resolved above.
    unsafe { addr.cast::<u32>().write(pool.first_free.raw()) };
    pool.first_free = block;
    pool.free_items += 1;
    Ok(())
}

/// Whether `block` is on `pool`'s free list. Walks at most `free_items`
/// links and stops at the first one that does not resolve.
fn is_free(table: &SegmentTable, pool: &PoolInfo, block: ShmPtr) -> bool {
    let mut current = pool.first_free;
    for _ in 0..pool.free_items {
        if current == block {
            return true;
        }
        let Some(addr) = table.block_addr(current) else {
            return false;
        };
        // SAFETY: resolved inside a mapped segment; link words are 8-aligned.
        current = ShmPtr::from_raw(unsafe { addr.cast::<u32>().read() });
    }
    false
}

/// Size class of the block `ptr` designates, given its segment header.
///
/// `ptr` must lie inside one of the class ranges recorded in the header
/// and sit on a block boundary.
pub fn class_of(
    header: &SegmentHeader,
    block_sizes: &[u32; POOL_CLASS_COUNT],
    ptr: ShmPtr,
) -> ShmResult<usize> {
    (0..POOL_CLASS_COUNT)
        .find(|&c| {
            let first = header.first_pool_blocks[c];
            let last = header.last_pool_blocks[c];
            !first.is_null() && first <= ptr && ptr <= last
        })
        .filter(|&c| (ptr.offset() - header.first_pool_blocks[c].offset()) % block_sizes[c] == 0)
        .ok_or(ShmError::InvalidPointer { ptr })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShmConfig;
    use crate::layout::FIRST_POOL_OFFSET;
    use crate::segment::create_first_segment;

    fn table() -> (SegmentTable, ShmConfig) {
        let config = ShmConfig {
            segment_size: FIRST_POOL_OFFSET + 4 * 64,
            block_sizes: [16, 32, 48, 64],
            ..ShmConfig::default()
        };
        let table = SegmentTable::new(&config);
        create_first_segment(&table, &config.block_sizes).unwrap();
        (table, config)
    }

    fn pool(table: &SegmentTable, class: usize) -> *mut PoolInfo {
        unsafe { &raw mut (*table.first_header().unwrap().as_ptr()).pools[class] }
    }

    fn header(table: &SegmentTable) -> &SegmentHeader {
        unsafe { &*table.header(0).unwrap().as_ptr() }
    }

    #[test]
    fn test_pop_walks_blocks_in_address_order() {
        let (table, _) = table();
        let pool = unsafe { &mut *pool(&table, 0) };

        let popped: Vec<u32> = std::iter::from_fn(|| pop(&table, pool))
            .map(|p| p.offset())
            .collect();
        let base = FIRST_POOL_OFFSET;
        assert_eq!(popped, vec![base, base + 16, base + 32, base + 48]);
        assert_eq!(pool.free_items, 0);
        assert!(pool.first_free.is_null());
    }

    #[test]
    fn test_push_is_lifo() {
        let (table, _) = table();
        let pool = unsafe { &mut *pool(&table, 1) };
        let a = pop(&table, pool).unwrap();
        let b = pop(&table, pool).unwrap();

        push(&table, pool, a).unwrap();
        push(&table, pool, b).unwrap();
        assert_eq!(pool.free_items, 2);
        assert_eq!(pop(&table, pool), Some(b));
        assert_eq!(pop(&table, pool), Some(a));
    }

    #[test]
    fn test_push_rejects_overfull_pool() {
        let (table, _) = table();
        let pool = unsafe { &mut *pool(&table, 2) };
        let first = pool.first_free;
        let before = *pool;

        assert!(matches!(
            push(&table, pool, first),
            Err(ShmError::InvalidPointer { .. })
        ));
        assert_eq!(pool.free_items, before.free_items);
        assert_eq!(pool.first_free, before.first_free);
    }

    #[test]
    fn test_push_rejects_block_already_free() {
        let (table, _) = table();
        let pool = unsafe { &mut *pool(&table, 0) };
        let a = pop(&table, pool).unwrap();
        let b = pop(&table, pool).unwrap();
        let c = pop(&table, pool).unwrap();
        push(&table, pool, a).unwrap();

        // At the head of the list.
        assert!(matches!(push(&table, pool, a), Err(ShmError::InvalidPointer { .. })));
        assert_eq!(pool.free_items, 2);
        assert_eq!(pool.first_free, a);

        // Behind the head, with a block of the class still out.
        push(&table, pool, b).unwrap();
        assert!(matches!(push(&table, pool, a), Err(ShmError::InvalidPointer { .. })));
        assert_eq!(pool.free_items, 3);
        assert_eq!(pool.first_free, b);

        push(&table, pool, c).unwrap();
        assert_eq!(pool.free_items, 4);
    }

    #[test]
    fn test_inconsistent_pool_is_quarantined() {
        let (table, _) = table();
        let pool = unsafe { &mut *pool(&table, 0) };
        pool.free_items = 1;

        // Head has a successor although only one block is counted free.
        let popped = pop(&table, pool);
        assert_eq!(popped.map(|p| p.offset()), Some(FIRST_POOL_OFFSET));
        assert!(pool.first_free.is_null());
        assert_eq!(pool.free_items, 0);
        assert_eq!(pop(&table, pool), None);
    }

    #[test]
    fn test_class_of() {
        let (table, config) = table();
        let header = header(&table);

        let base = FIRST_POOL_OFFSET;
        assert_eq!(class_of(header, &config.block_sizes, ShmPtr::new(0, base + 16)).unwrap(), 0);
        assert_eq!(class_of(header, &config.block_sizes, ShmPtr::new(0, base + 96)).unwrap(), 1);
        assert_eq!(class_of(header, &config.block_sizes, ShmPtr::new(0, base + 192)).unwrap(), 3);
        // Inside a 32-byte block.
        assert!(class_of(header, &config.block_sizes, ShmPtr::new(0, base + 80)).is_err());
        // Unused tail of the 48-byte pool.
        assert!(class_of(header, &config.block_sizes, ShmPtr::new(0, base + 176)).is_err());
    }
}
