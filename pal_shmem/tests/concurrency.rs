//! Mutual exclusion between threads and between contexts

use pal_shmem::{ProcessIdentity, SegmentBacking, ShmConfig, ShmContext, ShmPtr, ShmResult};
use std::collections::HashSet;
use std::sync::Arc;

struct FixedIdentity(u32);

impl ProcessIdentity for FixedIdentity {
    fn current_pid(&self) -> u32 {
        self.0
    }

    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

fn read_counter(ctx: &ShmContext, ptr: ShmPtr) -> ShmResult<u64> {
    let bytes = ctx.read_bytes(ptr, 8)?;
    Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
}

#[test]
fn test_threads_get_distinct_blocks() -> ShmResult<()> {
    let ctx = ShmContext::initialize(ShmConfig {
        segment_size: 16 * 1024,
        ..ShmConfig::default()
    })?;

    let per_thread: Vec<Vec<ShmPtr>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = &ctx;
                s.spawn(move || {
                    (0..200)
                        .map(|_| ctx.allocate(16).unwrap())
                        .collect::<Vec<ShmPtr>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let all: HashSet<ShmPtr> = per_thread.iter().flatten().copied().collect();
    assert_eq!(all.len(), 8 * 200);
    assert!(ctx.segment_count() > 1);

    std::thread::scope(|s| {
        for ptrs in &per_thread {
            let ctx = &ctx;
            s.spawn(move || {
                for &ptr in ptrs {
                    ctx.free(ptr).unwrap();
                }
            });
        }
    });

    let stats = ctx.pool_stats()[0];
    assert_eq!(stats.free_items, stats.num_items);
    Ok(())
}

#[test]
fn test_lock_serializes_threads() -> ShmResult<()> {
    let ctx = ShmContext::initialize(ShmConfig::default())?;
    let counter = ctx.allocate(8)?;
    ctx.write_bytes(counter, &0u64.to_ne_bytes())?;

    std::thread::scope(|s| {
        for _ in 0..4 {
            let ctx = &ctx;
            s.spawn(move || {
                for _ in 0..500 {
                    let guard = ctx.lock();
                    let value = read_counter(ctx, counter).unwrap();
                    std::thread::yield_now();
                    ctx.write_bytes(counter, &(value + 1).to_ne_bytes()).unwrap();
                    drop(guard);
                }
            });
        }
    });

    assert_eq!(read_counter(&ctx, counter)?, 2000);
    Ok(())
}

#[test]
fn test_spinlock_serializes_contexts() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let config = ShmConfig {
        backing: SegmentBacking::Files {
            dir: dir.path().to_path_buf(),
            prefix: "contend".to_string(),
        },
        ..ShmConfig::default()
    };
    let a = ShmContext::with_identity(config.clone(), Arc::new(FixedIdentity(1001)))?;
    let b = ShmContext::with_identity(config, Arc::new(FixedIdentity(1002)))?;

    let counter = a.allocate(8)?;
    a.write_bytes(counter, &0u64.to_ne_bytes())?;

    std::thread::scope(|s| {
        for ctx in [&a, &b, &a, &b] {
            s.spawn(move || {
                for _ in 0..300 {
                    let guard = ctx.lock();
                    let value = read_counter(ctx, counter).unwrap();
                    std::thread::yield_now();
                    ctx.write_bytes(counter, &(value + 1).to_ne_bytes()).unwrap();
                    drop(guard);
                }
            });
        }
    });

    assert_eq!(read_counter(&b, counter)?, 1200);
    b.free(counter)?;
    Ok(())
}
