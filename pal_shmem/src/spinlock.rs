//! PID-tagged cross-process spinlock.
//!
//! The lock is a single 32-bit word living in shared memory: `0` when free,
//! otherwise the PID of the holding process. Contenders spin with
//! compare-and-swap and yield between attempts. Every `interval`-th attempt
//! they probe the holder's liveness; a dead holder's tag is swapped back to
//! `0` so the lock cannot stay wedged after a crash.
//!
//! Threads of one process never contend here: the owning context serializes
//! them beforehand, so the word only ever arbitrates between processes.

use crate::platform::ProcessIdentity;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{trace, warn};

/// View over a spinlock word.
#[derive(Clone, Copy)]
pub struct SpinLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> SpinLock<'a> {
    /// Wrap an existing lock word.
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// PID of the current holder, `0` if free.
    #[inline]
    pub fn holder(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// Single acquisition attempt. On failure returns the holder's PID.
    #[inline]
    pub fn try_acquire(&self, pid: u32) -> Result<(), u32> {
        self.word
            .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
    }

    /// Spin until the word is tagged with `pid`.
    ///
    /// `interval` must be a power of two. Returns the number of attempts.
    pub fn acquire(&self, pid: u32, identity: &dyn ProcessIdentity, interval: u32) -> u32 {
        debug_assert!(pid != 0);
        debug_assert!(interval.is_power_of_two());

        let mask = interval - 1;
        let mut spincount: u32 = 1;
        loop {
            let holder = match self.try_acquire(pid) {
                Ok(()) => {
                    trace!(pid, spincount, "spinlock acquired");
                    return spincount;
                }
                Err(holder) => holder,
            };

            if spincount & mask == 0 && !identity.is_alive(holder) {
                warn!(holder, "spinlock owner is dead; releasing its lock");
                // Another contender may have reset it already; either outcome is fine.
                let _ = self.word.compare_exchange(
                    holder,
                    0,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            } else {
                std::thread::yield_now();
            }

            spincount = spincount.wrapping_add(1);
        }
    }

    /// Reset the word to `0` if `pid` holds it. On mismatch returns the
    /// actual holder and leaves the word untouched.
    #[inline]
    pub fn release(&self, pid: u32) -> Result<(), u32> {
        self.word
            .compare_exchange(pid, 0, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
    }
}
