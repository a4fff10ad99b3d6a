use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};

// The lock is free.
const UNLOCKED: u32 = 0;

// The lock is held, and no thread is waiting for it.
const LOCKED: u32 = 1;

// The lock is held, and at least one thread may be sleeping on it.
const CONTENDED: u32 = 2;

// Number of spins before a contended locker falls back to the futex.
const SPIN_LIMIT: usize = 64;

/// A per-bucket mutual exclusion lock.
///
/// Bucket critical sections are short (a chain walk and at most one slot
/// allocation), so lockers spin briefly before sleeping on the lock word.
///
/// # State table:
///
/// state      | Description
/// -----------+--------------------------------------------------------------
/// UNLOCKED   | The lock is free.
/// LOCKED     | The lock is held by exactly one thread, no thread is asleep.
/// CONTENDED  | The lock is held, one or more threads are asleep or about to
///            | sleep. The unlocking thread must wake one of them.
#[derive(Default)]
pub struct BucketLock {
    state: AtomicU32,
}

/// Releases the bucket lock when dropped.
pub struct BucketGuard<'a> {
    lock: &'a BucketLock,
}

impl BucketLock {
    pub const fn new() -> BucketLock {
        BucketLock {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    #[inline]
    pub fn lock(&self) -> BucketGuard<'_> {
        if self
            .state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }

        BucketGuard { lock: self }
    }

    #[cold]
    fn lock_slow(&self) {
        // Spin while the lock is held but uncontended.
        let mut spun = 0;
        while spun < SPIN_LIMIT {
            match self.state.load(Ordering::Relaxed) {
                UNLOCKED => {
                    if self
                        .state
                        .compare_exchange_weak(
                            UNLOCKED,
                            LOCKED,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                CONTENDED => break,
                _ => {}
            }

            hint::spin_loop();
            spun += 1;
        }

        // Mark the lock as contended and sleep until it is released. A thread that
        // acquires the lock here keeps it marked as contended, as other threads may
        // still be asleep.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            atomic_wait::wait(&self.state, CONTENDED);
        }
    }

    #[inline]
    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            atomic_wait::wake_one(&self.state);
        }
    }
}

impl Drop for BucketGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::UnsafeCell;
    use std::thread;

    struct Shared(UnsafeCell<usize>);
    unsafe impl Sync for Shared {}

    #[test]
    fn exclusion() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = if cfg!(miri) { 16 } else { 10_000 };

        let lock = BucketLock::new();
        let count = Shared(UnsafeCell::new(0));

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    let count = &count;
                    for _ in 0..ITERATIONS {
                        let _guard = lock.lock();
                        unsafe { *count.0.get() += 1 };
                    }
                });
            }
        });

        assert_eq!(count.0.into_inner(), THREADS * ITERATIONS);
        assert_eq!(lock.state.load(Ordering::Relaxed), UNLOCKED);
    }
}
