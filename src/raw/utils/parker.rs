use std::hint;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

// Number of spins before a waiter sleeps on the lane.
const SPIN_LIMIT: usize = 128;

// Parks threads on slab lanes that another thread has reserved.
//
// A reservation lasts for a slot allocation and a record write, so waiters
// usually see it resolved while spinning. Sleeping waiters are counted so
// that the common case of an unobserved reservation does not pay for a
// wake syscall.
#[derive(Default)]
pub struct Parker {
    pending: AtomicUsize,
}

impl Parker {
    // Block the current thread until `lane` no longer holds `reserved`,
    // returning the resolved value.
    pub fn park(&self, lane: &AtomicU32, reserved: u32) -> u32 {
        for _ in 0..SPIN_LIMIT {
            let value = lane.load(Ordering::Acquire);
            if value != reserved {
                return value;
            }

            hint::spin_loop();
        }

        // Announce ourselves before the final check, so that a concurrent
        // `unpark` either observes us or we observe its store.
        self.pending.fetch_add(1, Ordering::SeqCst);

        let value = loop {
            let value = lane.load(Ordering::SeqCst);
            if value != reserved {
                break value;
            }

            atomic_wait::wait(lane, reserved);
        };

        self.pending.fetch_sub(1, Ordering::Relaxed);
        value
    }

    // Wake all threads parked on `lane`.
    //
    // The store resolving the reservation must be `SeqCst` to be visible to
    // threads that are about to sleep.
    pub fn unpark(&self, lane: &AtomicU32) {
        // Fast-path, no one waiting to be unparked.
        if self.pending.load(Ordering::SeqCst) == 0 {
            return;
        }

        atomic_wait::wake_all(lane);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Duration;

    #[test]
    fn resolve() {
        const RESERVED: u32 = u32::MAX - 1;

        let parker = Parker::default();
        let lane = AtomicU32::new(RESERVED);

        thread::scope(|s| {
            let waiters = (0..4)
                .map(|_| s.spawn(|| parker.park(&lane, RESERVED)))
                .collect::<Vec<_>>();

            thread::sleep(Duration::from_millis(10));
            lane.store(7, Ordering::SeqCst);
            parker.unpark(&lane);

            for waiter in waiters {
                assert_eq!(waiter.join().unwrap(), 7);
            }
        });

        assert_eq!(parker.pending.load(Ordering::Relaxed), 0);
    }
}
