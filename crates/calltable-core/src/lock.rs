//! Short critical-section lock with escalating backoff
//!
//! The endpoint table is touched by every media packet. Its critical
//! sections are bounded by a bucket chain length, so contention is resolved
//! by retrying `try_lock` with a short sleep that grows with consecutive
//! failures (10µs, 50µs, 100µs, then 500µs) instead of parking on the first
//! miss. This trades a little latency under heavy contention for avoiding a
//! futex round-trip in the common uncontended case.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

const BASE_BACKOFF_MICROS: u64 = 10;

pub struct BackoffLock<T> {
    inner: Mutex<T>,
    contended: AtomicU64,
}

impl<T> BackoffLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            contended: AtomicU64::new(0),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut attempts: u32 = 0;
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }
            if attempts == 0 {
                self.contended.fetch_add(1, Ordering::Relaxed);
            }
            std::thread::sleep(backoff_for(attempts));
            attempts = attempts.saturating_add(1);
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Number of acquisitions that had to back off at least once
    pub fn contended_count(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}

fn backoff_for(attempts: u32) -> Duration {
    let factor = match attempts {
        0..=2 => 1,
        3..=5 => 5,
        6..=10 => 10,
        _ => 50,
    };
    Duration::from_micros(BASE_BACKOFF_MICROS * factor)
}

impl<T: Default> Default for BackoffLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for BackoffLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffLock")
            .field("contended", &self.contended_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_backoff_ramps() {
        assert_eq!(backoff_for(0), Duration::from_micros(10));
        assert_eq!(backoff_for(4), Duration::from_micros(50));
        assert_eq!(backoff_for(8), Duration::from_micros(100));
        assert_eq!(backoff_for(40), Duration::from_micros(500));
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let lock = Arc::new(BackoffLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = BackoffLock::new(());
        let _held = lock.lock();
        assert!(lock.try_lock().is_none());
    }
}
