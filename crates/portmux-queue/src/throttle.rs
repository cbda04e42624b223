use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{QueueError, Result};

struct Permits {
    available: usize,
    closed: bool,
}

/// Counting semaphore bounding the number of outstanding chunks.
///
/// Closing the throttle fails every blocked and future acquire.
pub struct Throttle {
    capacity: usize,
    permits: Mutex<Permits>,
    released: Condvar,
}

impl Throttle {
    /// Create a throttle with `capacity` permits (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            permits: Mutex::new(Permits {
                available: capacity,
                closed: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Take a permit, waiting up to `timeout` (`None` waits forever).
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut permits = self.lock();
        loop {
            if permits.closed {
                return Err(QueueError::Closed);
            }
            if permits.available > 0 {
                permits.available -= 1;
                return Ok(());
            }
            match deadline {
                None => {
                    permits = self
                        .released
                        .wait(permits)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Timeout);
                    }
                    permits = self
                        .released
                        .wait_timeout(permits, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Take a permit if one is free.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.lock();
        if permits.closed || permits.available == 0 {
            return false;
        }
        permits.available -= 1;
        true
    }

    /// Return a permit. Never exceeds the capacity.
    pub fn release(&self) {
        let mut permits = self.lock();
        if permits.available < self.capacity {
            permits.available += 1;
        }
        drop(permits);
        self.released.notify_one();
    }

    /// Fail all current and future acquires. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.released.notify_all();
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Total permits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, Permits> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn acquire_until_exhausted_then_time_out() {
        let throttle = Throttle::new(2);
        throttle.acquire(None).unwrap();
        throttle.acquire(None).unwrap();
        assert_eq!(throttle.available(), 0);
        assert_eq!(
            throttle.acquire(Some(Duration::from_millis(10))),
            Err(QueueError::Timeout)
        );
        assert!(!throttle.try_acquire());
    }

    #[test]
    fn release_wakes_blocked_acquirer() {
        let throttle = Arc::new(Throttle::new(1));
        throttle.acquire(None).unwrap();

        let waiter = {
            let throttle = Arc::clone(&throttle);
            thread::spawn(move || throttle.acquire(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        throttle.release();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn close_fails_blocked_acquirer() {
        let throttle = Arc::new(Throttle::new(1));
        throttle.acquire(None).unwrap();

        let waiter = {
            let throttle = Arc::clone(&throttle);
            thread::spawn(move || throttle.acquire(None))
        };
        thread::sleep(Duration::from_millis(20));
        throttle.close();
        throttle.close();
        assert_eq!(waiter.join().unwrap(), Err(QueueError::Closed));
        assert!(throttle.is_closed());
    }

    #[test]
    fn release_never_exceeds_capacity() {
        let throttle = Throttle::new(3);
        throttle.release();
        assert_eq!(throttle.available(), 3);
        assert_eq!(Throttle::new(0).capacity(), 1);
    }
}
