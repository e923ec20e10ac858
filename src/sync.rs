//! Synchronization primitives shared by the worker pool and the DB pool.
//!
//! Mutual exclusion and condition waiting come straight from `std::sync`; the
//! only thing std lacks is a counting semaphore, which is built here on top of
//! the two.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate leaves the protected value consistent
/// after each individual assignment, so a poisoned lock carries no torn state.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock a mutex only if no one else holds it. Poisoning is recovered as in
/// [`lock`].
pub fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// Counting semaphore: `acquire` blocks while the count is zero.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Take one permit, blocking the calling thread until one is posted.
    pub fn acquire(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Take one permit if available, without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut permits = lock(&self.permits);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Return one permit and wake a single waiter.
    pub fn release(&self) {
        *lock(&self.permits) += 1;
        self.available.notify_one();
    }

    pub fn available(&self) -> usize {
        *lock(&self.permits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn try_lock_fails_only_while_held() {
        let mutex = Mutex::new(1);
        let guard = lock(&mutex);
        assert!(try_lock(&mutex).is_none());
        drop(guard);
        assert_eq!(try_lock(&mutex).map(|g| *g), Some(1));
    }
    use std::time::Duration;

    #[test]
    fn try_acquire_respects_count() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0));
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let sem = Arc::clone(&sem);
            let woke = Arc::clone(&woke);
            thread::spawn(move || {
                sem.acquire();
                woke.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst), "acquire returned without a permit");

        sem.release();
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
        assert_eq!(sem.available(), 0);
    }
}
