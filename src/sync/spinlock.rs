//! # Spin Lock
//!
//! A single word that is either free (0) or held (1). Every transition goes
//! through an atomic exchange, so the lock works across cores without any
//! scheduler support. There is no owner tracking: releasing a lock the caller
//! does not hold is a caller bug.
//!
//! Only suitable for very short critical sections. Code running in an
//! interrupt handler must never take a lock that the interrupted code on the
//! same core might hold; nested acquisition deadlocks.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

const FREE: u32 = 0;
const HELD: u32 = 1;

pub struct SpinLock {
    word: AtomicU32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self { word: AtomicU32::new(FREE) }
    }

    /// Spin until the lock is ours. Never times out.
    pub fn acquire(&self) {
        while self.word.swap(HELD, Ordering::Acquire) != FREE {
            core::hint::spin_loop();
        }
    }

    /// Single exchange attempt; `true` if the lock was taken.
    pub fn try_acquire(&self) -> bool {
        self.word.swap(HELD, Ordering::Acquire) == FREE
    }

    /// Publish every store made under the lock, then free it.
    pub fn release(&self) {
        self.word.store(FREE, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != FREE
    }

    pub fn with_lock<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.acquire();
        let _guard = ReleaseOnDrop { lock: self };
        f()
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

struct ReleaseOnDrop<'a> {
    lock: &'a SpinLock,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A value that can only be reached while holding its [`SpinLock`].
pub struct Locked<T> {
    lock: SpinLock,
    value: UnsafeCell<T>,
}

// Safety: the UnsafeCell is only reachable through a guard, and a guard only
// exists while the spin lock is held.
unsafe impl<T: Send> Sync for Locked<T> {}

impl<T> Locked<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: SpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> LockedGuard<'_, T> {
        self.lock.acquire();
        LockedGuard { owner: self }
    }

    pub fn try_lock(&self) -> Option<LockedGuard<'_, T>> {
        if self.lock.try_acquire() {
            Some(LockedGuard { owner: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

pub struct LockedGuard<'a, T> {
    owner: &'a Locked<T>,
}

impl<T> Deref for LockedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for LockedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for LockedGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_acquire_fails_while_held() {
        let lock = SpinLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        assert!(lock.is_locked());

        lock.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire());
    }

    #[test]
    fn acquire_after_release() {
        let lock = SpinLock::new();
        lock.acquire();
        lock.release();
        lock.acquire();
        assert!(lock.is_locked());
        lock.release();
    }

    #[test]
    fn with_lock_releases_afterwards() {
        let lock = SpinLock::new();
        let value = lock.with_lock(|| 7);
        assert_eq!(value, 7);
        assert!(!lock.is_locked());
    }

    #[test]
    fn guard_releases_on_drop() {
        let cell = Locked::new(5u32);
        {
            let mut guard = cell.lock();
            *guard += 1;
            assert!(cell.try_lock().is_none());
        }
        assert_eq!(*cell.lock(), 6);
        assert!(!cell.is_locked());
    }

    #[test]
    fn contended_increments_are_not_lost() {
        let counter = Arc::new(Locked::new(0u64));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*counter.lock(), 40_000);
    }
}
