//! The big lock: only the thread that holds it may run guest code or touch
//! engine state.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
pub struct BigLock<T> {
    inner: Mutex<T>,
}

impl<T> BigLock<T> {
    pub fn new(val: T) -> Self {
        Self {
            inner: Mutex::new(val),
        }
    }

    pub fn lock(&self) -> BigLockGuard<'_, T> {
        BigLockGuard {
            lock: self,
            guard: Some(self.inner.lock().unwrap()),
        }
    }
}

/// Holding one of these means holding the big lock.
pub struct BigLockGuard<'a, T> {
    lock: &'a BigLock<T>,
    // Only `None` for the duration of `unlocked`.
    guard: Option<MutexGuard<'a, T>>,
}

impl<'a, T> BigLockGuard<'a, T> {
    /// Releases the lock while running `f`, e.g. for a syscall that may block.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        drop(self.guard.take());
        let rv = f();
        self.guard = Some(self.lock.inner.lock().unwrap());
        rv
    }

    /// Lets other threads take the lock, then takes it back.
    pub fn yield_lock(&mut self) {
        self.unlocked(std::thread::yield_now)
    }
}

impl<'a, T> Deref for BigLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.guard.as_deref().unwrap()
    }
}

impl<'a, T> DerefMut for BigLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_deref_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_unlocked_lets_others_in() {
        let lock = Arc::new(BigLock::new(0u32));
        let mut guard = lock.lock();
        *guard += 1;

        let other = Arc::clone(&lock);
        guard.unlocked(|| {
            std::thread::spawn(move || *other.lock() += 10)
                .join()
                .unwrap();
        });
        assert_eq!(*guard, 11);
    }
}
