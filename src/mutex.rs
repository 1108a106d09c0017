// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The spin lock guarding waiter lists.
//!
//! Critical sections in this crate are a handful of pointer writes, so a
//! test-and-test-and-set spin lock with exponential backoff is all that is
//! needed. Wakers are always invoked after the guard is dropped.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::util::{Backoff, loom_const_fn};
use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};

pub(crate) struct Mutex<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
#[clippy::has_significant_drop]
#[must_use = "if unused the Mutex will immediately unlock"]
pub(crate) struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: exclusive access to the inner data is handed out only through the
// guard, which requires holding the lock.
unsafe impl<T: Send> Send for Mutex<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    loom_const_fn! {
        pub(crate) const fn new(val: T) -> Mutex<T> {
            Mutex {
                lock: AtomicBool::new(false),
                data: UnsafeCell::new(val),
            }
        }
    }
}

impl<T> Mutex<T> {
    /// Creates a new `MutexGuard` without checking if the mutex is locked.
    ///
    /// # Safety
    ///
    /// This method must only be called if the thread logically holds the lock.
    #[inline]
    unsafe fn make_guard_unchecked(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            mutex: self,
            marker: PhantomData,
        }
    }

    /// Acquires the mutex, spinning until it is able to do so.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        let mut boff = Backoff::default();
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.spin();
            }
        }

        // Safety: the lock is held, as required.
        unsafe { self.make_guard_unchecked() }
    }

    /// Attempts to acquire this lock without spinning.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // Safety: the lock is held, as required.
            Some(unsafe { self.make_guard_unchecked() })
        } else {
            None
        }
    }

    /// Checks whether the mutex is currently locked.
    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Forcibly unlocks the mutex.
    ///
    /// # Safety
    ///
    /// This method must only be called if the current thread logically owns a
    /// `MutexGuard` but that guard has been discarded using `mem::forget`.
    #[inline]
    unsafe fn force_unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

// Safety: the guard hands out shared access only while the lock is held.
unsafe impl<'a, T: Sync + 'a> Sync for MutexGuard<'a, T> {}

impl<'a, T: 'a> MutexGuard<'a, T> {
    /// Temporarily releases the lock, runs `f`, and re-acquires the lock
    /// before returning.
    ///
    /// This is used by the bulk wake paths to invoke wakers between batches
    /// without holding the waiter list locked.
    pub(crate) fn unlocked<F, U>(s: &mut Self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        struct DropGuard<'a, T> {
            mutex: &'a Mutex<T>,
        }
        impl<T> Drop for DropGuard<'_, T> {
            fn drop(&mut self) {
                mem::forget(self.mutex.lock());
            }
        }

        // Safety: a MutexGuard always holds the lock.
        unsafe {
            s.mutex.force_unlock();
        }
        let _guard = DropGuard { mutex: s.mutex };
        f()
    }
}

impl<'a, T: 'a> Deref for MutexGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: a MutexGuard always holds the lock, so it is safe to access
        // the data.
        self.mutex.data.with(|data| unsafe { &*data })
    }
}

impl<'a, T: 'a> DerefMut for MutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: a MutexGuard always holds the lock, so it is safe to access
        // the data.
        self.mutex.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<'a, T: 'a> Drop for MutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: a MutexGuard always holds the lock.
        unsafe {
            self.mutex.force_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;
    use crate::loom::thread;

    #[test]
    fn smoke() {
        loom::model(|| {
            let m = Mutex::new(());
            drop(m.lock());
            drop(m.lock());
        });
    }

    #[test]
    fn try_lock() {
        loom::model(|| {
            let mutex = Mutex::new(42);

            let a = mutex.try_lock();
            assert_eq!(a.as_ref().map(|r| **r), Some(42));

            // Additional lock fails
            let b = mutex.try_lock();
            assert!(b.is_none());

            // After dropping lock, it succeeds again
            drop(a);
            let c = mutex.try_lock();
            assert_eq!(c.as_ref().map(|r| **r), Some(42));
        });
    }

    #[test]
    fn unlocked_relocks() {
        loom::model(|| {
            let mutex = Mutex::new(0);
            let mut guard = mutex.lock();
            *guard += 1;
            MutexGuard::unlocked(&mut guard, || {
                assert!(mutex.try_lock().is_some());
            });
            *guard += 1;
            drop(guard);
            assert_eq!(*mutex.lock(), 2);
        });
    }

    #[test]
    fn basic_multi_threaded() {
        fn incr(lock: &Arc<Mutex<i32>>) -> thread::JoinHandle<()> {
            let lock = lock.clone();
            thread::spawn(move || {
                let mut lock = lock.lock();
                *lock += 1;
            })
        }

        loom::model(|| {
            let lock = Arc::new(Mutex::new(0));
            let t1 = incr(&lock);
            let t2 = incr(&lock);

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(*lock.lock(), 2);
        });
    }
}
