//! Test-and-CAS spin-lock (§4.1).
//!
//! Two layers:
//!
//!   - [`RawSpinLock`] is the bare `acquire`/`try_acquire`/`release`
//!     contract the spec calls for, with no notion of "owner". It is
//!     what `busy[i]` (§3) is built on: the *dispatcher* acquires it
//!     and the *AP* releases it (§9), an asymmetric discipline RAII
//!     guards cannot express, since the thread that locks is never the
//!     thread that unlocks.
//!   - [`SpinLock<T>`] wraps a `RawSpinLock` around a protected value
//!     with the usual guard-on-drop ergonomics, for state that really
//!     is acquire/release-by-the-same-caller (the global sync block,
//!     a token's own bookkeeping).
//!
//! Unlike a general-purpose kernel lock, this one does not disable
//! interrupts on acquire: SMM already runs with interrupts masked on
//! every CPU for the duration of the SMI, so there is no local
//! interrupt handler that could re-enter and deadlock against it.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A bare test-and-CAS lock with no attached data.
///
/// `false` means free, `true` means held. CAS failure spins with a
/// `pause` hint before the next attempt, matching the retry discipline
/// every other primitive in this module uses.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spin until the lock is acquired.
    pub fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempt to acquire the lock once. Returns `true` on success.
    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock. May be called by a different logical
    /// processor than the one that acquired it (see `busy[i]`, §9).
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Observe whether the lock is currently held, without acquiring it.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: a RawSpinLock only ever hands out exclusive access through
// its CAS, regardless of which CPU calls acquire/release.
unsafe impl Send for RawSpinLock {}
unsafe impl Sync for RawSpinLock {}

/// A spin-lock guarding a value of type `T`, released automatically
/// when the returned guard is dropped.
///
/// Use this for data where the caller that locks is also the caller
/// that unlocks. For the dispatcher-acquires/AP-releases discipline of
/// `busy[i]`, use [`RawSpinLock`] directly instead.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Exclusive access without locking, valid only while the caller
    /// statically holds `&mut self` (e.g. during single-threaded init).
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion_under_contention() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn raw_lock_can_be_released_by_another_caller() {
        let lock = RawSpinLock::new();
        lock.acquire();
        assert!(lock.is_locked());
        // simulate the AP releasing what the dispatcher acquired
        lock.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire());
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let lock = RawSpinLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
    }
}
