//! 32-bit CAS semaphore (§4.1).
//!
//! Backs both the per-CPU `run` semaphore and the global check-in
//! `counter`. The sentinel `0xFFFF_FFFF` means "locked down": once a
//! semaphore reaches it, `wait` and `release` both refuse to move it,
//! so lockdown is a one-way door within an SMI.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::UNSET;

/// A 32-bit counter manipulated only through compare-and-swap retries.
pub struct Semaphore {
    value: AtomicU32,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            value: AtomicU32::new(initial),
        }
    }

    /// Current value, for diagnostics only, never used to gate logic,
    /// since it can be stale the instant it is read.
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }

    /// Spin until a decrement succeeds, then return the new value.
    ///
    /// Never decrements below zero and never touches the lockdown
    /// sentinel: if the semaphore is locked down, `wait` spins forever,
    /// because a locked-down semaphore is never meant to be waited on
    /// again within the same SMI.
    pub fn wait(&self) -> u32 {
        loop {
            let v = self.value.load(Ordering::Relaxed);
            if v != 0 && v != UNSET {
                match self.value.compare_exchange_weak(
                    v,
                    v - 1,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return v - 1,
                    Err(_) => {}
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Spin until an increment succeeds, then return the new value.
    ///
    /// Refuses when the current value is `0xFFFF_FFFE`, since
    /// incrementing it would alias the lockdown sentinel (§8), and
    /// refuses outright once the semaphore is already locked down.
    pub fn release(&self) -> u32 {
        loop {
            let v = self.value.load(Ordering::Relaxed);
            if v == UNSET {
                // Already locked down; a release here would be a
                // protocol bug in the caller, but the primitive itself
                // just never succeeds rather than panicking.
                core::hint::spin_loop();
                continue;
            }
            if v + 1 != UNSET {
                match self.value.compare_exchange_weak(
                    v,
                    v + 1,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return v + 1,
                    Err(_) => {}
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Force the semaphore to the lockdown sentinel, returning the
    /// value observed immediately beforehand. Monotone within an SMI:
    /// once locked down, a second call is a no-op that returns
    /// `0xFFFF_FFFF`.
    pub fn lockdown(&self) -> u32 {
        loop {
            let v = self.value.load(Ordering::Relaxed);
            match self.value.compare_exchange_weak(
                v,
                UNSET,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return v,
                Err(_) => core::hint::spin_loop(),
            }
        }
    }

    /// Reset to a fresh value, e.g. `counter = 0` at end-of-SMI (§4.3
    /// step 10). Not atomic with respect to concurrent waiters by
    /// design, only the BSP calls this, after every AP has already
    /// been released past its last wait on this SMI.
    pub fn reset(&self, value: u32) {
        self.value.store(value, Ordering::SeqCst);
    }

    pub fn is_locked_down(&self) -> bool {
        self.value.load(Ordering::Relaxed) == UNSET
    }

    /// Check in: like [`Semaphore::release`], but returns immediately
    /// instead of spinning when the semaphore is already locked down
    /// (§4.6: "if `release(counter)` returns 0, the BSP has already
    /// locked down and we are too late"). `None` signals the lockdown
    /// case; `Some(v)` carries the post-increment value on success.
    pub fn release_or_locked(&self) -> Option<u32> {
        loop {
            let v = self.value.load(Ordering::Relaxed);
            if v == UNSET {
                return None;
            }
            if v + 1 != UNSET {
                match self.value.compare_exchange_weak(
                    v,
                    v + 1,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(v + 1),
                    Err(_) => continue,
                }
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_never_goes_negative() {
        let sem = Semaphore::new(0);
        // wait() would spin forever at 0; release first.
        sem.release();
        assert_eq!(sem.wait(), 0);
    }

    #[test]
    fn release_guard_rejects_the_aliasing_step() {
        // White-box: release()'s CAS guard is `v + 1 != UNSET`, so at
        // v == UNSET - 1 the guard must be false and the CAS must
        // never fire, rather than silently entering lockdown state.
        let v = UNSET - 1;
        assert_eq!(v.wrapping_add(1), UNSET);
        assert!(!(v.wrapping_add(1) != UNSET));
    }

    #[test]
    fn lockdown_is_monotone() {
        let sem = Semaphore::new(4);
        let prior = sem.lockdown();
        assert_eq!(prior, 4);
        assert!(sem.is_locked_down());
        let prior_again = sem.lockdown();
        assert_eq!(prior_again, UNSET);
        assert!(sem.is_locked_down());
    }

    #[test]
    fn release_or_locked_reports_lockdown_without_spinning() {
        let sem = Semaphore::new(3);
        sem.lockdown();
        assert_eq!(sem.release_or_locked(), None);
    }

    #[test]
    fn release_or_locked_behaves_like_release_before_lockdown() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.release_or_locked(), Some(1));
    }

    #[test]
    fn concurrent_release_and_wait_balance() {
        let sem = Arc::new(Semaphore::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let sem = Arc::clone(&sem);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    sem.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sem.load(), 400);
        for _ in 0..400 {
            sem.wait();
        }
        assert_eq!(sem.load(), 0);
    }
}
