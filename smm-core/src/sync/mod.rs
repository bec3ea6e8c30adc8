//! Synchronization primitives for the rendezvous core (§4.1).
//!
//! SMM has no scheduler to hide behind: every wait here is a busy spin
//! with a `pause` hint between attempts, and every shared word is a
//! true atomic, never a relaxed flag dressed up with ordering
//! annotations. Two primitives cover the whole protocol:
//!
//!   - [`spinlock`], mutual exclusion, with the asymmetric
//!     acquire-by-dispatcher/release-by-AP discipline `busy[i]` needs.
//!   - [`semaphore`], a 32-bit counter with `wait`/`release`/`lockdown`,
//!     used for the per-CPU `run` semaphore and the global check-in
//!     `counter`.

pub mod semaphore;
pub mod spinlock;

pub use semaphore::Semaphore;
pub use spinlock::SpinLock;
