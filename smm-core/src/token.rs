//! Completion token pool (§3, §4.7).
//!
//! Tokens live in chunks of compile-time size `K`; `first_free_token`
//! advances through the current chunk and, on exhaustion, a new chunk
//! is appended, "implement as chunked vector with a free-frontier
//! pointer, not a concurrent allocator" (§9). Tokens are reused by
//! position: at end-of-SMI the frontier resets to the head, it does
//! not free anything (§4.7, and confirmed an open policy question in
//! §9, deliberately not "fixed" here).
//!
//! SMM cannot call into an allocator mid-SMI, so chunk growth is only
//! safe at init time, before the first SMI runs; see
//! [`TokenPool::reserve`].

use crate::sync::spinlock::RawSpinLock;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// Number of tokens per chunk. Arbitrary but fixed: real platforms size
/// this to the expected number of concurrent broadcasts in flight, not
/// to `N` (a single `startup_all_aps` call uses exactly one token).
pub const CHUNK_SIZE: usize = 64;

/// A single completion token: a spin-lock whose "held" state is the
/// completion signal, paired with the outstanding-CPU refcount.
pub struct Token {
    pub lock: RawSpinLock,
    running_count: AtomicI32,
}

impl Token {
    const fn new() -> Self {
        Self {
            lock: RawSpinLock::new(),
            running_count: AtomicI32::new(0),
        }
    }

    /// Arm the token for `count` outstanding completions and acquire
    /// its lock, so `is_ap_ready`/`try_acquire` reports "still running"
    /// until the last completion releases it.
    pub fn arm(&self, count: i32) {
        self.running_count.store(count, Ordering::SeqCst);
        self.lock.acquire();
    }

    /// Called once per CPU that was *not* dispatched to, at broadcast
    /// time (§4.5), and once per dispatched CPU on completion (§4.4
    /// step 4). Releases the token's lock exactly when the count
    /// reaches zero.
    pub fn complete_one(&self) {
        if self.running_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lock.release();
        }
    }

    pub fn running_count(&self) -> i32 {
        self.running_count.load(Ordering::Relaxed)
    }
}

struct Chunk {
    tokens: [Token; CHUNK_SIZE],
    next: AtomicUsize,
}

impl Chunk {
    fn new() -> Box<Self> {
        Box::new(Self {
            tokens: core::array::from_fn(|_| Token::new()),
            next: AtomicUsize::new(usize::MAX),
        })
    }
}

#[cfg(not(test))]
use alloc::boxed::Box;
#[cfg(test)]
use std::boxed::Box;

/// Chunked free-list of reusable completion tokens.
///
/// `first_free_token` is `(chunk_index, slot_index)`. Getting a free
/// token advances it by one slot; reaching the end of a chunk appends
/// a new one. `reset` rewinds the frontier to the head without
/// touching any token's contents, the next user re-arms whatever
/// state is sitting there, which is safe because the previous holder
/// already released the lock on its own last completion (§4.7).
pub struct TokenPool {
    chunks: RawSpinLock,
    storage: core::cell::UnsafeCell<TokenPoolStorage>,
}

struct TokenPoolStorage {
    chunks: alloc_vec::Vec<Box<Chunk>>,
    frontier_chunk: usize,
    frontier_slot: usize,
}

#[cfg(not(test))]
mod alloc_vec {
    pub use alloc::vec::Vec;
}
#[cfg(test)]
mod alloc_vec {
    pub use std::vec::Vec;
}

unsafe impl Sync for TokenPool {}

impl TokenPool {
    pub const fn new() -> Self {
        Self {
            chunks: RawSpinLock::new(),
            storage: core::cell::UnsafeCell::new(TokenPoolStorage {
                chunks: alloc_vec::Vec::new(),
                frontier_chunk: 0,
                frontier_slot: 0,
            }),
        }
    }

    /// Allocate the first chunk. Must run during init (§4.8), never
    /// mid-SMI.
    pub fn init(&self) {
        let storage = unsafe { &mut *self.storage.get() };
        self.chunks.acquire();
        storage.chunks.push(Chunk::new());
        self.chunks.release();
    }

    /// Obtain a free token and arm it for `count` outstanding
    /// completions, growing the chunk list if the frontier has run off
    /// the end of the last chunk. The returned reference is valid for
    /// the pool's lifetime (tokens are never freed, only reused).
    pub fn get_free_token(&self, count: i32) -> &Token {
        self.chunks.acquire();
        let storage = unsafe { &mut *self.storage.get() };

        if storage.frontier_slot >= CHUNK_SIZE {
            storage.frontier_chunk += 1;
            storage.frontier_slot = 0;
        }
        if storage.frontier_chunk >= storage.chunks.len() {
            storage.chunks.push(Chunk::new());
        }

        let chunk_index = storage.frontier_chunk;
        let slot = storage.frontier_slot;
        storage.frontier_slot += 1;

        // SAFETY: tokens are never moved or freed once a chunk is
        // pushed, so this reference is valid for `&self`'s lifetime.
        let token: &Token = unsafe {
            let chunk_ptr: *const Chunk = &*storage.chunks[chunk_index];
            &(*chunk_ptr).tokens[slot]
        };
        self.chunks.release();

        token.arm(count);
        token
    }

    /// Reset the free-frontier to the head of the first chunk (§4.3
    /// step 10). Idempotent: calling this twice in a row leaves the
    /// frontier unchanged the second time (§8).
    pub fn reset(&self) {
        self.chunks.acquire();
        let storage = unsafe { &mut *self.storage.get() };
        storage.frontier_chunk = 0;
        storage.frontier_slot = 0;
        self.chunks.release();
    }

    /// Number of chunks currently allocated, for diagnostics/tests.
    pub fn chunk_count(&self) -> usize {
        self.chunks.acquire();
        let storage = unsafe { &*self.storage.get() };
        let n = storage.chunks.len();
        self.chunks.release();
        n
    }
}

impl Default for TokenPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_idempotent() {
        let pool = TokenPool::new();
        pool.init();
        let _ = pool.get_free_token(1);
        let _ = pool.get_free_token(1);
        pool.reset();
        let chunks_after_first_reset = pool.chunk_count();
        pool.reset();
        assert_eq!(pool.chunk_count(), chunks_after_first_reset);
    }

    #[test]
    fn growing_past_a_chunk_appends_a_new_one() {
        let pool = TokenPool::new();
        pool.init();
        for _ in 0..CHUNK_SIZE + 1 {
            let _ = pool.get_free_token(1);
        }
        assert_eq!(pool.chunk_count(), 2);
    }

    #[test]
    fn token_lock_releases_on_last_completion() {
        let token = Token::new();
        token.arm(3);
        assert!(!token.lock.try_acquire());
        token.complete_one();
        token.complete_one();
        assert!(!token.lock.try_acquire());
        token.complete_one();
        assert!(token.lock.try_acquire());
    }
}
