//! Multiprocessor rendezvous and dispatch core for an SMM handler.
//!
//! Every logical processor in the system traps into this code on a
//! System Management Interrupt. One of them is elected BSP and drives
//! the shared protocol (MTRR save/replace/restore, foundation dispatch,
//! release); the rest run as APs, serving dispatched procedures until
//! released. There is no allocator, no OS, and no interrupts here, the
//! only synchronization primitive available is a cache-coherent atomic
//! compare-and-swap plus a pause hint.
//!
//! Everything this crate cannot observe on its own, SMI IPI delivery,
//! MTRR MSR access, platform SMI validity, hot-plug bookkeeping, sits
//! behind the [`platform::Platform`] trait, which lets the whole state
//! machine run against a mock on a host instead of real SMRAM. Hardware
//! builds plug in a `khal`-backed implementation; tests plug in
//! `platform::tests::MockPlatform` (see the `sync` and `rendezvous`
//! test modules for multi-thread simulations of an SMI run).
#![cfg_attr(not(test), no_std)]

#[cfg(not(test))]
extern crate alloc;

pub mod ap;
pub mod arrival_gate;
pub mod bsp;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod global;
pub mod native;
pub mod percpu;
pub mod platform;
pub mod rendezvous;
pub mod sync;
pub mod token;

pub use coordinator::Coordinator;
pub use error::Error;
pub use native::{ChipsetHooks, NativePlatform};
pub use platform::Platform;

/// Sentinel used throughout the core for "unset" 32-bit slots: the
/// semaphore lockdown value, the unelected `bsp_index`, and the
/// non-blocking self-startup token marker all reuse it (§3).
pub const UNSET: u32 = 0xFFFF_FFFF;
