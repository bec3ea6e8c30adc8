//! Hardware Abstraction Layer for the SMM MP core.
//!
//! Everything the rendezvous core treats as an opaque platform
//! collaborator (§6), APIC IPI delivery, MSR/MTRR access, CR2
//! save/restore, serial diagnostics, lives here, concentrating the
//! `unsafe` the core itself never has to touch.
#![no_std]

pub mod apic;
pub mod cr2;
pub mod mtrr;
pub mod port;
pub mod serial;

pub use serial::Serial;
