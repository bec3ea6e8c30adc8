//! Per-CPU state block (§3).
//!
//! One of these exists per logical processor, fixed at index `0..N-1`
//! for the lifetime of the firmware. `present` is the only field
//! anyone outside owner-CPU `i` is allowed to write, every other
//! mutable field is guarded either by `busy` or by the positional
//! wait/release pairing documented on [`crate::bsp`] and [`crate::ap`].

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crate::sync::spinlock::RawSpinLock;
use crate::sync::Semaphore;
use crate::token::Token;

/// Caller-supplied procedure signature for dispatched work (§4.5),
/// matching the shape a C ABI upcall table would hand the core: an
/// opaque parameter pointer in, a status code out.
pub type Procedure = extern "C" fn(*mut u8) -> isize;

/// One logical processor's slot in the rendezvous protocol.
pub struct PerCpu {
    /// True while this CPU is inside SMM for the current SMI run.
    /// Written only by the owning CPU; read by anyone.
    present: AtomicBool,
    /// Pulsed by the BSP, consumed by the AP (or vice versa during the
    /// MTRR exchange phases). 0 = wait, nonzero = proceed.
    pub run: Semaphore,
    /// Held while a dispatched procedure is in flight on this CPU.
    /// Acquired by the dispatcher, released by the AP (§9), do not
    /// treat this as a normal mutex.
    pub busy: RawSpinLock,
    procedure: AtomicPtr<()>,
    parameter: AtomicPtr<u8>,
    status: AtomicPtr<isize>,
    token: AtomicPtr<Token>,
}

impl PerCpu {
    pub const fn new() -> Self {
        Self {
            present: AtomicBool::new(false),
            run: Semaphore::new(0),
            busy: RawSpinLock::new(),
            procedure: AtomicPtr::new(core::ptr::null_mut()),
            parameter: AtomicPtr::new(core::ptr::null_mut()),
            status: AtomicPtr::new(core::ptr::null_mut()),
            token: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Set by the owning CPU only, on rendezvous entry.
    pub fn mark_present(&self) {
        self.present.store(true, Ordering::Release);
    }

    /// Cleared by the owning CPU only, on rendezvous exit / BSP reset.
    pub fn clear_present(&self) {
        self.present.store(false, Ordering::Release);
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    /// Write the dispatcher's procedure/parameter/token triple. Caller
    /// must already hold `busy` for this CPU (§5: "written only while
    /// `busy[i]` is held").
    pub fn dispatch(
        &self,
        procedure: Procedure,
        parameter: *mut u8,
        status: *mut isize,
        token: *mut Token,
    ) {
        self.procedure.store(procedure as *mut (), Ordering::Relaxed);
        self.parameter.store(parameter, Ordering::Relaxed);
        self.status.store(status, Ordering::Relaxed);
        self.token.store(token, Ordering::Release);
    }

    /// Read back the dispatched procedure, if any. Called by the AP
    /// from inside its work loop while it holds `busy` for its own index.
    pub fn take_dispatch(&self) -> Option<(Procedure, *mut u8, *mut isize, *mut Token)> {
        let raw = self.procedure.swap(core::ptr::null_mut(), Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // SAFETY: non-null only while a dispatcher stored a real
        // `Procedure` function pointer via `dispatch`.
        let procedure: Procedure = unsafe { core::mem::transmute(raw) };
        let parameter = self.parameter.swap(core::ptr::null_mut(), Ordering::Relaxed);
        let status = self.status.swap(core::ptr::null_mut(), Ordering::Relaxed);
        let token = self.token.swap(core::ptr::null_mut(), Ordering::Relaxed);
        Some((procedure, parameter, status, token))
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: all mutable access is mediated by `busy` or by the
// single-owner-write rule documented on each field.
unsafe impl Sync for PerCpu {}

/// APIC ID table entry, separate from [`PerCpu`] because it is fixed at
/// init time (§4.8) and never mutated by the rendezvous protocol.
pub struct CpuIdentity {
    pub apic_id: AtomicU32,
    pub package_id: AtomicU32,
}

impl CpuIdentity {
    pub const fn new() -> Self {
        Self {
            apic_id: AtomicU32::new(u32::MAX),
            package_id: AtomicU32::new(u32::MAX),
        }
    }
}

impl Default for CpuIdentity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn returns_param_as_status(param: *mut u8) -> isize {
        param as isize
    }

    #[test]
    fn take_dispatch_round_trips_and_clears_the_slot() {
        let cpu = PerCpu::new();
        let mut status: isize = -1;
        cpu.dispatch(returns_param_as_status, 0x2a as *mut u8, &mut status, core::ptr::null_mut());

        let (procedure, parameter, status_ptr, token_ptr) =
            cpu.take_dispatch().expect("a procedure was dispatched");
        assert_eq!(procedure(parameter), 0x2a);
        assert!(!status_ptr.is_null());
        assert!(token_ptr.is_null());

        assert!(cpu.take_dispatch().is_none());
    }

    #[test]
    fn present_flag_is_false_until_marked() {
        let cpu = PerCpu::new();
        assert!(!cpu.is_present());
        cpu.mark_present();
        assert!(cpu.is_present());
        cpu.clear_present();
        assert!(!cpu.is_present());
    }
}
