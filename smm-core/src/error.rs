//! Error kinds returned by the dispatch API and the rendezvous path (§7).

use core::fmt;

/// Failure outcomes the core can report without halting.
///
/// `Fatal` is the odd one out: it is never returned to a caller. Code
/// that detects a broken invariant calls [`Error::fatal`] and halts the
/// CPU instead of unwinding, because there is no caller frame left to
/// hand a `Result` to once a rendezvous invariant has been violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Dispatch-API argument failure: bad CPU index, BSP as target, a
    /// CPU scheduled for removal, an unsupported timeout, a null
    /// procedure pointer.
    InvalidParameter,
    /// Dispatch-API target busy (non-blocking try-lock failed), or a
    /// token probe found the procedure still running.
    NotReady,
    /// No APs were eligible for a broadcast, or this AP was excluded
    /// from one.
    NotStarted,
    /// The arrival gate exhausted both phases, or a per-procedure
    /// deadline elapsed.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidParameter => "invalid parameter",
            Error::NotReady => "not ready",
            Error::NotStarted => "not started",
            Error::Timeout => "timeout",
        };
        f.write_str(msg)
    }
}

/// Result alias used throughout the dispatch API.
pub type Result<T> = core::result::Result<T, Error>;

/// Halt the calling CPU after logging an invariant violation.
///
/// Fatal errors are programming errors, not runtime conditions a caller
/// can recover from, per §7 they "halt the CPU; these are... never
/// recovered." Production builds never return from this call. Tests
/// instead panic, since there is no CPU to halt and the panic is what
/// makes the violated invariant visible to the test harness.
#[cold]
pub fn fatal(what: &str) -> ! {
    klog::error!("fatal: {}", what);
    #[cfg(not(test))]
    {
        loop {
            unsafe {
                core::arch::asm!("cli", "hlt", options(nomem, nostack));
            }
        }
    }
    #[cfg(test)]
    {
        panic!("fatal: {}", what);
    }
}
