//! Dispatch API (§4.5).
//!
//! Called by foundation code running inside the BSP handler (or,
//! indirectly, by an AP's own dispatched procedure) to schedule work
//! on one or every present AP. Writes into [`crate::percpu::PerCpu`]
//! slots and pulses `run` semaphores the AP work loop in
//! [`crate::ap`] is waiting on.

use crate::error::{Error, Result};
use crate::percpu::{PerCpu, Procedure};
use crate::token::{Token, TokenPool};

#[cfg(not(test))]
use alloc::vec::Vec;

/// How the caller wants to be notified of completion (§4.5).
///
/// The spec text describes this as a single `token` pointer with an
/// internal sentinel distinguishing "non-blocking, fire and forget"
/// from "block the caller" and "give me a probeable token"; the three
/// cases are expressed directly as variants here instead of an
/// out-of-band sentinel value.
pub enum Completion<'a> {
    /// Block the caller until the procedure finishes.
    Blocking,
    /// Dispatch and return immediately with no way to observe completion.
    NonBlockingNoToken,
    /// Dispatch and hand back a token the caller can probe later with
    /// [`is_ap_ready`].
    WithToken(&'a mut *const Token),
}

/// Dispatch context: everything the API needs to validate and act on
/// a target CPU, without owning the rendezvous state itself.
pub struct DispatchCtx<'a> {
    pub per_cpu: &'a [PerCpu],
    pub tokens: &'a TokenPool,
    pub executing_cpu: usize,
    pub supports_timeout: bool,
    pub is_valid_apic_id: &'a dyn Fn(usize) -> bool,
    pub is_marked_for_removal: &'a dyn Fn(usize) -> bool,
}

fn validate_target(ctx: &DispatchCtx<'_>, cpu: usize, timeout: u64) -> Result<()> {
    if cpu >= ctx.per_cpu.len() {
        return Err(Error::InvalidParameter);
    }
    if cpu == ctx.executing_cpu {
        return Err(Error::InvalidParameter);
    }
    if !(ctx.is_valid_apic_id)(cpu) {
        return Err(Error::InvalidParameter);
    }
    if !ctx.per_cpu[cpu].is_present() {
        return Err(Error::InvalidParameter);
    }
    if (ctx.is_marked_for_removal)(cpu) {
        return Err(Error::InvalidParameter);
    }
    if timeout != 0 && !ctx.supports_timeout {
        return Err(Error::InvalidParameter);
    }
    Ok(())
}

/// `startup_this_ap(proc, cpu, args, token?, timeout, status?)` (§4.5).
pub fn startup_this_ap(
    ctx: &DispatchCtx<'_>,
    procedure: Procedure,
    cpu: usize,
    parameter: *mut u8,
    completion: Completion<'_>,
    timeout: u64,
    status: Option<&mut isize>,
) -> Result<()> {
    validate_target(ctx, cpu, timeout)?;

    let target = &ctx.per_cpu[cpu];
    target.busy.acquire();

    let status_ptr = match status {
        Some(s) => {
            *s = Error::NotReady as isize * -1;
            s as *mut isize
        }
        None => core::ptr::null_mut(),
    };

    let blocking = matches!(completion, Completion::Blocking);
    let token_ptr: *mut Token = match completion {
        Completion::WithToken(slot) => {
            let acquired = ctx.tokens.get_free_token(1);
            *slot = acquired as *const Token;
            acquired as *const Token as *mut Token
        }
        Completion::Blocking | Completion::NonBlockingNoToken => core::ptr::null_mut(),
    };

    target.dispatch(procedure, parameter, status_ptr, token_ptr);
    target.run.release();

    if blocking {
        // Block until the AP releases busy on completion (§4.5: "acquire
        // busy[cpu] again ... then immediately release it").
        target.busy.acquire();
        target.busy.release();
    }

    Ok(())
}

/// `startup_all_aps(proc, timeout, args, token?, status?)` (§4.5).
///
/// `status` is a caller-provided slice with one entry per CPU; entries
/// for absent CPUs are written `NotStarted`.
pub fn startup_all_aps(
    ctx: &DispatchCtx<'_>,
    procedure: Procedure,
    parameter: *mut u8,
    mut token_slot: Option<&mut *const Token>,
    statuses: Option<&mut [isize]>,
) -> Result<()> {
    let n = ctx.per_cpu.len();

    let mut any_present = false;
    for i in 0..n {
        if i == ctx.executing_cpu {
            continue;
        }
        if !ctx.per_cpu[i].is_present() {
            continue;
        }
        any_present = true;
        if (ctx.is_marked_for_removal)(i) {
            return Err(Error::InvalidParameter);
        }
        if !ctx.per_cpu[i].busy.try_acquire() {
            return Err(Error::NotReady);
        }
        ctx.per_cpu[i].busy.release();
    }
    if !any_present {
        return Err(Error::NotStarted);
    }

    let n_max = (n - 1) as i32;
    let token: Option<&Token> = token_slot.as_mut().map(|slot| {
        let acquired = ctx.tokens.get_free_token(n_max);
        **slot = acquired as *const Token;
        acquired
    });

    // Acquire every present AP's busy lock, blocking this time (§4.5).
    let mut dispatched = Vec::new();
    for i in 0..n {
        if i == ctx.executing_cpu || !ctx.per_cpu[i].is_present() {
            continue;
        }
        ctx.per_cpu[i].busy.acquire();
        dispatched.push(i);
    }

    for i in 0..n {
        if i == ctx.executing_cpu {
            continue;
        }
        let status_ptr = statuses
            .as_ref()
            .map(|s| &s[i] as *const isize as *mut isize)
            .unwrap_or(core::ptr::null_mut());

        if ctx.per_cpu[i].is_present() {
            let token_ptr = token
                .map(|t| t as *const Token as *mut Token)
                .unwrap_or(core::ptr::null_mut());
            ctx.per_cpu[i].dispatch(procedure, parameter, status_ptr, token_ptr);
        } else {
            if !status_ptr.is_null() {
                unsafe {
                    *status_ptr = Error::NotStarted as isize * -1;
                }
            }
            if let Some(t) = token {
                t.complete_one();
            }
        }
    }

    for &i in &dispatched {
        ctx.per_cpu[i].run.release();
    }

    if token.is_none() {
        // No token requested: block until every dispatched AP's busy
        // lock becomes re-acquirable, proving the work completed.
        for &i in &dispatched {
            loop {
                if ctx.per_cpu[i].busy.try_acquire() {
                    ctx.per_cpu[i].busy.release();
                    break;
                }
                core::hint::spin_loop();
            }
        }
    }

    Ok(())
}

/// `is_ap_ready(lock)` (§4.5): probe whether a dispatched procedure has
/// completed, without blocking.
pub fn is_ap_ready(token: &Token) -> Result<()> {
    if token.lock.try_acquire() {
        token.lock.release();
        Ok(())
    } else {
        Err(Error::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        per_cpu: &'a [PerCpu],
        tokens: &'a TokenPool,
        executing_cpu: usize,
    ) -> DispatchCtx<'a> {
        DispatchCtx {
            per_cpu,
            tokens,
            executing_cpu,
            supports_timeout: false,
            is_valid_apic_id: &|_| true,
            is_marked_for_removal: &|_| false,
        }
    }

    extern "C" fn noop(_param: *mut u8) -> isize {
        0
    }

    #[test]
    fn startup_this_ap_rejects_absent_target() {
        // Scenario 4 (§8): blocking to a CPU that is not present.
        let per_cpu: Vec<PerCpu> = (0..2).map(|_| PerCpu::new()).collect();
        let tokens = TokenPool::new();
        tokens.init();
        let dispatch_ctx = ctx(&per_cpu, &tokens, 0);

        let result = startup_this_ap(
            &dispatch_ctx,
            noop,
            1,
            core::ptr::null_mut(),
            Completion::NonBlockingNoToken,
            0,
            None,
        );
        assert_eq!(result, Err(Error::InvalidParameter));
        assert!(!per_cpu[1].busy.is_locked());
    }

    #[test]
    fn startup_this_ap_rejects_self_target() {
        let per_cpu: Vec<PerCpu> = (0..2).map(|_| PerCpu::new()).collect();
        per_cpu[0].mark_present();
        let tokens = TokenPool::new();
        tokens.init();
        let dispatch_ctx = ctx(&per_cpu, &tokens, 0);

        let result = startup_this_ap(
            &dispatch_ctx,
            noop,
            0,
            core::ptr::null_mut(),
            Completion::NonBlockingNoToken,
            0,
            None,
        );
        assert_eq!(result, Err(Error::InvalidParameter));
    }

    #[test]
    fn startup_all_aps_reports_not_started_when_none_present() {
        let per_cpu: Vec<PerCpu> = (0..4).map(|_| PerCpu::new()).collect();
        let tokens = TokenPool::new();
        tokens.init();
        let dispatch_ctx = ctx(&per_cpu, &tokens, 0);

        let result = startup_all_aps(&dispatch_ctx, noop, core::ptr::null_mut(), None, None);
        assert_eq!(result, Err(Error::NotStarted));
    }

    #[test]
    fn startup_all_aps_with_token_accounts_for_absent_cpu() {
        // Scenario 5 (§8): 4 CPUs, 3 present (CPU 3 absent).
        let per_cpu: Vec<PerCpu> = (0..4).map(|_| PerCpu::new()).collect();
        per_cpu[1].mark_present();
        per_cpu[2].mark_present();
        let tokens = TokenPool::new();
        tokens.init();
        let dispatch_ctx = ctx(&per_cpu, &tokens, 0);

        let mut token_ptr: *const Token = core::ptr::null();
        startup_all_aps(
            &dispatch_ctx,
            noop,
            core::ptr::null_mut(),
            Some(&mut token_ptr),
            None,
        )
        .unwrap();

        assert!(!token_ptr.is_null());
        let token = unsafe { &*token_ptr };
        // n_max = 3 (N - 1), minus one immediate decrement for the
        // absent CPU 3, leaves 2 outstanding for CPUs 1 and 2.
        assert_eq!(token.running_count(), 2);
        assert!(is_ap_ready(token).is_err());

        token.complete_one();
        token.complete_one();
        assert!(is_ap_ready(token).is_ok());
    }
}
