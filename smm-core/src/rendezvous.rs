//! SMI rendezvous entry/exit (§4.6).
//!
//! The single point of entry every logical processor traps to on an SMI.
//! Classifies the trapping CPU as BSP or AP for this run, hands off to
//! [`crate::bsp`] or [`crate::ap`], then walks back out in the reverse
//! order. One-time SMM bring-up (relocation, page tables, per-CPU SMI
//! stacks) happens before this code ever runs and is out of scope here
//! (§1), by the time `run` is called, the CPU already has a working
//! SMM environment and only needs classifying.

use core::sync::atomic::AtomicI32;

use crate::ap::{self, ApContext, ApOutcome};
use crate::bsp::{self, BspContext};
use crate::global::GlobalSync;
use crate::percpu::PerCpu;
use crate::platform::Platform;
use crate::token::TokenPool;

#[cfg(not(test))]
fn save_cr2() -> u64 {
    khal::cr2::read()
}
#[cfg(test)]
fn save_cr2() -> u64 {
    0
}

#[cfg(not(test))]
fn restore_cr2(value: u64) {
    unsafe {
        khal::cr2::write(value);
    }
}
#[cfg(test)]
fn restore_cr2(_value: u64) {}

/// Outcome of one rendezvous pass, mostly useful to tests and to
/// diagnostics logging at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousOutcome {
    /// This CPU ran the BSP handler.
    RanAsBsp,
    /// This CPU ran the AP handler and served at least the check-in;
    /// `outcome` distinguishes a normal exit from giving up early.
    RanAsAp(ApOutcome),
    /// The SMI was not valid for this handler and the BSP has not
    /// entered yet; exited without checking in.
    NotValid,
    /// This CPU arrived after `counter` was already locked down for
    /// the running SMI (§4.6, §8 scenario 6); exited without touching
    /// `present`.
    TooLateCheckingIn,
}

/// Everything the rendezvous path needs beyond what [`Platform`] supplies.
pub struct RendezvousContext<'a, P: Platform> {
    pub platform: &'a P,
    pub global: &'a GlobalSync,
    pub per_cpu: &'a [PerCpu],
    pub tokens: &'a TokenPool,
    pub first_thread_of_package: &'a [AtomicI32],
    pub cpu_index: usize,
}

// Manual impls instead of `#[derive(Clone, Copy)]`: derive would add a
// spurious `P: Copy` bound even though every field here is a reference
// or a plain integer, copyable regardless of whether `P` itself is.
impl<'a, P: Platform> Clone for RendezvousContext<'a, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, P: Platform> Copy for RendezvousContext<'a, P> {}

fn elect_bsp<P: Platform>(platform: &P, global: &GlobalSync, cpu_index: usize) -> bool {
    match platform.platform_bsp_election(cpu_index) {
        Ok(Some(is_bsp)) => is_bsp,
        // No platform override, or the platform declined to decide:
        // fall back to the default CAS race on `bsp_index` (§4.6).
        Ok(None) | Err(_) => global.try_elect_bsp(cpu_index),
    }
}

/// Run one full rendezvous pass for the calling CPU (§4.6).
pub fn run<P: Platform>(ctx: &RendezvousContext<'_, P>) -> RendezvousOutcome {
    let RendezvousContext {
        platform,
        global,
        per_cpu,
        tokens,
        first_thread_of_package,
        cpu_index,
    } = *ctx;

    let saved_cr2 = save_cr2();
    platform.rendezvous_entry(cpu_index);

    if let Some(hook) = global.startup_hook.get() {
        (hook.procedure)(hook.args);
    }

    let valid = platform.platform_valid_smi();
    let bsp_in_progress = global.is_inside_smm();
    if !bsp_in_progress && !valid {
        platform.rendezvous_exit(cpu_index);
        restore_cr2(saved_cr2);
        return RendezvousOutcome::NotValid;
    }

    if global.counter.release_or_locked().is_none() {
        // Too late: the BSP already locked the counter down for this
        // SMI. Wait for it to finish releasing everyone else before
        // exiting, so this CPU never races the next SMI's rendezvous.
        while global.is_all_cpus_in_sync() {
            core::hint::spin_loop();
        }
        platform.rendezvous_exit(cpu_index);
        restore_cr2(saved_cr2);
        return RendezvousOutcome::TooLateCheckingIn;
    }

    let outcome = if bsp_in_progress {
        let bsp_index = global.bsp_index().unwrap_or(cpu_index);
        let bsp_apic_id = if bsp_index < per_cpu.len() {
            Some(bsp_index as u32)
        } else {
            None
        };
        let ap_ctx = ApContext {
            platform,
            global,
            per_cpu,
            cpu_index,
            bsp_index,
            bsp_apic_id,
        };
        let wait_for_inside_smm = || global.is_inside_smm();
        RendezvousOutcome::RanAsAp(ap::run(&ap_ctx, wait_for_inside_smm))
    } else if elect_bsp(platform, global, cpu_index) {
        let bsp_ctx = BspContext {
            platform,
            global,
            per_cpu,
            tokens,
            first_thread_of_package,
            bsp_index: cpu_index,
        };
        bsp::run(&bsp_ctx);
        RendezvousOutcome::RanAsBsp
    } else {
        let bsp_index = global.bsp_index().unwrap_or(cpu_index);
        let bsp_apic_id = if bsp_index < per_cpu.len() {
            Some(bsp_index as u32)
        } else {
            None
        };
        let ap_ctx = ApContext {
            platform,
            global,
            per_cpu,
            cpu_index,
            bsp_index,
            bsp_apic_id,
        };
        let wait_for_inside_smm = || global.is_inside_smm();
        RendezvousOutcome::RanAsAp(ap::run(&ap_ctx, wait_for_inside_smm))
    };

    // Barrier: neither role proceeds past rendezvous exit until the
    // BSP's final step has cleared `all_cpus_in_sync` (§4.3 step 10).
    while global.is_all_cpus_in_sync() {
        core::hint::spin_loop();
    }

    platform.rendezvous_exit(cpu_index);
    restore_cr2(saved_cr2);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::SyncMode;
    use crate::platform::tests::MockPlatform;
    use core::sync::atomic::AtomicI32;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn not_valid_smi_exits_without_checking_in() {
        let mut platform = MockPlatform::new(vec![0], false);
        platform.valid_smi = std::sync::atomic::AtomicBool::new(false);
        let global = GlobalSync::new(SyncMode::Traditional);
        let per_cpu: Vec<PerCpu> = (0..1).map(|_| PerCpu::new()).collect();
        let tokens = TokenPool::new();
        tokens.init();
        let packages: [AtomicI32; 1] = [AtomicI32::new(-1)];

        let ctx = RendezvousContext {
            platform: &platform,
            global: &global,
            per_cpu: &per_cpu,
            tokens: &tokens,
            first_thread_of_package: &packages,
            cpu_index: 0,
        };
        let outcome = run(&ctx);
        assert_eq!(outcome, RendezvousOutcome::NotValid);
        assert_eq!(global.counter.load(), 0);
    }

    #[test]
    fn late_arrival_after_lockdown_skips_present(){
        // Scenario 6 (§8): counter already locked down when this CPU
        // calls in; it must wait for `all_cpus_in_sync` to clear and
        // never touch `present`.
        let platform = MockPlatform::new(vec![0, 1], false);
        let global = GlobalSync::new(SyncMode::Traditional);
        let per_cpu: Vec<PerCpu> = (0..2).map(|_| PerCpu::new()).collect();
        let tokens = TokenPool::new();
        tokens.init();
        let packages: [AtomicI32; 1] = [AtomicI32::new(-1)];

        global.set_inside_smm(true);
        global.counter.lockdown();
        global.set_all_cpus_in_sync(true);

        let global_ref = &global;
        thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let ctx = RendezvousContext {
                    platform: &platform,
                    global: global_ref,
                    per_cpu: &per_cpu,
                    tokens: &tokens,
                    first_thread_of_package: &packages,
                    cpu_index: 1,
                };
                run(&ctx)
            });

            // Give the late CPU a chance to observe the lockdown, then
            // let it go the way the BSP eventually would.
            thread::sleep(std::time::Duration::from_millis(5));
            global_ref.set_all_cpus_in_sync(false);
            let outcome = handle.join().unwrap();
            assert_eq!(outcome, RendezvousOutcome::TooLateCheckingIn);
        });

        assert!(!per_cpu[1].is_present());
    }

    #[test]
    fn two_cpu_rendezvous_elects_one_bsp_and_one_ap() {
        // Scenario 1 (§8), driven end-to-end through `run` on two
        // real OS threads standing in for two logical processors.
        let platform = Arc::new(MockPlatform::new(vec![0, 1], false));
        let global = Arc::new(GlobalSync::new(SyncMode::Traditional));
        let per_cpu = Arc::new(
            (0..2)
                .map(|_| PerCpu::new())
                .collect::<Vec<_>>(),
        );
        let tokens = Arc::new(TokenPool::new());
        tokens.init();
        let packages: Arc<[AtomicI32; 1]> = Arc::new([AtomicI32::new(-1)]);

        let mut handles = Vec::new();
        for cpu_index in 0..2 {
            let platform = Arc::clone(&platform);
            let global = Arc::clone(&global);
            let per_cpu = Arc::clone(&per_cpu);
            let tokens = Arc::clone(&tokens);
            let packages = Arc::clone(&packages);
            handles.push(thread::spawn(move || {
                let ctx = RendezvousContext {
                    platform: platform.as_ref(),
                    global: global.as_ref(),
                    per_cpu: per_cpu.as_ref(),
                    tokens: tokens.as_ref(),
                    first_thread_of_package: packages.as_ref(),
                    cpu_index,
                };
                run(&ctx)
            }));
        }

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let bsp_count = outcomes
            .iter()
            .filter(|o| **o == RendezvousOutcome::RanAsBsp)
            .count();
        assert_eq!(bsp_count, 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, RendezvousOutcome::RanAsAp(ApOutcome::Completed))));

        assert!(!global.is_all_cpus_in_sync());
        assert_eq!(global.bsp_index(), None);
        assert_eq!(global.counter.load(), 0);
        assert!(!per_cpu[0].is_present());
        assert!(!per_cpu[1].is_present());
    }
}
