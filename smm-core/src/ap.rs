//! AP handler state machine (§4.4).
//!
//! Mirrors the BSP handler from the non-elected side: checks in,
//! exchanges MTRR phases, then serves dispatched procedures until the
//! BSP signals exit. Every wait/release here must match the BSP's
//! calls one-for-one (§9); this module and [`crate::bsp`] are best
//! read side by side.

use crate::global::{GlobalSync, SyncMode};
use crate::percpu::PerCpu;
use crate::platform::Platform;

pub struct ApContext<'a, P: Platform> {
    pub platform: &'a P,
    pub global: &'a GlobalSync,
    pub per_cpu: &'a [PerCpu],
    pub cpu_index: usize,
    pub bsp_index: usize,
    pub bsp_apic_id: Option<u32>,
}

// Manual impls instead of `#[derive(Clone, Copy)]`: derive would add a
// spurious `P: Copy` bound even though every field here is a reference
// or a plain integer, copyable regardless of whether `P` itself is.
impl<'a, P: Platform> Clone for ApContext<'a, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, P: Platform> Copy for ApContext<'a, P> {}

/// Outcome of running the AP handler once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApOutcome {
    /// Served through a full SMI and exited in lockstep with the BSP.
    Completed,
    /// Gave up before the BSP ever entered SMM (§4.4 step 1).
    GaveUpWaitingForBsp,
}

fn notify_bsp(per_cpu: &[PerCpu], bsp_index: usize) {
    per_cpu[bsp_index].run.release();
}

/// Run the full AP handler for one SMI (§4.4).
///
/// `wait_for_inside_smm` implements step 1's bounded spin-and-provoke:
/// it is injected rather than hardcoded so tests can simulate a BSP
/// that never shows up without a real hardware timer.
pub fn run<P: Platform>(
    ctx: &ApContext<'_, P>,
    wait_for_inside_smm: impl Fn() -> bool,
) -> ApOutcome {
    let ApContext {
        platform,
        global,
        per_cpu,
        cpu_index,
        bsp_index,
        bsp_apic_id,
    } = *ctx;
    let self_cpu = &per_cpu[cpu_index];

    // Step 1.
    if !wait_for_inside_smm() {
        if let Some(apic_id) = bsp_apic_id {
            platform.send_smi_ipi(apic_id);
        }
        if !wait_for_inside_smm() {
            global.counter.wait();
            return ApOutcome::GaveUpWaitingForBsp;
        }
    }

    // Step 2.
    self_cpu.mark_present();
    let needs_mtrr = platform.needs_configure_mtrrs();
    let traditional_or_mtrr =
        global.effective_sync_mode.get() == SyncMode::Traditional || needs_mtrr;
    if traditional_or_mtrr {
        notify_bsp(per_cpu, bsp_index);
    }

    // Step 3: three exchanges with the BSP via run[self]/run[bsp].
    let mut saved_mtrrs = None;
    if needs_mtrr {
        self_cpu.run.wait();
        saved_mtrrs = Some(platform.mtrr_get_all());
        notify_bsp(per_cpu, bsp_index);

        self_cpu.run.wait();
        // Apply the init-captured SMI-safe template, not the OS
        // snapshot just saved above (that one is for the step-5 restore).
        platform.disable_smrr();
        platform.mtrr_set_all(&platform.smi_mtrr_template());
        notify_bsp(per_cpu, bsp_index);

        self_cpu.run.wait();
    }

    // Step 4: work loop.
    loop {
        self_cpu.run.wait();
        if !global.is_inside_smm() {
            break;
        }
        if let Some((procedure, parameter, status, token)) = self_cpu.take_dispatch() {
            let rc = procedure(parameter);
            if !status.is_null() {
                unsafe {
                    *status = rc;
                }
            }
            if !token.is_null() {
                unsafe {
                    (*token).complete_one();
                }
            }
        }
        self_cpu.busy.release();
    }

    // Step 5.
    if needs_mtrr {
        notify_bsp(per_cpu, bsp_index);
        self_cpu.run.wait();
        if let Some(saved) = saved_mtrrs.as_ref() {
            platform.mtrr_set_all(saved);
        }
        platform.reenable_smrr();
    }

    // Step 6.
    notify_bsp(per_cpu, bsp_index);
    self_cpu.run.wait();
    self_cpu.clear_present();
    notify_bsp(per_cpu, bsp_index);

    ApOutcome::Completed
}
