//! BSP handler state machine (§4.3).
//!
//! Runs on the one CPU that wins election in [`crate::rendezvous`].
//! Drives the arrival gate, the four-phase MTRR choreography, the
//! foundation upcall, and the ordered release of every AP. Every
//! `release_all_aps`/`wait_for_all_aps` pair here is positional (§9):
//! the AP side in [`crate::ap`] must make the exact matching number of
//! calls in the same order or the protocol deadlocks.

use crate::arrival_gate;
use crate::global::{GlobalSync, SyncMode};
use crate::percpu::PerCpu;
use crate::platform::Platform;
use crate::token::TokenPool;
use core::sync::atomic::AtomicI32;

/// Release every present AP's `run` semaphore once.
fn release_all_aps(per_cpu: &[PerCpu], bsp_index: usize) {
    for (index, cpu) in per_cpu.iter().enumerate() {
        if index != bsp_index && cpu.is_present() {
            cpu.run.release();
        }
    }
}

/// Consume `count` notifications on the BSP's own `run` semaphore ,
/// each present AP's release() call lands here.
fn wait_for_all_aps(bsp: &PerCpu, count: u32) {
    for _ in 0..count {
        bsp.run.wait();
    }
}

/// Spin until every present AP's `busy` lock can be momentarily
/// acquired, proving dispatched work has drained (§4.3 step 5).
fn wait_for_all_aps_not_busy(per_cpu: &[PerCpu], bsp_index: usize) {
    for (index, cpu) in per_cpu.iter().enumerate() {
        if index == bsp_index || !cpu.is_present() {
            continue;
        }
        loop {
            if cpu.busy.try_acquire() {
                cpu.busy.release();
                break;
            }
            core::hint::spin_loop();
        }
    }
}

/// Context the BSP handler needs beyond what `Platform` already supplies.
pub struct BspContext<'a, P: Platform> {
    pub platform: &'a P,
    pub global: &'a GlobalSync,
    pub per_cpu: &'a [PerCpu],
    pub tokens: &'a TokenPool,
    pub first_thread_of_package: &'a [AtomicI32],
    pub bsp_index: usize,
}

// See the identical note on `ap::ApContext`: manual impls avoid a
// spurious `P: Copy` bound from deriving.
impl<'a, P: Platform> Clone for BspContext<'a, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, P: Platform> Copy for BspContext<'a, P> {}

/// Run the full BSP handler for one SMI (§4.3, all ten steps).
pub fn run<P: Platform>(ctx: &BspContext<'_, P>) {
    let BspContext {
        platform,
        global,
        per_cpu,
        tokens,
        first_thread_of_package,
        bsp_index,
    } = *ctx;
    let bsp = &per_cpu[bsp_index];

    // Step 1.
    global.set_inside_smm(true);
    bsp.mark_present();
    platform.clear_top_level_smi_status();

    let needs_mtrr = platform.needs_configure_mtrrs();
    let run_gate_now = global.effective_sync_mode.get() == SyncMode::Traditional || needs_mtrr;

    let mut ap_count = 0u32;

    // Step 2.
    if run_gate_now {
        arrival_gate::run(platform, global, per_cpu, first_thread_of_package, || false);
        global.set_all_cpus_in_sync(true);
        let prior_counter = global.counter.lockdown();
        ap_count = prior_counter.saturating_sub(1);
    }

    // Step 3: four-phase MTRR choreography.
    let mut saved_mtrrs = None;
    if needs_mtrr {
        // 3a.
        wait_for_all_aps(bsp, ap_count);
        release_all_aps(per_cpu, bsp_index);
        // 3b.
        saved_mtrrs = Some(platform.mtrr_get_all());
        wait_for_all_aps(bsp, ap_count);
        release_all_aps(per_cpu, bsp_index);
        // 3c. Apply the init-captured SMI-safe template, not the OS
        // snapshot just saved in 3b, that snapshot is only for the
        // step-8 restore.
        platform.disable_smrr();
        platform.mtrr_set_all(&platform.smi_mtrr_template());
        wait_for_all_aps(bsp, ap_count);
    }

    // Step 4.
    bsp.busy.acquire();
    platform.foundation_entry(bsp_index);

    // Step 5.
    wait_for_all_aps_not_busy(per_cpu, bsp_index);
    bsp.busy.release();

    // Step 6.
    let relaxed_no_mtrr = global.effective_sync_mode.get() == SyncMode::Relaxed && !needs_mtrr;
    if relaxed_no_mtrr {
        let prior_counter = global.counter.lockdown();
        ap_count = prior_counter.saturating_sub(1);
        loop {
            let present_count = per_cpu
                .iter()
                .enumerate()
                .filter(|(i, cpu)| *i != bsp_index && cpu.is_present())
                .count() as u32;
            if present_count >= ap_count {
                break;
            }
            core::hint::spin_loop();
        }
    }

    // Step 7.
    global.set_inside_smm(false);
    release_all_aps(per_cpu, bsp_index);
    wait_for_all_aps(bsp, ap_count);

    // Step 8.
    if needs_mtrr {
        release_all_aps(per_cpu, bsp_index);
        if let Some(saved) = saved_mtrrs.as_ref() {
            platform.mtrr_set_all(saved);
        }
        platform.reenable_smrr();
        wait_for_all_aps(bsp, ap_count);
    }

    // Step 9.
    release_all_aps(per_cpu, bsp_index);
    platform.hot_plug_update();
    bsp.clear_present();
    wait_for_all_aps(bsp, ap_count);

    // Step 10.
    tokens.reset();
    global.reset_for_next_smi();
}
