//! Abstract platform collaborator (§6).
//!
//! Everything the core needs from the outside world but cannot express
//! itself, timers, SMI IPI delivery, MTRR MSR access, top-level SMI
//! status, hot-plug policy, comes through this trait. Production
//! builds implement it over `khal`; tests implement it over plain
//! `std` state so the state machine in [`crate::bsp`], [`crate::ap`]
//! and [`crate::rendezvous`] can run on a host with real OS threads
//! standing in for logical processors.

use crate::error::Result;

/// Opaque handle to a running sync-timer deadline. The core never
/// inspects its contents; it only starts one and polls
/// [`Platform::is_sync_timer_timeout`].
pub trait SyncTimer: Copy {}

impl<T: Copy> SyncTimer for T {}

/// SMM register bits `get_smm_register` reports for one CPU (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmmRegisterBits {
    /// CPU has not yet acknowledged this SMI (package-first-thread
    /// semantics: delayed CPUs still count toward arrival if a
    /// sibling in the same package has already checked in).
    pub delayed: bool,
    /// SMI is currently masked (blocked) on this CPU.
    pub blocked: bool,
    /// SMI delivery is enabled on this CPU at all.
    pub enable: bool,
}

/// Opaque MTRR snapshot the core saves, applies, and restores without
/// interpreting its contents.
pub trait MtrrSnapshot: Copy {}

impl<T: Copy> MtrrSnapshot for T {}

/// The set of external collaborators the rendezvous core depends on.
///
/// `Timer` and `Mtrr` are associated types rather than fixed structs so
/// a platform implementation can use whatever representation its
/// hardware glue already produces (e.g. `khal::mtrr::MtrrState`)
/// without the core needing to know its layout.
pub trait Platform {
    type Timer: SyncTimer;
    type Mtrr: MtrrSnapshot;

    /// Start a monotonic deadline handle for the arrival gate.
    fn start_sync_timer(&self) -> Self::Timer;
    /// Has the deadline started by `start_sync_timer` elapsed?
    fn is_sync_timer_timeout(&self, timer: &Self::Timer) -> bool;

    /// Send a directed SMI to the given APIC ID.
    fn send_smi_ipi(&self, apic_id: u32);

    /// Arm the next SMI source. Returns `false` if the platform could
    /// not clear it (treated as a non-fatal diagnostic by callers).
    fn clear_top_level_smi_status(&self) -> bool;

    /// Is the SMI that just fired legitimate for this handler?
    fn platform_valid_smi(&self) -> bool;

    /// Allow the platform to override default BSP election for CPU
    /// `cpu_index`. Returning `Ok(None)` defers to the default
    /// CAS-based race on `bsp_index` (§4.6).
    fn platform_bsp_election(&self, cpu_index: usize) -> Result<Option<bool>>;

    /// Delayed/Blocked/Enable bits for `cpu_index` (§6, §4.2).
    fn get_smm_register(&self, cpu_index: usize) -> SmmRegisterBits;

    /// Does this platform require the per-SMI MTRR save/apply/restore
    /// choreography (§4.3 step 3)?
    fn needs_configure_mtrrs(&self) -> bool;

    /// Snapshot this CPU's current MTRRs.
    fn mtrr_get_all(&self) -> Self::Mtrr;
    /// Apply a previously captured MTRR snapshot to this CPU.
    fn mtrr_set_all(&self, state: &Self::Mtrr);
    /// The SMI-safe MTRR template captured once at init (§4.8:
    /// "Snapshot current MTRRs into the SMI MTRR template"), applied in
    /// step 3c in place of whatever the OS had configured. Distinct
    /// from `mtrr_get_all`, which reads the *current*, per-SMI OS
    /// state that step 3b saves for the step-8 restore.
    fn smi_mtrr_template(&self) -> Self::Mtrr;

    /// Gate SMRAM-range registers off before applying SMI MTRRs.
    fn disable_smrr(&self);
    /// Re-enable SMRAM-range gating after MTRR restore.
    fn reenable_smrr(&self);

    /// Per-CPU hook run on rendezvous entry, before role classification.
    fn rendezvous_entry(&self, cpu_index: usize);
    /// Per-CPU hook run on rendezvous exit, after role handling completes.
    fn rendezvous_exit(&self, cpu_index: usize);

    /// Is `apic_id` a valid, present APIC ID on this platform?
    fn is_valid_apic_id(&self, apic_id: u32) -> bool;
    /// Is `cpu_index` currently scheduled for hot-plug removal?
    fn is_cpu_marked_for_removal(&self, cpu_index: usize) -> bool;
    /// Does this platform's dispatch implementation advertise
    /// per-procedure timeout support (§4.5, §7)?
    fn supports_dispatch_timeout(&self) -> bool;

    /// Run SMM-handler dispatch for the current SMI. May itself call
    /// back into [`crate::dispatch::startup_this_ap`] or
    /// [`crate::dispatch::startup_all_aps`].
    fn foundation_entry(&self, bsp_index: usize);

    /// Hot-plug bookkeeping invoked once per SMI, after APs are told
    /// to reset their state (§4.3 step 9).
    fn hot_plug_update(&self) {}
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// A deterministic, host-side `Platform` for driving the state
    /// machines under `std::thread`. The "timer" is just an elapsed
    /// tick counter so tests can force a timeout without real sleeps.
    pub struct MockPlatform {
        pub tick: AtomicU64,
        pub timeout_after_ticks: u64,
        pub valid_smi: AtomicBool,
        pub needs_mtrr: bool,
        pub present_apic_ids: Vec<u32>,
        pub removed_cpus: Mutex<Vec<usize>>,
        pub smi_ipis_sent: Mutex<Vec<u32>>,
        pub foundation_calls: AtomicU64,
    }

    impl MockPlatform {
        pub fn new(present_apic_ids: Vec<u32>, needs_mtrr: bool) -> Self {
            Self {
                tick: AtomicU64::new(0),
                timeout_after_ticks: 1_000_000,
                valid_smi: AtomicBool::new(true),
                needs_mtrr,
                present_apic_ids,
                removed_cpus: Mutex::new(Vec::new()),
                smi_ipis_sent: Mutex::new(Vec::new()),
                foundation_calls: AtomicU64::new(0),
            }
        }
    }

    impl Platform for MockPlatform {
        type Timer = u64;
        type Mtrr = u64;

        fn start_sync_timer(&self) -> u64 {
            self.tick.load(Ordering::Relaxed)
        }

        fn is_sync_timer_timeout(&self, started: &u64) -> bool {
            self.tick.load(Ordering::Relaxed).saturating_sub(*started) >= self.timeout_after_ticks
        }

        fn send_smi_ipi(&self, apic_id: u32) {
            self.smi_ipis_sent.lock().unwrap().push(apic_id);
        }

        fn clear_top_level_smi_status(&self) -> bool {
            true
        }

        fn platform_valid_smi(&self) -> bool {
            self.valid_smi.load(Ordering::Relaxed)
        }

        fn platform_bsp_election(&self, _cpu_index: usize) -> Result<Option<bool>> {
            Ok(None)
        }

        fn get_smm_register(&self, _cpu_index: usize) -> SmmRegisterBits {
            SmmRegisterBits {
                delayed: false,
                blocked: false,
                enable: true,
            }
        }

        fn needs_configure_mtrrs(&self) -> bool {
            self.needs_mtrr
        }

        fn mtrr_get_all(&self) -> u64 {
            0xA5A5
        }

        fn mtrr_set_all(&self, _state: &u64) {}

        fn smi_mtrr_template(&self) -> u64 {
            0x5151
        }

        fn disable_smrr(&self) {}
        fn reenable_smrr(&self) {}

        fn rendezvous_entry(&self, _cpu_index: usize) {}
        fn rendezvous_exit(&self, _cpu_index: usize) {}

        fn is_valid_apic_id(&self, apic_id: u32) -> bool {
            self.present_apic_ids.contains(&apic_id)
        }

        fn is_cpu_marked_for_removal(&self, cpu_index: usize) -> bool {
            self.removed_cpus.lock().unwrap().contains(&cpu_index)
        }

        fn supports_dispatch_timeout(&self) -> bool {
            false
        }

        fn foundation_entry(&self, _bsp_index: usize) {
            self.foundation_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn mock_platform_reports_present_apic_ids() {
        let platform = MockPlatform::new(vec![0, 1, 2, 3], false);
        assert!(platform.is_valid_apic_id(2));
        assert!(!platform.is_valid_apic_id(9));
    }
}
