//! Concrete `Platform` implementation over `khal` (§6).
//!
//! Everything that is the same on every x86 SMM-capable platform, IPI
//! delivery, MTRR snapshot/restore, TSC-based deadlines, lives here. A
//! handful of operations vary by chipset and board (top-level SMI status
//! clearing, SMI validity, the Delayed/Blocked/Enable bits, BSP election
//! override, APIC ID validity, hot-plug removal, the foundation entry
//! point itself); §1 scopes "platform-specific SMI source clearing" and
//! hot-plug mechanics out of this core, so those are supplied by an
//! integrator through [`ChipsetHooks`] rather than guessed at here.
//!
//! This module is never exercised by `cargo test`: every method it calls
//! is a privileged instruction (`rdmsr`/`wrmsr`, APIC MMIO) that faults in
//! an unprivileged test process, the same reason [`crate::rendezvous`]
//! stubs out CR2 access under `#[cfg(test)]`. `platform::tests::MockPlatform`
//! is what actually drives the state machines in the test suite; this is
//! the real collaborator a firmware build wires in instead.

use core::sync::atomic::{AtomicU64, Ordering};

use khal::apic::{self, DeliveryMode};
use khal::mtrr::{self, MtrrState};

use crate::error::Result;
use crate::platform::{Platform, SmmRegisterBits};

/// Chipset- and board-specific behavior this crate has no way to know on
/// its own (§1, "out of scope: external collaborators"). An integrator
/// fills these in; [`NativePlatform`] covers everything that is the same
/// on every x86 SMM-capable platform.
pub trait ChipsetHooks {
    /// Arm the next SMI source. Returns `false` if the platform could
    /// not clear it.
    fn clear_top_level_smi_status(&self) -> bool;
    /// Is the SMI that just fired legitimate for this handler?
    fn platform_valid_smi(&self) -> bool;
    /// Override default BSP election for `cpu_index`, or defer to the
    /// CAS race by returning `Ok(None)`.
    fn platform_bsp_election(&self, cpu_index: usize) -> Result<Option<bool>>;
    /// Delayed/Blocked/Enable bits for `cpu_index`.
    fn get_smm_register(&self, cpu_index: usize) -> SmmRegisterBits;
    /// Is `apic_id` a valid, present APIC ID on this platform?
    fn is_valid_apic_id(&self, apic_id: u32) -> bool;
    /// Is `cpu_index` currently scheduled for hot-plug removal?
    fn is_cpu_marked_for_removal(&self, cpu_index: usize) -> bool;
    /// Run SMM-handler dispatch for the current SMI.
    fn foundation_entry(&self, bsp_index: usize);

    /// Does this platform require the per-SMI MTRR save/apply/restore
    /// choreography (§4.3 step 3)? Defaults to the conservative answer.
    fn needs_configure_mtrrs(&self) -> bool {
        true
    }
    /// Does this platform's dispatch implementation advertise
    /// per-procedure timeout support? Defaults to no.
    fn supports_dispatch_timeout(&self) -> bool {
        false
    }
    /// Hot-plug bookkeeping invoked once per SMI (§4.3 step 9). Defaults
    /// to nothing, matching [`Platform::hot_plug_update`]'s default.
    fn hot_plug_update(&self) {}
}

/// A monotonic deadline expressed in TSC ticks, the only timer source
/// guaranteed present this early in SMM without a platform-supplied one.
#[derive(Debug, Clone, Copy)]
pub struct TscDeadline {
    start: u64,
    budget: u64,
}

/// `Platform` over real x86 hardware via `khal`, parameterized over the
/// chipset-specific pieces a firmware integrator supplies.
pub struct NativePlatform<H> {
    hooks: H,
    ticks_per_timeout: AtomicU64,
    /// Captured once at construction (§4.8: "snapshot current MTRRs
    /// into the SMI MTRR template"), applied verbatim by every
    /// rendezvous pass's step 3c in place of whatever the OS had
    /// configured. Never updated afterward.
    smi_mtrr_template: MtrrState,
}

impl<H: ChipsetHooks> NativePlatform<H> {
    /// `ticks_per_timeout` bounds each arrival-gate phase (§4.2), in TSC
    /// ticks. Calibrating this from the CPU's invariant-TSC frequency is
    /// the integrator's job; this crate only spends the budget.
    /// `apic_mmio_base` is the Local APIC's mapped base address, already
    /// computed and enabled by platform bring-up (§1); it is only
    /// recorded here so [`Platform::send_smi_ipi`] knows where to write.
    ///
    /// Must run once, on the boot CPU, before the first SMI can fire:
    /// it also reads this CPU's current MTRRs as the SMI-safe template
    /// every later SMI will apply.
    pub fn new(hooks: H, ticks_per_timeout: u64, apic_mmio_base: u64) -> Self {
        // SAFETY: called during platform bring-up, before any SMI can
        // fire, with the base address bring-up already mapped and
        // enabled the Local APIC at.
        unsafe { apic::set_base(apic_mmio_base) };
        Self {
            hooks,
            ticks_per_timeout: AtomicU64::new(ticks_per_timeout),
            // SAFETY: called during platform bring-up, before any SMI
            // can fire, on a CPU whose current MTRRs are the known-safe
            // layout bring-up code has already established.
            smi_mtrr_template: unsafe { mtrr::snapshot() },
        }
    }

    pub fn set_ticks_per_timeout(&self, ticks: u64) {
        self.ticks_per_timeout.store(ticks, Ordering::Relaxed);
    }

    #[cfg(target_arch = "x86_64")]
    fn read_tsc() -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn read_tsc() -> u64 {
        0
    }
}

impl<H: ChipsetHooks> Platform for NativePlatform<H> {
    type Timer = TscDeadline;
    type Mtrr = MtrrState;

    fn start_sync_timer(&self) -> TscDeadline {
        TscDeadline {
            start: Self::read_tsc(),
            budget: self.ticks_per_timeout.load(Ordering::Relaxed),
        }
    }

    fn is_sync_timer_timeout(&self, timer: &TscDeadline) -> bool {
        Self::read_tsc().wrapping_sub(timer.start) >= timer.budget
    }

    fn send_smi_ipi(&self, apic_id: u32) {
        // SAFETY: `apic::set_base` ran in `new`, before any SMI can
        // fire, and `apic_id` is a CPU this crate's caller has already
        // validated via `is_valid_apic_id`.
        unsafe { apic::send_ipi(apic_id, DeliveryMode::Smi, 0) };
    }

    fn clear_top_level_smi_status(&self) -> bool {
        self.hooks.clear_top_level_smi_status()
    }

    fn platform_valid_smi(&self) -> bool {
        self.hooks.platform_valid_smi()
    }

    fn platform_bsp_election(&self, cpu_index: usize) -> Result<Option<bool>> {
        self.hooks.platform_bsp_election(cpu_index)
    }

    fn get_smm_register(&self, cpu_index: usize) -> SmmRegisterBits {
        self.hooks.get_smm_register(cpu_index)
    }

    fn needs_configure_mtrrs(&self) -> bool {
        self.hooks.needs_configure_mtrrs()
    }

    fn mtrr_get_all(&self) -> MtrrState {
        // SAFETY: called on the owning CPU during rendezvous, with SMRR
        // already disabled by the immediately preceding `disable_smrr`.
        unsafe { mtrr::snapshot() }
    }

    fn mtrr_set_all(&self, state: &MtrrState) {
        // SAFETY: `state` was produced by `mtrr_get_all` on this same
        // CPU earlier in the same rendezvous pass (§4.3 step 3/8), or
        // is `smi_mtrr_template` below.
        unsafe { mtrr::restore(state) };
    }

    fn smi_mtrr_template(&self) -> MtrrState {
        self.smi_mtrr_template
    }

    fn disable_smrr(&self) {
        // SMRR gating lives in bit 11 of IA32_MTRR_DEF_TYPE; the SMI
        // template written by the next `mtrr_set_all` call overwrites
        // `def_type` wholesale, so there is nothing to do here beyond
        // what the caller's save/apply sequence already performs.
    }

    fn reenable_smrr(&self) {
        // See `disable_smrr`: the restore in `mtrr_set_all` already
        // brings `def_type`, and with it the SMRR enable bit, back.
    }

    fn rendezvous_entry(&self, _cpu_index: usize) {}

    fn rendezvous_exit(&self, _cpu_index: usize) {}

    fn is_valid_apic_id(&self, apic_id: u32) -> bool {
        self.hooks.is_valid_apic_id(apic_id)
    }

    fn is_cpu_marked_for_removal(&self, cpu_index: usize) -> bool {
        self.hooks.is_cpu_marked_for_removal(cpu_index)
    }

    fn supports_dispatch_timeout(&self) -> bool {
        self.hooks.supports_dispatch_timeout()
    }

    fn foundation_entry(&self, bsp_index: usize) {
        self.hooks.foundation_entry(bsp_index)
    }

    fn hot_plug_update(&self) {
        self.hooks.hot_plug_update()
    }
}
