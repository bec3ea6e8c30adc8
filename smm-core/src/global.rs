//! Global synchronization block (§3).
//!
//! One instance exists for the lifetime of the firmware (§9: "model it
//! as a singleton with an explicit init entry"). Every field here is
//! either a true atomic or documented as single-writer.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::percpu::Procedure;
use crate::sync::Semaphore;
use crate::UNSET;

/// Whether the arrival gate runs before (`Traditional`) or after
/// (`Relaxed`) foundation dispatch when MTRR reconfiguration is not
/// required (§4.3 step 2, §9 glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Traditional,
    Relaxed,
}

/// Per-SMI startup hook registered at init (§4.8): an optional
/// procedure run once, very early in the BSP's rendezvous handling,
/// before the foundation entry point.
#[derive(Clone, Copy)]
pub struct StartupHook {
    pub procedure: Procedure,
    pub args: *mut u8,
}

// SAFETY: the raw pointer is only ever dereferenced by the BSP, which
// owns the buffer for the duration of one SMI by construction of the
// caller that registered the hook.
unsafe impl Send for StartupHook {}
unsafe impl Sync for StartupHook {}

/// State shared by every logical processor across the whole machine.
pub struct GlobalSync {
    /// CPUs that have checked in this SMI. Locked down to `UNSET` once
    /// the arrival gate concludes.
    pub counter: Semaphore,
    /// True between BSP entry and the BSP's exit decision.
    pub inside_smm: AtomicBool,
    /// True from counter-lockdown until the BSP releases APs.
    pub all_cpus_in_sync: AtomicBool,
    /// Latched result of the arrival gate: did every CPU arrive
    /// without needing the fault-tolerant fallback path?
    pub all_aps_arrived_with_exception: AtomicBool,
    /// `UNSET` when unelected, otherwise the winning CPU's index.
    pub bsp_index: AtomicU32,
    pub effective_sync_mode: EffectiveSyncMode,
    pub startup_hook: StartupHookSlot,
    /// Number of logical processors the platform brought up at init.
    pub cpu_count: AtomicU32,
}

/// `SyncMode` stored atomically so it can be read by any CPU without a
/// lock; written once by the BSP per SMI if a platform override applies.
pub struct EffectiveSyncMode {
    raw: AtomicU32,
}

impl EffectiveSyncMode {
    const TRADITIONAL: u32 = 0;
    const RELAXED: u32 = 1;

    pub const fn new(initial: SyncMode) -> Self {
        Self {
            raw: AtomicU32::new(match initial {
                SyncMode::Traditional => Self::TRADITIONAL,
                SyncMode::Relaxed => Self::RELAXED,
            }),
        }
    }

    pub fn get(&self) -> SyncMode {
        match self.raw.load(Ordering::Acquire) {
            Self::RELAXED => SyncMode::Relaxed,
            _ => SyncMode::Traditional,
        }
    }

    pub fn set(&self, mode: SyncMode) {
        let raw = match mode {
            SyncMode::Traditional => Self::TRADITIONAL,
            SyncMode::Relaxed => Self::RELAXED,
        };
        self.raw.store(raw, Ordering::Release);
    }
}

/// Optional per-SMI startup hook, registered once at init (§4.8) and
/// read by every BSP election for the rest of firmware lifetime.
pub struct StartupHookSlot {
    hook: core::cell::UnsafeCell<Option<StartupHook>>,
    set: AtomicBool,
}

unsafe impl Sync for StartupHookSlot {}

impl StartupHookSlot {
    pub const fn empty() -> Self {
        Self {
            hook: core::cell::UnsafeCell::new(None),
            set: AtomicBool::new(false),
        }
    }

    /// Register the hook. Intended to be called exactly once, at
    /// init, before any SMI can fire.
    pub fn register(&self, hook: StartupHook) {
        unsafe {
            *self.hook.get() = Some(hook);
        }
        self.set.store(true, Ordering::Release);
    }

    pub fn get(&self) -> Option<StartupHook> {
        if !self.set.load(Ordering::Acquire) {
            return None;
        }
        unsafe { *self.hook.get() }
    }
}

impl GlobalSync {
    pub const fn new(default_mode: SyncMode) -> Self {
        Self {
            counter: Semaphore::new(0),
            inside_smm: AtomicBool::new(false),
            all_cpus_in_sync: AtomicBool::new(false),
            all_aps_arrived_with_exception: AtomicBool::new(false),
            bsp_index: AtomicU32::new(UNSET),
            effective_sync_mode: EffectiveSyncMode::new(default_mode),
            startup_hook: StartupHookSlot::empty(),
            cpu_count: AtomicU32::new(0),
        }
    }

    pub fn is_inside_smm(&self) -> bool {
        self.inside_smm.load(Ordering::Acquire)
    }

    pub fn set_inside_smm(&self, value: bool) {
        self.inside_smm.store(value, Ordering::Release);
    }

    pub fn is_all_cpus_in_sync(&self) -> bool {
        self.all_cpus_in_sync.load(Ordering::Acquire)
    }

    pub fn set_all_cpus_in_sync(&self, value: bool) {
        self.all_cpus_in_sync.store(value, Ordering::Release);
    }

    /// Try to win BSP election via the default CAS race on
    /// `bsp_index` (§4.6): the first CPU to CAS it from `UNSET` to its
    /// own index wins.
    pub fn try_elect_bsp(&self, cpu_index: usize) -> bool {
        self.bsp_index
            .compare_exchange(
                UNSET,
                cpu_index as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn bsp_index(&self) -> Option<usize> {
        match self.bsp_index.load(Ordering::Acquire) {
            UNSET => None,
            idx => Some(idx as usize),
        }
    }

    /// Reset election and arrival-gate latches at end of SMI (§4.3 step 10).
    pub fn reset_for_next_smi(&self) {
        self.bsp_index.store(UNSET, Ordering::Release);
        self.counter.reset(0);
        self.set_all_cpus_in_sync(false);
        self.all_aps_arrived_with_exception
            .store(false, Ordering::Release);
    }
}
