//! Top-level wiring and initialization (§4.8).
//!
//! One [`Coordinator`] exists for the lifetime of the firmware (§9:
//! "model it as a singleton with an explicit init entry"). It owns the
//! global sync block, the per-CPU table, the completion token pool, and
//! the per-package first-thread table, and is the only thing foundation
//! code and platform bring-up code ever need to hold a reference to.
//! Everything else in this crate is reached through it.

#[cfg(not(test))]
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::dispatch::{self, Completion, DispatchCtx};
use crate::error::Result;
use crate::global::{GlobalSync, StartupHook, SyncMode};
use crate::percpu::{CpuIdentity, PerCpu, Procedure};
use crate::platform::Platform;
use crate::rendezvous::{self, RendezvousContext, RendezvousOutcome};
use crate::token::{Token, TokenPool};

/// Owns every piece of state the rendezvous protocol needs across the
/// lifetime of the firmware, parameterized over the platform glue.
pub struct Coordinator<P: Platform> {
    platform: P,
    global: GlobalSync,
    per_cpu: Vec<PerCpu>,
    identities: Vec<CpuIdentity>,
    first_thread_of_package: Vec<AtomicI32>,
    tokens: TokenPool,
}

impl<P: Platform> Coordinator<P> {
    /// Build the coordinator for a system with `cpu_count` logical
    /// processors spread across (at most) `package_count` packages
    /// (§4.8). Must run once, before the first SMI can fire, it
    /// allocates the first token chunk and the per-CPU table, neither
    /// of which this crate will ever grow or shrink again on its own.
    ///
    /// `needs_configure_mtrrs` on `platform` decides the default sync
    /// mode: platforms that must save/replace/restore MTRRs every SMI
    /// gain nothing from deferring the arrival gate, so they default to
    /// Traditional; platforms that don't can default to Relaxed and let
    /// foundation dispatch start before every straggler has checked in.
    pub fn init(platform: P, cpu_count: usize, package_count: usize) -> Self {
        let per_cpu: Vec<PerCpu> = (0..cpu_count).map(|_| PerCpu::new()).collect();
        let identities: Vec<CpuIdentity> = (0..cpu_count).map(|_| CpuIdentity::new()).collect();
        let first_thread_of_package: Vec<AtomicI32> = (0..package_count.max(1))
            .map(|_| AtomicI32::new(-1))
            .collect();

        let default_mode = if platform.needs_configure_mtrrs() {
            SyncMode::Traditional
        } else {
            SyncMode::Relaxed
        };
        let global = GlobalSync::new(default_mode);
        global.cpu_count.store(cpu_count as u32, Ordering::Release);

        let tokens = TokenPool::new();
        tokens.init();

        Self {
            platform,
            global,
            per_cpu,
            identities,
            first_thread_of_package,
            tokens,
        }
    }

    /// Record a logical processor's APIC ID and package ID, discovered
    /// by platform bring-up code via CPUID before the first SMI (§4.8).
    pub fn register_cpu(&self, cpu_index: usize, apic_id: u32, package_id: u32) {
        if let Some(identity) = self.identities.get(cpu_index) {
            identity.apic_id.store(apic_id, Ordering::Release);
            identity.package_id.store(package_id, Ordering::Release);
        }
    }

    /// Register the optional per-SMI startup hook invoked at the very
    /// top of every rendezvous pass (§4.6, §4.8).
    pub fn register_startup_hook(&self, procedure: Procedure, args: *mut u8) {
        self.global
            .startup_hook
            .register(StartupHook { procedure, args });
    }

    pub fn cpu_count(&self) -> usize {
        self.per_cpu.len()
    }

    pub fn bsp_index(&self) -> Option<usize> {
        self.global.bsp_index()
    }

    fn is_valid_apic_id(&self, cpu_index: usize) -> bool {
        match self.identities.get(cpu_index) {
            Some(identity) => self
                .platform
                .is_valid_apic_id(identity.apic_id.load(Ordering::Acquire)),
            None => false,
        }
    }

    /// Racy first-writer-wins claim into the package-first-thread table
    /// (§9): the first CPU of a given package to run this wins the
    /// slot; everyone else's CAS simply fails and moves on.
    fn claim_package_first_thread(&self, cpu_index: usize) {
        let package_id = match self.identities.get(cpu_index) {
            Some(identity) => identity.package_id.load(Ordering::Acquire) as usize,
            None => return,
        };
        if let Some(slot) = self.first_thread_of_package.get(package_id) {
            let _ = slot.compare_exchange(
                -1,
                cpu_index as i32,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Run one full rendezvous pass for the calling CPU (§4.6). Invoked
    /// once per logical processor, per SMI, from the SMI entry trampoline.
    pub fn run_rendezvous(&self, cpu_index: usize) -> RendezvousOutcome {
        self.claim_package_first_thread(cpu_index);
        let ctx = RendezvousContext {
            platform: &self.platform,
            global: &self.global,
            per_cpu: &self.per_cpu,
            tokens: &self.tokens,
            first_thread_of_package: &self.first_thread_of_package,
            cpu_index,
        };
        rendezvous::run(&ctx)
    }

    /// `startup_this_ap(proc, cpu, args, completion, timeout, status)`
    /// (§4.5), callable from foundation code running on `executing_cpu`.
    #[allow(clippy::too_many_arguments)]
    pub fn startup_this_ap(
        &self,
        executing_cpu: usize,
        procedure: Procedure,
        cpu: usize,
        parameter: *mut u8,
        completion: Completion<'_>,
        timeout: u64,
        status: Option<&mut isize>,
    ) -> Result<()> {
        let is_valid_apic_id = |cpu_index: usize| self.is_valid_apic_id(cpu_index);
        let is_marked_for_removal =
            |cpu_index: usize| self.platform.is_cpu_marked_for_removal(cpu_index);
        let ctx = DispatchCtx {
            per_cpu: &self.per_cpu,
            tokens: &self.tokens,
            executing_cpu,
            supports_timeout: self.platform.supports_dispatch_timeout(),
            is_valid_apic_id: &is_valid_apic_id,
            is_marked_for_removal: &is_marked_for_removal,
        };
        dispatch::startup_this_ap(&ctx, procedure, cpu, parameter, completion, timeout, status)
    }

    /// `startup_all_aps(proc, args, token?, status?)` (§4.5).
    pub fn startup_all_aps(
        &self,
        executing_cpu: usize,
        procedure: Procedure,
        parameter: *mut u8,
        token_slot: Option<&mut *const Token>,
        statuses: Option<&mut [isize]>,
    ) -> Result<()> {
        let is_valid_apic_id = |cpu_index: usize| self.is_valid_apic_id(cpu_index);
        let is_marked_for_removal =
            |cpu_index: usize| self.platform.is_cpu_marked_for_removal(cpu_index);
        let ctx = DispatchCtx {
            per_cpu: &self.per_cpu,
            tokens: &self.tokens,
            executing_cpu,
            supports_timeout: self.platform.supports_dispatch_timeout(),
            is_valid_apic_id: &is_valid_apic_id,
            is_marked_for_removal: &is_marked_for_removal,
        };
        dispatch::startup_all_aps(&ctx, procedure, parameter, token_slot, statuses)
    }

    /// `is_ap_ready(token)` (§4.5): non-blocking completion probe.
    pub fn is_ap_ready(&self, token: &Token) -> Result<()> {
        dispatch::is_ap_ready(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::tests::MockPlatform;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn init_sizes_match_requested_topology() {
        let platform = MockPlatform::new(vec![0, 1, 2, 3], false);
        let coordinator = Coordinator::init(platform, 4, 2);
        assert_eq!(coordinator.cpu_count(), 4);
        assert_eq!(coordinator.bsp_index(), None);
    }

    #[test]
    fn startup_this_ap_rejects_unregistered_apic_id() {
        let platform = MockPlatform::new(vec![0, 1], false);
        let coordinator = Coordinator::init(platform, 2, 1);
        coordinator.register_cpu(0, 0, 0);
        coordinator.register_cpu(1, 99, 0); // not in present_apic_ids

        extern "C" fn noop(_: *mut u8) -> isize {
            0
        }
        let result = coordinator.startup_this_ap(
            0,
            noop,
            1,
            core::ptr::null_mut(),
            Completion::NonBlockingNoToken,
            0,
            None,
        );
        assert_eq!(result, Err(crate::error::Error::InvalidParameter));
    }

    #[test]
    fn package_first_thread_claim_is_first_writer_wins() {
        let platform = MockPlatform::new(vec![0, 1], false);
        let coordinator = Coordinator::init(platform, 2, 1);
        coordinator.register_cpu(0, 0, 0);
        coordinator.register_cpu(1, 1, 0);

        coordinator.claim_package_first_thread(1);
        coordinator.claim_package_first_thread(0);
        assert_eq!(
            coordinator.first_thread_of_package[0].load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn two_cpu_smi_through_the_coordinator_elects_one_bsp() {
        let platform = MockPlatform::new(vec![0, 1], false);
        let coordinator = Arc::new(Coordinator::init(platform, 2, 1));
        coordinator.register_cpu(0, 0, 0);
        coordinator.register_cpu(1, 1, 0);

        let mut handles = Vec::new();
        for cpu_index in 0..2 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(thread::spawn(move || coordinator.run_rendezvous(cpu_index)));
        }
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let bsp_count = outcomes
            .iter()
            .filter(|o| **o == RendezvousOutcome::RanAsBsp)
            .count();
        assert_eq!(bsp_count, 1);
        assert_eq!(coordinator.bsp_index(), None);
    }
}
