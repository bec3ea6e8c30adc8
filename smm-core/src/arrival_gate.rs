//! Two-phase arrival gate (§4.2).
//!
//! Run by the BSP, after election, before the MTRR choreography or
//! foundation dispatch (depending on sync mode). Bounds how long the
//! BSP waits for the rest of the fleet before proceeding with whoever
//! checked in, a missed CPU here is tolerated, not fatal, because the
//! alternative is an unbounded hang.

use crate::global::GlobalSync;
use crate::percpu::PerCpu;
use crate::platform::Platform;

/// Outcome of running the gate once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalResult {
    /// Did every CPU arrive within the bounded wait, without needing
    /// the second-phase IPI fallback?
    pub all_arrived_without_exception: bool,
}

/// How many CPUs the platform reports as currently Delayed or Blocked
/// on a package-first-thread basis (§4.2 phase 1: "`blocked` and
/// `disabled` are summed across package-first threads").
fn blocked_and_disabled_count<P: Platform>(
    platform: &P,
    per_cpu: &[PerCpu],
    first_thread_of_package: &[core::sync::atomic::AtomicI32],
) -> u32 {
    let mut count = 0u32;
    for claimed in first_thread_of_package.iter() {
        let claimant = claimed.load(core::sync::atomic::Ordering::Acquire);
        if claimant < 0 {
            continue;
        }
        let cpu_index = claimant as usize;
        if cpu_index >= per_cpu.len() {
            continue;
        }
        let bits = platform.get_smm_register(cpu_index);
        if bits.blocked || !bits.enable {
            count += 1;
        }
    }
    count
}

fn all_cpus_arrived<P: Platform>(
    platform: &P,
    global: &GlobalSync,
    per_cpu: &[PerCpu],
    first_thread_of_package: &[core::sync::atomic::AtomicI32],
) -> bool {
    let n = per_cpu.len() as u32;
    let counter = global.counter.load();
    if counter == n {
        return true;
    }
    let blocked_or_disabled = blocked_and_disabled_count(platform, per_cpu, first_thread_of_package);
    counter + blocked_or_disabled >= n
}

/// Run one bounded wait loop, returning `true` if it ended because
/// every CPU arrived (or was accounted for) rather than because the
/// timer expired.
fn wait_once<P: Platform>(
    platform: &P,
    global: &GlobalSync,
    per_cpu: &[PerCpu],
    first_thread_of_package: &[core::sync::atomic::AtomicI32],
    lmce_signaled: impl Fn() -> bool,
) -> bool {
    let timer = platform.start_sync_timer();
    loop {
        if all_cpus_arrived(platform, global, per_cpu, first_thread_of_package) {
            return true;
        }
        if lmce_signaled() {
            return true;
        }
        if platform.is_sync_timer_timeout(&timer) {
            return false;
        }
        core::hint::spin_loop();
    }
}

/// Run the full two-phase gate (§4.2). `lmce_signaled` reports whether
/// a local machine-check exception is latched and LMCE is enabled,
/// short-circuiting either phase.
pub fn run<P: Platform>(
    platform: &P,
    global: &GlobalSync,
    per_cpu: &[PerCpu],
    first_thread_of_package: &[core::sync::atomic::AtomicI32],
    lmce_signaled: impl Fn() -> bool,
) -> ArrivalResult {
    if wait_once(platform, global, per_cpu, first_thread_of_package, &lmce_signaled) {
        return ArrivalResult {
            all_arrived_without_exception: true,
        };
    }

    for (index, cpu) in per_cpu.iter().enumerate() {
        if cpu.is_present() {
            continue;
        }
        if !platform.is_valid_apic_id(index as u32) {
            continue;
        }
        platform.send_smi_ipi(index as u32);
    }

    let arrived_second_phase =
        wait_once(platform, global, per_cpu, first_thread_of_package, &lmce_signaled);

    ArrivalResult {
        all_arrived_without_exception: arrived_second_phase,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::tests::MockPlatform;
    use core::sync::atomic::AtomicI32;

    fn make_per_cpu(n: usize) -> Vec<PerCpu> {
        (0..n).map(|_| PerCpu::new()).collect()
    }

    #[test]
    fn completes_immediately_when_everyone_already_checked_in() {
        let platform = MockPlatform::new(vec![0, 1], false);
        let global = GlobalSync::new(crate::global::SyncMode::Traditional);
        let per_cpu = make_per_cpu(2);
        per_cpu[0].mark_present();
        per_cpu[1].mark_present();
        global.counter.release();
        global.counter.release();

        let packages: [AtomicI32; 1] = [AtomicI32::new(-1)];
        let result = run(&platform, &global, &per_cpu, &packages, || false);
        assert!(result.all_arrived_without_exception);
        assert!(platform.smi_ipis_sent.lock().unwrap().is_empty());
    }

    #[test]
    fn disabled_package_first_thread_counts_toward_arrival() {
        // 4 CPUs, 1 disabled (scenario 2, §8): counter=3 + disabled=1 == N.
        struct DisabledThirdCpuPlatform;
        impl Platform for DisabledThirdCpuPlatform {
            type Timer = u64;
            type Mtrr = u64;
            fn start_sync_timer(&self) -> u64 {
                0
            }
            fn is_sync_timer_timeout(&self, _t: &u64) -> bool {
                false
            }
            fn send_smi_ipi(&self, _apic_id: u32) {}
            fn clear_top_level_smi_status(&self) -> bool {
                true
            }
            fn platform_valid_smi(&self) -> bool {
                true
            }
            fn platform_bsp_election(
                &self,
                _cpu_index: usize,
            ) -> crate::error::Result<Option<bool>> {
                Ok(None)
            }
            fn get_smm_register(&self, cpu_index: usize) -> crate::platform::SmmRegisterBits {
                crate::platform::SmmRegisterBits {
                    delayed: false,
                    blocked: cpu_index == 2,
                    enable: true,
                }
            }
            fn needs_configure_mtrrs(&self) -> bool {
                false
            }
            fn mtrr_get_all(&self) -> u64 {
                0
            }
            fn mtrr_set_all(&self, _s: &u64) {}
            fn smi_mtrr_template(&self) -> u64 {
                0
            }
            fn disable_smrr(&self) {}
            fn reenable_smrr(&self) {}
            fn rendezvous_entry(&self, _cpu_index: usize) {}
            fn rendezvous_exit(&self, _cpu_index: usize) {}
            fn is_valid_apic_id(&self, _apic_id: u32) -> bool {
                true
            }
            fn is_cpu_marked_for_removal(&self, _cpu_index: usize) -> bool {
                false
            }
            fn supports_dispatch_timeout(&self) -> bool {
                false
            }
            fn foundation_entry(&self, _bsp_index: usize) {}
        }

        let platform = DisabledThirdCpuPlatform;
        let global = GlobalSync::new(crate::global::SyncMode::Traditional);
        let per_cpu = make_per_cpu(4);
        for cpu in per_cpu.iter().take(3) {
            cpu.mark_present();
        }
        for _ in 0..3 {
            global.counter.release();
        }
        // One package, its first thread is CPU 2 (the disabled one).
        let packages: [AtomicI32; 1] = [AtomicI32::new(2)];

        let result = run(&platform, &global, &per_cpu, &packages, || false);
        assert!(result.all_arrived_without_exception);
    }

    #[test]
    fn second_phase_sends_ipis_only_to_absent_cpus() {
        let mut platform = MockPlatform::new(vec![0, 1, 2, 3], false);
        platform.timeout_after_ticks = 3;
        let global = GlobalSync::new(crate::global::SyncMode::Traditional);
        let per_cpu = make_per_cpu(4);
        per_cpu[0].mark_present();
        per_cpu[1].mark_present();
        per_cpu[2].mark_present();
        for _ in 0..3 {
            global.counter.release();
        }
        let packages: [AtomicI32; 1] = [AtomicI32::new(-1)];

        // Advance the tick counter on a background thread so both
        // wait_once calls eventually time out deterministically.
        let tick_handle = {
            use std::sync::atomic::Ordering;
            let tick = &platform.tick;
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    for _ in 0..20 {
                        tick.fetch_add(1, Ordering::Relaxed);
                        std::thread::yield_now();
                    }
                });
                run(&platform, &global, &per_cpu, &packages, || false)
            })
        };

        assert!(!tick_handle.all_arrived_without_exception);
        let sent = platform.smi_ipis_sent.lock().unwrap();
        assert_eq!(*sent, vec![3]);
    }
}
