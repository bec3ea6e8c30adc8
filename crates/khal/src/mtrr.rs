//! Memory Type Range Register (MTRR) access.
//!
//! The rendezvous core saves every CPU's MTRRs before it applies the
//! SMI-safe set and restores them before exit; both the save and the
//! apply operation are plain MSR reads and writes, so there is nothing
//! here beyond enumerating which MSRs make up "all MTRRs" on this CPU.
//!
//! Variable-range count and the existence of MTRR_DEF_TYPE come from
//! CPUID/IA32_MTRRCAP, not guessed here. `snapshot`/`restore` copy the
//! full MSR set; anything fancier (merging overlapping ranges, WC
//! detection) is firmware policy the core does not need.

const IA32_MTRRCAP: u32 = 0xFE;
const IA32_MTRR_DEF_TYPE: u32 = 0x2FF;
const IA32_MTRR_FIX64K_00000: u32 = 0x250;
const IA32_MTRR_FIX16K_80000: u32 = 0x258;
const IA32_MTRR_FIX16K_A0000: u32 = 0x259;
const IA32_MTRR_FIX4K_C0000: u32 = 0x268;
const IA32_MTRR_PHYSBASE0: u32 = 0x200;

/// Upper bound on variable-range MTRR pairs a real CPU reports through
/// IA32_MTRRCAP. Used only to size the snapshot buffer.
pub const MAX_VARIABLE_RANGES: usize = 16;

/// A full MTRR snapshot for one logical processor: fixed-range MSRs,
/// `MTRR_DEF_TYPE`, and as many variable-range base/mask pairs as the
/// CPU actually implements.
#[derive(Clone, Copy)]
pub struct MtrrState {
    pub def_type: u64,
    pub fixed: [u64; 11],
    pub variable_count: u8,
    pub variable: [(u64, u64); MAX_VARIABLE_RANGES],
}

impl MtrrState {
    pub const fn empty() -> Self {
        Self {
            def_type: 0,
            fixed: [0; 11],
            variable_count: 0,
            variable: [(0, 0); MAX_VARIABLE_RANGES],
        }
    }
}

#[inline]
unsafe fn rdmsr(msr: u32) -> u64 {
    let (low, high): (u32, u32);
    core::arch::asm!(
        "rdmsr",
        in("ecx") msr,
        out("eax") low,
        out("edx") high,
        options(nomem, nostack, preserves_flags)
    );
    (high as u64) << 32 | low as u64
}

#[inline]
unsafe fn wrmsr(msr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    core::arch::asm!(
        "wrmsr",
        in("ecx") msr,
        in("eax") low,
        in("edx") high,
        options(nomem, nostack, preserves_flags)
    );
}

/// Number of variable-range MTRR pairs this CPU implements, read from
/// the low byte of IA32_MTRRCAP.
pub fn variable_range_count() -> u8 {
    let count = unsafe { rdmsr(IA32_MTRRCAP) } & 0xFF;
    core::cmp::min(count as u8, MAX_VARIABLE_RANGES as u8)
}

/// Read every MTRR on the calling CPU into a snapshot.
///
/// # Safety
///
/// Must run with the SMRR-disable step already done by the caller if the
/// read is meant to observe ranges the SMRR would otherwise shadow; this
/// function does not itself touch SMRR state.
pub unsafe fn snapshot() -> MtrrState {
    let mut state = MtrrState::empty();
    state.def_type = rdmsr(IA32_MTRR_DEF_TYPE);

    state.fixed[0] = rdmsr(IA32_MTRR_FIX64K_00000);
    state.fixed[1] = rdmsr(IA32_MTRR_FIX16K_80000);
    state.fixed[2] = rdmsr(IA32_MTRR_FIX16K_A0000);
    for i in 0..8 {
        state.fixed[3 + i] = rdmsr(IA32_MTRR_FIX4K_C0000 + i as u32);
    }

    let count = variable_range_count();
    state.variable_count = count;
    for i in 0..count as u32 {
        let base = rdmsr(IA32_MTRR_PHYSBASE0 + i * 2);
        let mask = rdmsr(IA32_MTRR_PHYSBASE0 + i * 2 + 1);
        state.variable[i as usize] = (base, mask);
    }
    state
}

/// Write a previously captured snapshot back to the calling CPU's MTRRs.
///
/// # Safety
///
/// The snapshot must have been produced by [`snapshot`] on a CPU with an
/// identical MTRR layout (same `variable_range_count`). Writing a
/// mismatched or corrupted snapshot can make memory regions uncached or
/// incorrectly write-combined.
pub unsafe fn restore(state: &MtrrState) {
    wrmsr(IA32_MTRR_FIX64K_00000, state.fixed[0]);
    wrmsr(IA32_MTRR_FIX16K_80000, state.fixed[1]);
    wrmsr(IA32_MTRR_FIX16K_A0000, state.fixed[2]);
    for i in 0..8 {
        wrmsr(IA32_MTRR_FIX4K_C0000 + i as u32, state.fixed[3 + i]);
    }
    for i in 0..state.variable_count as u32 {
        let (base, mask) = state.variable[i as usize];
        wrmsr(IA32_MTRR_PHYSBASE0 + i * 2, base);
        wrmsr(IA32_MTRR_PHYSBASE0 + i * 2 + 1, mask);
    }
    wrmsr(IA32_MTRR_DEF_TYPE, state.def_type);
}
