//! Local APIC (Advanced Programmable Interrupt Controller) driver.
//!
//! Every logical processor has its own Local APIC. The rendezvous core
//! uses it for exactly one thing the core itself cannot do: sending a
//! directed SMI to a specific APIC ID when the arrival gate's first
//! timeout expires (§4.2). Enabling the APIC, arming the spurious
//! vector, and programming the APIC timer are platform bring-up's job
//! (§1): by the time SMM code runs, the APIC is already live and this
//! driver only needs to know where it is mapped.
//!
//! The APIC registers are memory-mapped starting at the base address
//! stored in the IA32_APIC_BASE MSR (0x1B).

use core::ptr;

/// Interrupt Command Register, low dword. Writing this dword triggers
/// IPI delivery using the fields set here and in the high dword.
const APIC_REG_ICR_LOW: u32 = 0x300;
/// Interrupt Command Register, high dword. Holds the destination APIC ID.
const APIC_REG_ICR_HIGH: u32 = 0x310;

/// ICR bit 14: Level, set for assert.
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
/// ICR delivery status bit 12: 1 while the IPI is still pending send.
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
/// ICR destination mode: physical (bit 11 clear).
const ICR_DEST_PHYSICAL: u32 = 0;

/// Delivery mode field (ICR bits 8-10).
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliver an SMI. Vector bits are ignored by the receiving core.
    Smi = 0b010 << 8,
}

/// The Local APIC virtual base address, set once by [`set_base`] during
/// platform bring-up, before the first SMI can fire.
static mut APIC_BASE: u64 = 0;

/// Read a 32-bit APIC register.
#[inline]
unsafe fn read_reg(offset: u32) -> u32 {
    let addr = APIC_BASE + offset as u64;
    ptr::read_volatile(addr as *const u32)
}

/// Write a 32-bit APIC register.
#[inline]
unsafe fn write_reg(offset: u32, value: u32) {
    let addr = APIC_BASE + offset as u64;
    ptr::write_volatile(addr as *mut u32, value);
}

/// Record the Local APIC's mapped base address.
///
/// Platform bring-up has already read IA32_APIC_BASE, mapped it, and
/// enabled the APIC itself (§1, out of scope here); this just tells
/// [`send_ipi`] where to find it.
///
/// # Safety
///
/// Must run once, before any call to [`send_ipi`], and `base` must be
/// the real mapped APIC MMIO base for the calling CPU.
pub unsafe fn set_base(base: u64) {
    APIC_BASE = base;
}

/// Send a directed IPI to a single destination APIC ID and wait for the
/// write to leave the local APIC's send buffer.
///
/// This is the primitive the arrival gate's second phase is built on:
/// after the first timeout, every CPU still missing from the roster gets
/// `send_ipi(apic_id, DeliveryMode::Smi, 0)` so that any processor
/// currently blocked or delayed outside SMM has an SMI latched and will
/// trap in before it executes another normal-mode instruction.
///
/// # Safety
///
/// [`set_base`] must already have run, and `apic_id` must name a
/// processor that exists in the system, sending to an absent ID is
/// harmless on real hardware but is still the caller's contract to
/// uphold.
pub unsafe fn send_ipi(apic_id: u32, mode: DeliveryMode, vector: u8) {
    write_reg(APIC_REG_ICR_HIGH, apic_id << 24);

    let command = vector as u32 | mode as u32 | ICR_DEST_PHYSICAL | ICR_LEVEL_ASSERT;
    write_reg(APIC_REG_ICR_LOW, command);

    while read_reg(APIC_REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
}
