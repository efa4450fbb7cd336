//! Fixed bits in CR0 and CR4.
//!
//! In VMX operation the processor fixes certain CR0/CR4 bits to specific values. The
//! `IA32_VMX_CRx_FIXED0` MSRs report bits that must be 1 and the `IA32_VMX_CRx_FIXED1` MSRs
//! report bits that may be 1 (anything outside them must be 0).
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.8 RESTRICTIONS ON VMX OPERATION
//! and A.7/A.8 VMX-FIXED BITS IN CR0/CR4

use {crate::intel::cpu::Cpu, x86::msr};

/// The must-be-1 / may-be-1 pair for one control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBits {
    /// `IA32_VMX_CRx_FIXED0`: every set bit must be 1.
    pub must_be_one: u64,

    /// `IA32_VMX_CRx_FIXED1`: every clear bit must be 0.
    pub may_be_one: u64,
}

impl FixedBits {
    /// Sets the must-be-1 bits and clears the bits outside may-be-1, leaving the rest as they are.
    pub const fn apply(&self, value: u64) -> u64 {
        (value | self.must_be_one) & self.may_be_one
    }

    /// Whether `value` already satisfies both masks.
    pub const fn is_satisfied_by(&self, value: u64) -> bool {
        value & self.must_be_one == self.must_be_one && value & !self.may_be_one == 0
    }
}

/// Fixed-bit masks of CR0 and CR4 as reported by the executing processor.
///
/// Read fresh on every enforcement; logical processors may report different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBitMasks {
    /// `IA32_VMX_CR0_FIXED0` / `IA32_VMX_CR0_FIXED1`.
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.7 VMX-FIXED BITS IN CR0
    pub cr0: FixedBits,

    /// `IA32_VMX_CR4_FIXED0` / `IA32_VMX_CR4_FIXED1`.
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.8 VMX-FIXED BITS IN CR4
    pub cr4: FixedBits,
}

impl FixedBitMasks {
    /// Reads the four `IA32_VMX_CRx_FIXEDy` capability MSRs.
    pub fn read<C: Cpu>(cpu: &C) -> Self {
        Self {
            cr0: FixedBits {
                must_be_one: cpu.read_msr(msr::IA32_VMX_CR0_FIXED0),
                may_be_one: cpu.read_msr(msr::IA32_VMX_CR0_FIXED1),
            },
            cr4: FixedBits {
                must_be_one: cpu.read_msr(msr::IA32_VMX_CR4_FIXED0),
                may_be_one: cpu.read_msr(msr::IA32_VMX_CR4_FIXED1),
            },
        }
    }
}

/// A snapshot of CR0 and CR4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr4: u64,
}

impl ControlRegisters {
    /// Reads CR0 and CR4 from the executing processor.
    pub fn capture<C: Cpu>(cpu: &C) -> Self {
        Self {
            cr0: cpu.read_cr0(),
            cr4: cpu.read_cr4(),
        }
    }

    /// Returns the snapshot adjusted to the fixed bits. Pure; nothing is written.
    pub const fn enforce(self, masks: &FixedBitMasks) -> Self {
        Self {
            cr0: masks.cr0.apply(self.cr0),
            cr4: masks.cr4.apply(self.cr4),
        }
    }

    /// Writes the snapshot back to the executing processor.
    pub fn apply<C: Cpu>(&self, cpu: &mut C) {
        cpu.write_cr0(self.cr0);
        cpu.write_cr4(self.cr4);
    }
}

/// Sets and clears the mandatory bits in CR0 and CR4 on the executing processor.
///
/// Returns the values that were written. Contradictory masks are not detected.
pub fn enforce_fixed_control_bits<C: Cpu>(cpu: &mut C) -> ControlRegisters {
    let masks = FixedBitMasks::read(cpu);
    let current = ControlRegisters::capture(cpu);
    let adjusted = current.enforce(&masks);

    log::debug!("CR0: {:#x} -> {:#x}", current.cr0, adjusted.cr0);
    log::debug!("CR4: {:#x} -> {:#x}", current.cr4, adjusted.cr4);

    adjusted.apply(cpu);
    adjusted
}
