//! The VMXON region and the VMCS revision identifier.
//!
//! The region itself is allocated, mapped and freed by the caller; this module only
//! describes its layout and stamps the revision identifier into it.

use {
    crate::intel::cpu::Cpu,
    bit_field::BitField,
    static_assertions::const_assert_eq,
    x86::{current::paging::BASE_PAGE_SIZE, msr},
};

/// A representation of the VMXON region in memory.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.11.5 VMXON Region
#[repr(C, align(4096))]
pub struct Vmxon {
    /// Revision ID required for VMXON. Bit 31 must be 0.
    pub revision_id: u32,

    /// Rest of the region, owned by the processor once VMXON succeeds.
    pub data: [u8; BASE_PAGE_SIZE - 4],
}

const_assert_eq!(core::mem::size_of::<Vmxon>(), BASE_PAGE_SIZE);

impl Vmxon {
    /// An all-zero region.
    pub const fn zeroed() -> Self {
        Self {
            revision_id: 0,
            data: [0; BASE_PAGE_SIZE - 4],
        }
    }

    /// Stamps the processor's revision identifier into the region.
    pub fn init<C: Cpu>(&mut self, cpu: &C) {
        self.revision_id = vmcs_revision_id(cpu);
        self.revision_id.set_bit(31, false);
    }
}

/// The VMCS revision identifier, `IA32_VMX_BASIC[30:0]`.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.1 BASIC VMX INFORMATION
pub fn vmcs_revision_id<C: Cpu>(cpu: &C) -> u32 {
    cpu.read_msr(msr::IA32_VMX_BASIC).get_bits(0..31) as u32
}
