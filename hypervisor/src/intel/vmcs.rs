//! The VMCS region layout.

use {
    crate::intel::{cpu::Cpu, vmxon::vmcs_revision_id},
    bit_field::BitField,
    static_assertions::const_assert_eq,
    x86::current::paging::BASE_PAGE_SIZE,
};

/// Represents the VMCS region in memory.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.2 FORMAT OF THE VMCS REGION
#[repr(C, align(4096))]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub reserved: [u8; BASE_PAGE_SIZE - 8],
}

const_assert_eq!(core::mem::size_of::<Vmcs>(), BASE_PAGE_SIZE);

impl Vmcs {
    /// An all-zero region.
    pub const fn zeroed() -> Self {
        Self {
            revision_id: 0,
            abort_indicator: 0,
            reserved: [0; BASE_PAGE_SIZE - 8],
        }
    }

    /// Stamps the revision identifier; bit 31 (shadow-VMCS indicator) stays clear.
    pub fn init<C: Cpu>(&mut self, cpu: &C) {
        self.revision_id = vmcs_revision_id(cpu);
        self.revision_id.set_bit(31, false);
    }
}
