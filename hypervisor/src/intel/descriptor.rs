//! Access to the descriptor table a GDTR points at.

use x86::dtables::DescriptorTablePointer;

/// Size of one legacy descriptor table entry.
pub const DESCRIPTOR_SIZE: usize = core::mem::size_of::<u64>();

pub struct DescriptorTables;

impl DescriptorTables {
    /// Gets the table as a slice of 8-byte entries from the pointer.
    ///
    /// # Safety
    ///
    /// `pointer` must describe a live, readable, 8-byte aligned table of `limit + 1` bytes that
    /// stays unchanged while the slice is in use.
    pub unsafe fn from_pointer(pointer: &DescriptorTablePointer<u64>) -> &[u64] {
        let base = pointer.base;
        let limit = pointer.limit;

        if base.is_null() {
            return &[];
        }

        debug_assert_eq!(base as usize % DESCRIPTOR_SIZE, 0, "unaligned descriptor table");

        core::slice::from_raw_parts(base, (usize::from(limit) + 1) / DESCRIPTOR_SIZE)
    }
}
