//! Translation of native GDT segment descriptors into the form the VMCS host-state and
//! guest-state segment fields expect.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors,
//! 25.4.1 Guest Register State and Table 25-2. Format of Access Rights

use {
    crate::intel::{cpu::Cpu, descriptor::DescriptorTables},
    bit_field::BitField,
    bitfield::bitfield,
    x86::{dtables::DescriptorTablePointer, segmentation::SegmentSelector},
};

bitfield! {
    /// An 8-byte legacy segment descriptor as stored in the GDT.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Figure 3-8. Segment Descriptor
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct SegmentDescriptor(u64);
    impl Debug;

    pub u32, limit_low, set_limit_low: 15, 0;
    pub u64, base_low, set_base_low: 31, 16;
    pub u64, base_middle, set_base_middle: 39, 32;
    pub u8, segment_type, set_segment_type: 43, 40;
    pub descriptor_type, set_descriptor_type: 44;
    pub u8, dpl, set_dpl: 46, 45;
    pub present, set_present: 47;
    pub u32, limit_high, set_limit_high: 51, 48;
    // AVL
    pub available, set_available: 52;
    pub long_mode, set_long_mode: 53;
    pub default_big, set_default_big: 54;
    pub granularity, set_granularity: 55;
    pub u64, base_high, set_base_high: 63, 56;
}

impl SegmentDescriptor {
    /// The base, bits 15:0 + 23:16 + 31:24 of the three base fields.
    pub fn base(&self) -> u64 {
        (self.base_low() | self.base_middle() << 16 | self.base_high() << 24) & 0xFFFF_FFFF
    }

    /// The raw 20-bit limit. Not scaled by granularity.
    pub fn limit(&self) -> u32 {
        self.limit_low() | self.limit_high() << 16
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SegmentDescriptor {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

bitfield! {
    /// The 32-bit access-rights value of a VMCS segment field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-2. Format of Access Rights
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmxSegmentAccessRights(u32);
    impl Debug;

    pub u8, segment_type, set_segment_type: 3, 0;
    pub descriptor_type, set_descriptor_type: 4;
    pub u8, dpl, set_dpl: 6, 5;
    pub present, set_present: 7;
    pub available, set_available: 12;
    pub long_mode, set_long_mode: 13;
    pub default_big, set_default_big: 14;
    pub granularity, set_granularity: 15;
    pub unusable, set_unusable: 16;
}

impl VmxSegmentAccessRights {
    /// Copies the attribute fields of a native descriptor. `unusable` is left clear.
    pub fn from_descriptor(descriptor: &SegmentDescriptor) -> Self {
        let mut rights = Self::default();
        rights.set_segment_type(descriptor.segment_type());
        rights.set_descriptor_type(descriptor.descriptor_type());
        rights.set_dpl(descriptor.dpl());
        rights.set_present(descriptor.present());
        rights.set_available(descriptor.available());
        rights.set_long_mode(descriptor.long_mode());
        rights.set_default_big(descriptor.default_big());
        rights.set_granularity(descriptor.granularity());
        rights
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }
}

/// How the `unusable` access-rights bit is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnusablePolicy {
    /// Always report the segment as usable, including for the null selector and LDT selectors.
    #[default]
    AlwaysUsable,

    /// Report the null selector and LDT selectors as unusable.
    NullOrLocalUnusable,
}

/// Which VMCS state area a translated segment is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRole {
    /// Host-state selectors must have RPL and TI clear (26.2.3 Checks on Host Segment and Descriptor-Table Registers).
    Host,

    /// Guest-state selectors keep their RPL.
    Guest,
}

impl SegmentRole {
    const fn clears_rpl(self) -> bool {
        matches!(self, Self::Host)
    }
}

/// A segment in the layout of the VMCS selector, base, limit and access-rights fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmxSegmentDescriptor {
    /// Selector as loaded in the register, with RPL cleared for host state.
    pub selector: u16,
    /// The 32-bit base from the descriptor.
    pub base_address: u64,
    /// The raw 20-bit limit from the descriptor.
    pub segment_limit: u32,
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-2. Format of Access Rights
    pub access_rights: VmxSegmentAccessRights,
}

impl VmxSegmentDescriptor {
    /// Translates `selector` using the descriptor it indexes in `table`.
    ///
    /// The table is always indexed as the GDT, even when the selector's TI bit names the LDT.
    /// An index past the end of the table reads as a zero descriptor.
    pub fn from_table(selector: SegmentSelector, table: &[u64], clear_rpl: bool, policy: UnusablePolicy) -> Self {
        let raw = selector.bits();
        let index = usize::from(selector.index());
        let descriptor = SegmentDescriptor::from(table.get(index).copied().unwrap_or(0));

        let selector = if clear_rpl { raw & !0b11 } else { raw };

        let mut access_rights = VmxSegmentAccessRights::from_descriptor(&descriptor);
        let unusable = match policy {
            UnusablePolicy::AlwaysUsable => false,
            UnusablePolicy::NullOrLocalUnusable => raw == 0 || raw.get_bit(2),
        };
        access_rights.set_unusable(unusable);

        Self {
            selector,
            base_address: descriptor.base(),
            segment_limit: descriptor.limit(),
            access_rights,
        }
    }

    /// Translates `selector` against the GDT that `gdtr` points at.
    ///
    /// # Safety
    ///
    /// `gdtr` must describe a live, readable, 8-byte aligned descriptor table.
    pub unsafe fn from_selector(
        selector: SegmentSelector,
        gdtr: &DescriptorTablePointer<u64>,
        clear_rpl: bool,
        policy: UnusablePolicy,
    ) -> Self {
        let table = DescriptorTables::from_pointer(gdtr);
        Self::from_table(selector, table, clear_rpl, policy)
    }
}

/// The selectors of one processor's segment registers.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.3 Segment Registers
pub struct SegmentRegisters {
    /// Extra data segment.
    pub es: SegmentSelector,
    /// Code segment.
    pub cs: SegmentSelector,
    /// Stack segment.
    pub ss: SegmentSelector,
    /// Data segment.
    pub ds: SegmentSelector,
    pub fs: SegmentSelector,
    pub gs: SegmentSelector,
    /// Local descriptor table register. Translated against the GDT like the others.
    pub ldtr: SegmentSelector,
    /// Task register.
    pub tr: SegmentSelector,
}

/// The translated form of [`SegmentRegisters`], one entry per VMCS segment field group.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.1 Guest Register State
/// and 25.5.1 Host Register State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentStates {
    /// `ES` selector, base, limit and access rights.
    pub es: VmxSegmentDescriptor,
    /// `CS` selector, base, limit and access rights.
    pub cs: VmxSegmentDescriptor,
    /// `SS` selector, base, limit and access rights.
    pub ss: VmxSegmentDescriptor,
    /// `DS` selector, base, limit and access rights.
    pub ds: VmxSegmentDescriptor,
    /// `FS`. The 64-bit base lives in `IA32_FS_BASE`, not the descriptor.
    pub fs: VmxSegmentDescriptor,
    /// `GS`. The 64-bit base lives in `IA32_GS_BASE`, not the descriptor.
    pub gs: VmxSegmentDescriptor,
    /// `LDTR`. Guest state only; the host-state area has no LDTR fields.
    pub ldtr: VmxSegmentDescriptor,
    /// `TR` selector, base, limit and access rights.
    pub tr: VmxSegmentDescriptor,
}

impl SegmentRegisters {
    /// Translates every register against `table` for the given state area.
    pub fn translate(&self, table: &[u64], role: SegmentRole, policy: UnusablePolicy) -> SegmentStates {
        let clear_rpl = role.clears_rpl();
        let translate = |selector: SegmentSelector| VmxSegmentDescriptor::from_table(selector, table, clear_rpl, policy);

        SegmentStates {
            es: translate(self.es),
            cs: translate(self.cs),
            ss: translate(self.ss),
            ds: translate(self.ds),
            fs: translate(self.fs),
            gs: translate(self.gs),
            ldtr: translate(self.ldtr),
            tr: translate(self.tr),
        }
    }

    /// Translates every register against the GDT currently loaded on `cpu`.
    ///
    /// # Safety
    ///
    /// The GDTR of `cpu` must describe a live, readable, 8-byte aligned descriptor table.
    pub unsafe fn translate_current<C: Cpu>(&self, cpu: &C, role: SegmentRole, policy: UnusablePolicy) -> SegmentStates {
        let gdtr = cpu.sgdt();
        let table = DescriptorTables::from_pointer(&gdtr);

        log::debug!("GDT: {:#x} / {} entries", table.as_ptr() as u64, table.len());

        self.translate(table, role, policy)
    }
}
