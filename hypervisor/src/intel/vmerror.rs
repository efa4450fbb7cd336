//! Failure reporting for VMX instructions.
//!
//! A VMX instruction either succeeds (`VMsucceed`), fails without a current VMCS
//! (`VMfailInvalid`, RFLAGS.CF = 1) or fails with a current VMCS (`VMfailValid`, RFLAGS.ZF = 1),
//! in which case the reason is stored in the VM-instruction error field.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.2 CONVENTIONS

use core::fmt;

/// Outcome of a failed VMX instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxFailure {
    /// RFLAGS.CF was set; there is no current VMCS to hold an error number.
    VmFailInvalid,

    /// RFLAGS.ZF was set; carries the decoded VM-instruction error field if it could be read.
    VmFailValid(Option<VmInstructionError>),
}

impl fmt::Display for VmxFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmFailInvalid => write!(f, "VMfailInvalid"),
            Self::VmFailValid(Some(error)) => write!(f, "VMfailValid: {}", error),
            Self::VmFailValid(None) => write!(f, "VMfailValid: unknown instruction error"),
        }
    }
}

/// VM-instruction error numbers.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 31-1. VM-Instruction Error Numbers
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmInstructionError {
    VmcallInRoot = 1,
    VmclearInvalidAddress = 2,
    VmclearWithVmxonPointer = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    VmEntryInvalidControlFields = 7,
    VmEntryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldWithVmxonPointer = 10,
    VmptrldIncorrectVmcsRevision = 11,
    VmreadVmwriteUnsupportedVmcsComponent = 12,
    VmwriteReadonlyVmcsComponent = 13,
    VmxonInRoot = 15,
    VmEntryInvalidExecutiveVmcsPointer = 16,
    VmEntryNonLaunchedExecutiveVmcs = 17,
    VmEntryExecutiveVmcsPointerNotVmxonPointer = 18,
    VmcallNonClearVmcs = 19,
    VmcallInvalidVmExitControlFields = 20,
    VmcallIncorrectMsegRevision = 22,
    VmxoffUnderDualMonitorTreatment = 23,
    VmcallInvalidSmmMonitorFeatures = 24,
    VmEntryInvalidVmExecutionControlFieldsExecutiveVmcs = 25,
    VmEntryEventsBlockedByMovSs = 26,
    InvalidOperandToInveptInvvpid = 28,
}

impl VmInstructionError {
    /// Human-readable text from Table 31-1.
    #[rustfmt::skip]
    pub const fn description(&self) -> &'static str {
        use VmInstructionError::*;
        match self {
            VmcallInRoot => "VMCALL executed in VMX root operation",
            VmclearInvalidAddress => "VMCLEAR with invalid physical address",
            VmclearWithVmxonPointer => "VMCLEAR with VMXON pointer",
            VmlaunchNonClearVmcs => "VMLAUNCH with non-clear VMCS",
            VmresumeNonLaunchedVmcs => "VMRESUME with non-launched VMCS",
            VmresumeAfterVmxoff => "VMRESUME after VMXOFF",
            VmEntryInvalidControlFields => "VM entry with invalid control field(s)",
            VmEntryInvalidHostState => "VM entry with invalid host-state field(s)",
            VmptrldInvalidAddress => "VMPTRLD with invalid physical address",
            VmptrldWithVmxonPointer => "VMPTRLD with VMXON pointer",
            VmptrldIncorrectVmcsRevision => "VMPTRLD with incorrect VMCS revision identifier",
            VmreadVmwriteUnsupportedVmcsComponent => "VMREAD/VMWRITE from/to unsupported VMCS component",
            VmwriteReadonlyVmcsComponent => "VMWRITE to read-only VMCS component",
            VmxonInRoot => "VMXON executed in VMX root operation",
            VmEntryInvalidExecutiveVmcsPointer => "VM entry with invalid executive-VMCS pointer",
            VmEntryNonLaunchedExecutiveVmcs => "VM entry with non-launched executive VMCS",
            VmEntryExecutiveVmcsPointerNotVmxonPointer => "VM entry with executive-VMCS pointer not VMXON pointer",
            VmcallNonClearVmcs => "VMCALL with non-clear VMCS",
            VmcallInvalidVmExitControlFields => "VMCALL with invalid VM-exit control fields",
            VmcallIncorrectMsegRevision => "VMCALL with incorrect MSEG revision identifier",
            VmxoffUnderDualMonitorTreatment => "VMXOFF under dual-monitor treatment of SMIs and SMM",
            VmcallInvalidSmmMonitorFeatures => "VMCALL with invalid SMM-monitor features",
            VmEntryInvalidVmExecutionControlFieldsExecutiveVmcs => "VM entry with invalid VM-execution control fields in executive VMCS",
            VmEntryEventsBlockedByMovSs => "VM entry with events blocked by MOV SS",
            InvalidOperandToInveptInvvpid => "Invalid operand to INVEPT/INVVPID",
        }
    }
}

impl TryFrom<u32> for VmInstructionError {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use VmInstructionError::*;
        Ok(match value {
            1 => VmcallInRoot,
            2 => VmclearInvalidAddress,
            3 => VmclearWithVmxonPointer,
            4 => VmlaunchNonClearVmcs,
            5 => VmresumeNonLaunchedVmcs,
            6 => VmresumeAfterVmxoff,
            7 => VmEntryInvalidControlFields,
            8 => VmEntryInvalidHostState,
            9 => VmptrldInvalidAddress,
            10 => VmptrldWithVmxonPointer,
            11 => VmptrldIncorrectVmcsRevision,
            12 => VmreadVmwriteUnsupportedVmcsComponent,
            13 => VmwriteReadonlyVmcsComponent,
            15 => VmxonInRoot,
            16 => VmEntryInvalidExecutiveVmcsPointer,
            17 => VmEntryNonLaunchedExecutiveVmcs,
            18 => VmEntryExecutiveVmcsPointerNotVmxonPointer,
            19 => VmcallNonClearVmcs,
            20 => VmcallInvalidVmExitControlFields,
            22 => VmcallIncorrectMsegRevision,
            23 => VmxoffUnderDualMonitorTreatment,
            24 => VmcallInvalidSmmMonitorFeatures,
            25 => VmEntryInvalidVmExecutionControlFieldsExecutiveVmcs,
            26 => VmEntryEventsBlockedByMovSs,
            28 => InvalidOperandToInveptInvvpid,
            unknown => return Err(unknown),
        })
    }
}

impl fmt::Display for VmInstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", *self as u32, self.description())
    }
}
