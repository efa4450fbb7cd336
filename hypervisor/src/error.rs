use {
    crate::intel::{vmerror::VmxFailure, vmx::RootModeState},
    thiserror_no_std::Error,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Intel CPU not found")]
    CPUUnsupported,
    #[error("VMX is not supported")]
    VMXUnsupported,
    #[error("VMX locked off in BIOS")]
    VMXBIOSLock,
    #[error("Failed to execute VMXON ({failure}), processor left in {state}")]
    VMXONFailed {
        failure: VmxFailure,
        state: RootModeState,
    },
    #[error("Failed to execute VMCLEAR ({failure}), processor left in {state}")]
    VMCLEARFailed {
        failure: VmxFailure,
        state: RootModeState,
    },
    #[error("Failed to execute VMPTRLD ({failure}), processor left in {state}")]
    VMPTRLDFailed {
        failure: VmxFailure,
        state: RootModeState,
    },
    #[error("Failed to execute VMXOFF ({failure}), processor left in {state}")]
    VMXOFFFailed {
        failure: VmxFailure,
        state: RootModeState,
    },
}

impl HypervisorError {
    /// The root-mode state the processor was left in, for instruction failures.
    pub fn state(&self) -> Option<RootModeState> {
        match self {
            Self::VMXONFailed { state, .. }
            | Self::VMCLEARFailed { state, .. }
            | Self::VMPTRLDFailed { state, .. }
            | Self::VMXOFFFailed { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// How the VMX instruction reported failure, for instruction failures.
    pub fn failure(&self) -> Option<VmxFailure> {
        match self {
            Self::VMXONFailed { failure, .. }
            | Self::VMCLEARFailed { failure, .. }
            | Self::VMPTRLDFailed { failure, .. }
            | Self::VMXOFFFailed { failure, .. } => Some(*failure),
            _ => None,
        }
    }
}
