//! Entering and leaving VMX root operation on the current logical processor.
//!
//! Entry: CR4.VMXE -> fixed bits -> VMXON -> VMCLEAR -> VMPTRLD.
//! Exit: VMCLEAR -> VMXOFF -> clear CR4.VMXE.
//!
//! Nothing is rolled back on failure. The returned state (on both success and failure)
//! tells the caller exactly how far the sequence got, so it can choose its own cleanup.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.7 ENABLING AND ENTERING VMX OPERATION

use {
    crate::{
        error::HypervisorError,
        intel::{
            controls::enforce_fixed_control_bits,
            cpu::Cpu,
            vmerror::{VmInstructionError, VmxFailure},
        },
    },
    bit_field::BitField,
    core::fmt,
    x86::{
        bits64::paging::{PAddr, VAddr},
        vmx::VmFail,
    },
};

/// CR4.VMXE
const CR4_VMX_ENABLE_BIT: usize = 13;

/// Where a processor is in the root-mode lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RootModeState {
    /// CR4.VMXE clear, not in VMX operation.
    Disabled,
    /// CR4.VMXE set.
    CapabilityEnabled,
    /// CR0/CR4 satisfy the VMX fixed bits.
    FixedBitsEnforced,
    /// VMXON succeeded.
    On,
    /// VMCLEAR succeeded; the VMCS is inactive and clear.
    Cleared,
    /// VMPTRLD succeeded; the VMCS is current on this processor.
    Bound,
    /// VMXOFF issued and CR4.VMXE cleared.
    CapabilityDisabled,
}

impl fmt::Display for RootModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "Disabled",
            Self::CapabilityEnabled => "CapabilityEnabled",
            Self::FixedBitsEnforced => "FixedBitsEnforced",
            Self::On => "On",
            Self::Cleared => "Cleared",
            Self::Bound => "Bound",
            Self::CapabilityDisabled => "CapabilityDisabled",
        };
        f.write_str(name)
    }
}

/// Per-processor regions supplied by the caller.
///
/// The VMXON region must be zeroed with its revision identifier stamped, the VMCS region
/// zeroed. Both stay owned by the caller; only the physical addresses are handed to the
/// processor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcessorContext {
    /// Virtual address of the VMXON region, used for logging only.
    pub vmxon_region: VAddr,

    /// Physical address handed to VMXON. Must be 4 KiB aligned.
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.11.5 VMXON Region
    pub vmxon_region_physical: PAddr,

    /// Virtual address of the VMCS region, used for logging only.
    pub vmcs_region: VAddr,

    /// Physical address handed to VMCLEAR and VMPTRLD. Must be 4 KiB aligned.
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.2 FORMAT OF THE VMCS REGION
    pub vmcs_region_physical: PAddr,
}

/// Sets CR4.VMXE on the executing processor.
pub fn enable_vmx_operation<C: Cpu>(cpu: &mut C) {
    let mut cr4 = cpu.read_cr4();
    cr4.set_bit(CR4_VMX_ENABLE_BIT, true);
    cpu.write_cr4(cr4);
}

/// Clears CR4.VMXE on the executing processor.
pub fn disable_vmx_operation<C: Cpu>(cpu: &mut C) {
    let mut cr4 = cpu.read_cr4();
    cr4.set_bit(CR4_VMX_ENABLE_BIT, false);
    cpu.write_cr4(cr4);
}

/// Brings the executing processor into VMX root operation with the context's VMCS current.
///
/// On failure the error names the instruction that failed and the state the processor was
/// left in. Earlier steps are not undone: a failed VMCLEAR or VMPTRLD leaves VMX operation on.
pub fn enter_root_mode<C: Cpu>(cpu: &mut C, context: &ProcessorContext) -> Result<RootModeState, HypervisorError> {
    log::info!("Enabling Virtual Machine Extensions (VMX)");
    enable_vmx_operation(cpu);

    log::info!("Adjusting Control Registers");
    enforce_fixed_control_bits(cpu);

    log::debug!(
        "VMXON Region: (V) {:#x} / (P) {:#x}",
        context.vmxon_region.as_u64(),
        context.vmxon_region_physical.as_u64()
    );
    log::debug!(
        "VMCS Region: (V) {:#x} / (P) {:#x}",
        context.vmcs_region.as_u64(),
        context.vmcs_region_physical.as_u64()
    );

    if let Err(fail) = cpu.vmxon(context.vmxon_region_physical.as_u64()) {
        let failure = vmx_failure(cpu, &fail);
        log::error!("VMXON failed: {}", failure);
        return Err(HypervisorError::VMXONFailed {
            failure,
            state: RootModeState::FixedBitsEnforced,
        });
    }
    log::info!("VMXON successful!");

    if let Err(fail) = cpu.vmclear(context.vmcs_region_physical.as_u64()) {
        let failure = vmx_failure(cpu, &fail);
        log::error!("VMCLEAR failed: {}", failure);
        return Err(HypervisorError::VMCLEARFailed {
            failure,
            state: RootModeState::On,
        });
    }
    log::info!("VMCLEAR successful!");

    if let Err(fail) = cpu.vmptrld(context.vmcs_region_physical.as_u64()) {
        let failure = vmx_failure(cpu, &fail);
        log::error!("VMPTRLD failed: {}", failure);
        return Err(HypervisorError::VMPTRLDFailed {
            failure,
            state: RootModeState::Cleared,
        });
    }
    log::info!("VMPTRLD successful!");

    Ok(RootModeState::Bound)
}

/// Takes the executing processor out of VMX root operation.
///
/// A VMCLEAR failure is logged and reported, but VMXOFF is still issued and CR4.VMXE still
/// cleared. A VMXOFF failure stops teardown with CR4.VMXE left set, since clearing it in VMX
/// operation raises #GP.
pub fn exit_root_mode<C: Cpu>(cpu: &mut C, context: &ProcessorContext) -> Result<RootModeState, HypervisorError> {
    let vmclear_failure = match cpu.vmclear(context.vmcs_region_physical.as_u64()) {
        Ok(()) => {
            log::info!("VMCLEAR successful!");
            None
        }
        Err(fail) => {
            let failure = vmx_failure(cpu, &fail);
            log::error!("VMCLEAR failed: {}", failure);
            Some(failure)
        }
    };

    if let Err(fail) = cpu.vmxoff() {
        let failure = vmx_failure(cpu, &fail);
        log::error!("VMXOFF failed: {}", failure);
        return Err(HypervisorError::VMXOFFFailed {
            failure,
            // A VMCS that failed to clear may still be current.
            state: match vmclear_failure {
                None => RootModeState::Cleared,
                Some(_) => RootModeState::Bound,
            },
        });
    }
    log::info!("VMXOFF successful!");

    disable_vmx_operation(cpu);
    log::info!("Virtual Machine Extensions (VMX) disabled");

    match vmclear_failure {
        None => Ok(RootModeState::CapabilityDisabled),
        Some(failure) => Err(HypervisorError::VMCLEARFailed {
            failure,
            state: RootModeState::CapabilityDisabled,
        }),
    }
}

/// Decodes a failed VMX instruction, reading the VM-instruction error field for `VMfailValid`.
fn vmx_failure<C: Cpu>(cpu: &C, fail: &VmFail) -> VmxFailure {
    match fail {
        VmFail::VmFailInvalid => VmxFailure::VmFailInvalid,
        VmFail::VmFailValid => VmxFailure::VmFailValid(
            cpu.vm_instruction_error()
                .and_then(|number| VmInstructionError::try_from(number).ok()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::cpu::simulated::{Call, Injected, Instruction, SimulatedCpu},
    };

    const VMXON_PA: u64 = 0x1000;
    const VMCS_PA: u64 = 0x2000;
    const CR4_VMXE: u64 = 1 << 13;

    fn context() -> ProcessorContext {
        ProcessorContext {
            vmxon_region: VAddr::from(0xFFFF_8000_0000_1000u64),
            vmxon_region_physical: PAddr::from(VMXON_PA),
            vmcs_region: VAddr::from(0xFFFF_8000_0000_2000u64),
            vmcs_region_physical: PAddr::from(VMCS_PA),
        }
    }

    fn processor() -> SimulatedCpu {
        SimulatedCpu::new(0x8000_0011, 0x0000_06F8).with_fixed_bits(0x8000_0021, 0xFFFF_FFFF, 0x2000, 0x7F_FFFF)
    }

    #[test]
    fn entry_reaches_bound_in_order() {
        let mut cpu = processor();

        let state = enter_root_mode(&mut cpu, &context());

        assert_eq!(state, Ok(RootModeState::Bound));
        assert_eq!(
            cpu.vmx_instructions(),
            vec![Call::Vmxon(VMXON_PA), Call::Vmclear(VMCS_PA), Call::Vmptrld(VMCS_PA)]
        );
        assert!(cpu.vmx_on);
        assert_eq!(cpu.current_vmcs, Some(VMCS_PA));
    }

    #[test]
    fn entry_enables_vmxe_and_fixed_bits_before_vmxon() {
        let mut cpu = processor();

        enter_root_mode(&mut cpu, &context()).unwrap();

        let vmxon = cpu.calls.iter().position(|call| *call == Call::Vmxon(VMXON_PA)).unwrap();
        assert_eq!(
            &cpu.calls[..vmxon],
            &[
                Call::WriteCr4(0x0000_06F8 | CR4_VMXE),
                Call::WriteCr0(0x8000_0031),
                Call::WriteCr4(0x0000_06F8 | CR4_VMXE),
            ]
        );
        assert_eq!(cpu.cr4 & CR4_VMXE, CR4_VMXE);
    }

    #[test]
    fn vmxon_failure_stops_before_vmclear() {
        let mut cpu = processor().fail(Instruction::Vmxon, Injected::Invalid);

        let error = enter_root_mode(&mut cpu, &context()).unwrap_err();

        assert_eq!(
            error,
            HypervisorError::VMXONFailed {
                failure: VmxFailure::VmFailInvalid,
                state: RootModeState::FixedBitsEnforced,
            }
        );
        assert_eq!(cpu.vmx_instructions(), vec![Call::Vmxon(VMXON_PA)]);
        assert!(!cpu.vmx_on);
    }

    #[test]
    fn vmxon_in_root_is_decoded() {
        let mut cpu = processor().fail(Instruction::Vmxon, Injected::Valid(15));

        let error = enter_root_mode(&mut cpu, &context()).unwrap_err();

        assert_eq!(
            error.failure(),
            Some(VmxFailure::VmFailValid(Some(VmInstructionError::VmxonInRoot)))
        );
    }

    #[test]
    fn vmclear_failure_leaves_vmx_on_without_rollback() {
        let mut cpu = processor().fail(Instruction::Vmclear, Injected::Valid(2));

        let error = enter_root_mode(&mut cpu, &context()).unwrap_err();

        assert_eq!(error.state(), Some(RootModeState::On));
        assert!(matches!(error, HypervisorError::VMCLEARFailed { .. }));
        assert_eq!(cpu.vmx_instructions(), vec![Call::Vmxon(VMXON_PA), Call::Vmclear(VMCS_PA)]);
        assert!(cpu.vmx_on);
        assert_eq!(cpu.cr4 & CR4_VMXE, CR4_VMXE);
    }

    #[test]
    fn vmptrld_failure_leaves_nothing_bound() {
        let mut cpu = processor().fail(Instruction::Vmptrld, Injected::Valid(11));

        let error = enter_root_mode(&mut cpu, &context()).unwrap_err();

        assert_eq!(
            error,
            HypervisorError::VMPTRLDFailed {
                failure: VmxFailure::VmFailValid(Some(VmInstructionError::VmptrldIncorrectVmcsRevision)),
                state: RootModeState::Cleared,
            }
        );
        assert_eq!(cpu.vmx_instructions().len(), 3);
        assert!(cpu.vmx_on);
        assert_eq!(cpu.current_vmcs, None);
    }

    #[test]
    fn unknown_instruction_error_is_kept_as_valid_failure() {
        let mut cpu = processor().fail(Instruction::Vmptrld, Injected::Valid(99));

        let error = enter_root_mode(&mut cpu, &context()).unwrap_err();

        assert_eq!(error.failure(), Some(VmxFailure::VmFailValid(None)));
    }

    #[test]
    fn exit_clears_before_vmxoff_and_drops_vmxe() {
        let mut cpu = processor();
        enter_root_mode(&mut cpu, &context()).unwrap();
        cpu.calls.clear();

        let state = exit_root_mode(&mut cpu, &context());

        assert_eq!(state, Ok(RootModeState::CapabilityDisabled));
        assert_eq!(cpu.vmx_instructions(), vec![Call::Vmclear(VMCS_PA), Call::Vmxoff]);
        assert!(!cpu.vmx_on);
        assert_eq!(cpu.cr4 & CR4_VMXE, 0);
    }

    #[test]
    fn exit_continues_teardown_after_vmclear_failure() {
        let mut cpu = processor();
        enter_root_mode(&mut cpu, &context()).unwrap();
        cpu.calls.clear();
        let mut cpu = cpu.fail(Instruction::Vmclear, Injected::Valid(2));

        let error = exit_root_mode(&mut cpu, &context()).unwrap_err();

        assert_eq!(
            error,
            HypervisorError::VMCLEARFailed {
                failure: VmxFailure::VmFailValid(Some(VmInstructionError::VmclearInvalidAddress)),
                state: RootModeState::CapabilityDisabled,
            }
        );
        assert_eq!(cpu.vmx_instructions(), vec![Call::Vmclear(VMCS_PA), Call::Vmxoff]);
        assert!(!cpu.vmx_on);
        assert_eq!(cpu.cr4 & CR4_VMXE, 0);
    }

    #[test]
    fn exit_keeps_vmxe_when_vmxoff_fails() {
        let mut cpu = processor();
        enter_root_mode(&mut cpu, &context()).unwrap();
        cpu.calls.clear();
        let mut cpu = cpu.fail(Instruction::Vmxoff, Injected::Invalid);

        let error = exit_root_mode(&mut cpu, &context()).unwrap_err();

        assert_eq!(
            error,
            HypervisorError::VMXOFFFailed {
                failure: VmxFailure::VmFailInvalid,
                state: RootModeState::Cleared,
            }
        );
        assert!(cpu.vmx_on);
        assert_eq!(cpu.cr4 & CR4_VMXE, CR4_VMXE);
        assert_eq!(cpu.calls, vec![Call::Vmclear(VMCS_PA), Call::Vmxoff]);
    }

    #[test]
    fn exit_reports_vmxoff_failure_over_vmclear_failure() {
        let mut cpu = processor();
        enter_root_mode(&mut cpu, &context()).unwrap();
        let mut cpu = cpu
            .fail(Instruction::Vmclear, Injected::Valid(2))
            .fail(Instruction::Vmxoff, Injected::Valid(23));

        let error = exit_root_mode(&mut cpu, &context()).unwrap_err();

        assert_eq!(
            error,
            HypervisorError::VMXOFFFailed {
                failure: VmxFailure::VmFailValid(Some(VmInstructionError::VmxoffUnderDualMonitorTreatment)),
                state: RootModeState::Bound,
            }
        );
        assert_eq!(cpu.current_vmcs, Some(VMCS_PA));
        assert_eq!(cpu.cr4 & CR4_VMXE, CR4_VMXE);
    }

    #[test]
    fn vmxe_toggle_preserves_other_cr4_bits() {
        let mut cpu = SimulatedCpu::new(0, 0x0000_06F8);

        enable_vmx_operation(&mut cpu);
        assert_eq!(cpu.cr4, 0x0000_26F8);

        disable_vmx_operation(&mut cpu);
        assert_eq!(cpu.cr4, 0x0000_06F8);
    }
}
