//! Discovering and enabling VMX support.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.6 DISCOVERING SUPPORT FOR VMX
//! and 24.7 ENABLING AND ENTERING VMX OPERATION

use {
    crate::{error::HypervisorError, intel::cpu::Cpu},
    bitflags::bitflags,
    x86::{cpuid::CpuId, msr},
};

bitflags! {
    /// The VMX-related bits of `IA32_FEATURE_CONTROL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControl: u64 {
        /// Once set, the MSR cannot be written until reset.
        const LOCKED = 1 << 0;

        /// VMXON is allowed inside SMX operation.
        const VMXON_INSIDE_SMX = 1 << 1;

        /// VMXON is allowed outside SMX operation.
        const VMXON_OUTSIDE_SMX = 1 << 2;
    }
}

/// Check to see if CPU is Intel ("GenuineIntel").
pub fn has_intel_cpu() -> Result<(), HypervisorError> {
    let cpuid = CpuId::new();
    if let Some(vi) = cpuid.get_vendor_info() {
        if vi.as_str() == "GenuineIntel" {
            return Ok(());
        }
    }
    Err(HypervisorError::CPUUnsupported)
}

/// Check processor supports for Virtual Machine Extension (VMX) technology - CPUID.1:ECX.VMX\[bit 5] = 1
pub fn has_vmx_support() -> Result<(), HypervisorError> {
    let cpuid = CpuId::new();
    if let Some(fi) = cpuid.get_feature_info() {
        if fi.has_vmx() {
            return Ok(());
        }
    }
    Err(HypervisorError::VMXUnsupported)
}

pub fn check_vmx_support() -> Result<(), HypervisorError> {
    has_intel_cpu()?;
    log::info!("CPU is Intel");

    has_vmx_support()?;
    log::info!("Virtual Machine Extension (VMX) technology is supported");

    Ok(())
}

/// Locks `IA32_FEATURE_CONTROL` with VMXON outside SMX allowed, unless firmware already locked it.
///
/// Fails with [`HypervisorError::VMXBIOSLock`] when the MSR is locked with VMXON outside SMX disabled.
pub fn enable_feature_control<C: Cpu>(cpu: &mut C) -> Result<(), HypervisorError> {
    let raw = cpu.read_msr(msr::IA32_FEATURE_CONTROL);
    let current = FeatureControl::from_bits_retain(raw);

    if !current.contains(FeatureControl::LOCKED) {
        let updated = current | FeatureControl::LOCKED | FeatureControl::VMXON_OUTSIDE_SMX;
        cpu.write_msr(msr::IA32_FEATURE_CONTROL, updated.bits());
        log::info!("Lock bit set via IA32_FEATURE_CONTROL");
    } else if !current.contains(FeatureControl::VMXON_OUTSIDE_SMX) {
        log::error!("IA32_FEATURE_CONTROL is locked with VMXON outside SMX disabled: {:#x}", raw);
        return Err(HypervisorError::VMXBIOSLock);
    }

    Ok(())
}
