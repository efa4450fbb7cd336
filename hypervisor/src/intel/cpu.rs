//! The narrow hardware-access surface used by the root-mode lifecycle.
//!
//! Everything that touches live processor state (control registers, MSRs, VMX
//! instructions, GDTR) goes through [`Cpu`], so the lifecycle and fixed-bit logic can be
//! driven by a simulated processor in tests and by [`IntelCpu`] on real hardware.

use {
    x86::{
        dtables::DescriptorTablePointer,
        vmx::{self, vmcs},
    },
    x86_64::registers::control::{Cr0, Cr4},
};

/// Privileged operations on the currently executing logical processor.
///
/// There is no processor parameter: every call applies to the core the caller is running on.
pub trait Cpu {
    /// Reads CR0.
    fn read_cr0(&self) -> u64;

    /// Writes CR0.
    fn write_cr0(&mut self, value: u64);

    /// Reads CR4.
    fn read_cr4(&self) -> u64;

    /// Writes CR4.
    fn write_cr4(&mut self, value: u64);

    /// Reads a model-specific register.
    fn read_msr(&self, msr: u32) -> u64;

    /// Writes a model-specific register.
    fn write_msr(&mut self, msr: u32, value: u64);

    /// Enter VMX operation with the VMXON region at `vmxon_pa`.
    fn vmxon(&mut self, vmxon_pa: u64) -> vmx::Result<()>;

    /// Clear the VMCS at `vmcs_pa`.
    fn vmclear(&mut self, vmcs_pa: u64) -> vmx::Result<()>;

    /// Make the VMCS at `vmcs_pa` current and active.
    fn vmptrld(&mut self, vmcs_pa: u64) -> vmx::Result<()>;

    /// Leave VMX operation.
    fn vmxoff(&mut self) -> vmx::Result<()>;

    /// Reads the VM-instruction error field of the current VMCS, if there is one.
    fn vm_instruction_error(&self) -> Option<u32>;

    /// Stores the GDTR.
    fn sgdt(&self) -> DescriptorTablePointer<u64>;
}

/// The real processor, backed by the `x86` and `x86_64` crates.
pub struct IntelCpu {
    _private: (),
}

impl IntelCpu {
    /// Creates a handle to the executing processor.
    ///
    /// # Safety
    ///
    /// The caller must run at CPL0 with its affinity pinned to a single logical processor
    /// for as long as the handle is used.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Cpu for IntelCpu {
    fn read_cr0(&self) -> u64 {
        Cr0::read_raw()
    }

    fn write_cr0(&mut self, value: u64) {
        unsafe { Cr0::write_raw(value) };
    }

    fn read_cr4(&self) -> u64 {
        Cr4::read_raw()
    }

    fn write_cr4(&mut self, value: u64) {
        unsafe { Cr4::write_raw(value) };
    }

    fn read_msr(&self, msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        unsafe { x86::msr::wrmsr(msr, value) };
    }

    fn vmxon(&mut self, vmxon_pa: u64) -> vmx::Result<()> {
        unsafe { x86::bits64::vmx::vmxon(vmxon_pa) }
    }

    fn vmclear(&mut self, vmcs_pa: u64) -> vmx::Result<()> {
        unsafe { x86::bits64::vmx::vmclear(vmcs_pa) }
    }

    fn vmptrld(&mut self, vmcs_pa: u64) -> vmx::Result<()> {
        unsafe { x86::bits64::vmx::vmptrld(vmcs_pa) }
    }

    fn vmxoff(&mut self) -> vmx::Result<()> {
        unsafe { x86::bits64::vmx::vmxoff() }
    }

    fn vm_instruction_error(&self) -> Option<u32> {
        unsafe { x86::bits64::vmx::vmread(vmcs::ro::VM_INSTRUCTION_ERROR) }
            .ok()
            .map(|error| error as u32)
    }

    fn sgdt(&self) -> DescriptorTablePointer<u64> {
        let mut gdtr = DescriptorTablePointer::<u64>::default();
        unsafe { x86::dtables::sgdt(&mut gdtr) };
        gdtr
    }
}

/// A processor model for tests: records side effects and injects VMX failures.
#[cfg(test)]
pub(crate) mod simulated {
    use {
        super::Cpu,
        std::collections::BTreeMap,
        x86::{
            dtables::DescriptorTablePointer,
            vmx::{self, VmFail},
        },
    };

    /// A side-effecting call observed by the simulated processor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Call {
        WriteCr0(u64),
        WriteCr4(u64),
        WriteMsr(u32, u64),
        Vmxon(u64),
        Vmclear(u64),
        Vmptrld(u64),
        Vmxoff,
    }

    /// The VMX instruction a failure is injected into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Instruction {
        Vmxon,
        Vmclear,
        Vmptrld,
        Vmxoff,
    }

    /// How an injected failure is reported.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Injected {
        Invalid,
        Valid(u32),
    }

    #[derive(Default)]
    pub struct SimulatedCpu {
        pub cr0: u64,
        pub cr4: u64,
        pub msrs: BTreeMap<u32, u64>,
        pub calls: Vec<Call>,
        pub vmx_on: bool,
        pub current_vmcs: Option<u64>,
        pub gdtr: DescriptorTablePointer<u64>,
        failures: Vec<(Instruction, Injected)>,
        instruction_error: Option<u32>,
    }

    impl SimulatedCpu {
        pub fn new(cr0: u64, cr4: u64) -> Self {
            Self {
                cr0,
                cr4,
                ..Default::default()
            }
        }

        /// Seeds the four fixed-bit capability MSRs.
        pub fn with_fixed_bits(mut self, cr0_fixed0: u64, cr0_fixed1: u64, cr4_fixed0: u64, cr4_fixed1: u64) -> Self {
            self.msrs.insert(x86::msr::IA32_VMX_CR0_FIXED0, cr0_fixed0);
            self.msrs.insert(x86::msr::IA32_VMX_CR0_FIXED1, cr0_fixed1);
            self.msrs.insert(x86::msr::IA32_VMX_CR4_FIXED0, cr4_fixed0);
            self.msrs.insert(x86::msr::IA32_VMX_CR4_FIXED1, cr4_fixed1);
            self
        }

        /// Makes the next execution of `instruction` fail.
        pub fn fail(mut self, instruction: Instruction, injected: Injected) -> Self {
            self.failures.push((instruction, injected));
            self
        }

        /// The VMX instructions in the call log, in order.
        pub fn vmx_instructions(&self) -> Vec<Call> {
            self.calls
                .iter()
                .copied()
                .filter(|call| matches!(call, Call::Vmxon(_) | Call::Vmclear(_) | Call::Vmptrld(_) | Call::Vmxoff))
                .collect()
        }

        fn take_failure(&mut self, instruction: Instruction) -> vmx::Result<()> {
            let Some(position) = self.failures.iter().position(|(i, _)| *i == instruction) else {
                return Ok(());
            };

            match self.failures.remove(position).1 {
                Injected::Invalid => {
                    self.instruction_error = None;
                    Err(VmFail::VmFailInvalid)
                }
                Injected::Valid(number) => {
                    self.instruction_error = Some(number);
                    Err(VmFail::VmFailValid)
                }
            }
        }
    }

    impl Cpu for SimulatedCpu {
        fn read_cr0(&self) -> u64 {
            self.cr0
        }

        fn write_cr0(&mut self, value: u64) {
            self.calls.push(Call::WriteCr0(value));
            self.cr0 = value;
        }

        fn read_cr4(&self) -> u64 {
            self.cr4
        }

        fn write_cr4(&mut self, value: u64) {
            self.calls.push(Call::WriteCr4(value));
            self.cr4 = value;
        }

        fn read_msr(&self, msr: u32) -> u64 {
            self.msrs.get(&msr).copied().unwrap_or(0)
        }

        fn write_msr(&mut self, msr: u32, value: u64) {
            self.calls.push(Call::WriteMsr(msr, value));
            self.msrs.insert(msr, value);
        }

        fn vmxon(&mut self, vmxon_pa: u64) -> vmx::Result<()> {
            self.calls.push(Call::Vmxon(vmxon_pa));
            self.take_failure(Instruction::Vmxon)?;
            self.vmx_on = true;
            Ok(())
        }

        fn vmclear(&mut self, vmcs_pa: u64) -> vmx::Result<()> {
            self.calls.push(Call::Vmclear(vmcs_pa));
            self.take_failure(Instruction::Vmclear)?;
            if self.current_vmcs == Some(vmcs_pa) {
                self.current_vmcs = None;
            }
            Ok(())
        }

        fn vmptrld(&mut self, vmcs_pa: u64) -> vmx::Result<()> {
            self.calls.push(Call::Vmptrld(vmcs_pa));
            self.take_failure(Instruction::Vmptrld)?;
            self.current_vmcs = Some(vmcs_pa);
            Ok(())
        }

        fn vmxoff(&mut self) -> vmx::Result<()> {
            self.calls.push(Call::Vmxoff);
            self.take_failure(Instruction::Vmxoff)?;
            self.vmx_on = false;
            self.current_vmcs = None;
            Ok(())
        }

        fn vm_instruction_error(&self) -> Option<u32> {
            self.instruction_error
        }

        fn sgdt(&self) -> DescriptorTablePointer<u64> {
            DescriptorTablePointer {
                limit: self.gdtr.limit,
                base: self.gdtr.base,
            }
        }
    }
}
