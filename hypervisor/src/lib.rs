//! VMX root-mode lifecycle for one logical processor, and translation of GDT segment
//! descriptors into VMCS segment fields.
//!
//! Allocating the VMXON/VMCS regions, pinning to a processor and filling the VMCS are left
//! to the caller.

#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod intel;
pub mod logger;

pub use {
    error::HypervisorError,
    intel::{
        controls::enforce_fixed_control_bits,
        cpu::{Cpu, IntelCpu},
        segmentation::{SegmentRole, UnusablePolicy, VmxSegmentDescriptor},
        vmx::{enter_root_mode, exit_root_mode, ProcessorContext, RootModeState},
    },
};
