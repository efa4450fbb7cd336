pub mod cpu;
pub mod controls;
pub mod descriptor;
pub mod segmentation;
pub mod support;
pub mod vmcs;
pub mod vmerror;
pub mod vmx;
pub mod vmxon;
