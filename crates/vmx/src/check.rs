//! Software implementation of VMX hardware checks
//!
//! This module implements **some** of the checks done by the VMX extension on VM entries. They
//! run on a freshly populated VMCS, so that a misconfiguration is reported when the VMCS is built
//! rather than as an opaque VM-entry failure.

use core::mem;

use utils::HostVirtAddr;

use crate::bitmaps::{EntryControls, ExitControls, PinbasedControls};
use crate::errors::{VmxError, VmxFieldError};
use crate::fields;
use crate::fields::traits::*;
use crate::regions::HostStack;
use crate::{msr, ActiveVmcs, Vmx};

// ———————————————————————— Main Checking Functions ————————————————————————— //

/// Check that the current VMCS holds the expected exit handler, a stack pointer within `stack` and
/// a consistent host state and controls.
///
/// WARNING: the checks are not (yet) complete!
pub fn check<V: Vmx>(
    vmcs: &ActiveVmcs<'_, V>,
    stack: &HostStack,
    rip: HostVirtAddr,
) -> Result<(), VmxError> {
    check_exit_handler(vmcs, stack, rip)?;
    check_exec_ctrl_fields(vmcs)?;
    check_host_state(vmcs)?;

    Ok(())
}

/// Reads back the host stack and instruction pointers.
///
/// The stack pointer must lie within the host stack, 16 bytes aligned.
fn check_exit_handler<V: Vmx>(
    vmcs: &ActiveVmcs<'_, V>,
    stack: &HostStack,
    rip: HostVirtAddr,
) -> Result<(), VmxError> {
    let host_rip = fields::HostStateNat::Rip.vmread(vmcs)?;
    let host_rsp = fields::HostStateNat::Rsp.vmread(vmcs)?;
    if host_rip != rip.as_usize() || !is_canonical(host_rip) {
        return Err(VmxError::Misconfigured(VmxFieldError::HostRip));
    }
    let in_stack = stack.contains(HostVirtAddr::new(host_rsp));
    if !in_stack || host_rsp % 16 != 0 || !is_canonical(host_rsp) {
        return Err(VmxError::Misconfigured(VmxFieldError::HostRsp));
    }
    Ok(())
}

/// Performs some of the checks on execution control fields (section 26.2.1).
fn check_exec_ctrl_fields<V: Vmx>(vmcs: &ActiveVmcs<'_, V>) -> Result<(), VmxError> {
    let pin_ctrls = vmcs.get_pin_based_ctrls()?;
    let exit_ctrls = vmcs.get_vm_exit_ctrls()?;
    let entry_ctrls = vmcs.get_vm_entry_ctrls()?;

    // VM-Exit Control Fields, section 26.2.1.2
    if !pin_ctrls.contains(PinbasedControls::VMX_PREEMPTION_TIMER)
        && exit_ctrls.contains(ExitControls::SAVE_VMX_PREEMPTION_TIMER)
    {
        return Err(VmxError::Disallowed1(VmxFieldError::ExitControls, 22));
    }

    // VM-Entry Control Fields, section 26.2.1.3
    if entry_ctrls.contains(EntryControls::ENTRY_TO_SMM) {
        return Err(VmxError::Disallowed1(VmxFieldError::EntryControls, 10));
    }
    if entry_ctrls.contains(EntryControls::DEACTIVATE_DUAL_MONITOR) {
        return Err(VmxError::Disallowed1(VmxFieldError::EntryControls, 11));
    }
    Ok(())
}

/// Performs some of the checks on host state fields (section 26.2.2).
fn check_host_state<V: Vmx>(vmcs: &ActiveVmcs<'_, V>) -> Result<(), VmxError> {
    // Check on Host Control Registers and MSRs (section 26.2.2)
    let host_cr0 = fields::HostStateNat::Cr0.vmread(vmcs)?;
    let host_cr4 = fields::HostStateNat::Cr4.vmread(vmcs)?;
    validate_cr(
        host_cr0,
        vmcs.read_msr(msr::VMX_CR0_FIXED0) as usize,
        vmcs.read_msr(msr::VMX_CR0_FIXED1) as usize,
    )
    .map_err(|err| err.set_field(VmxFieldError::HostCr0))?;
    validate_cr(
        host_cr4,
        vmcs.read_msr(msr::VMX_CR4_FIXED0) as usize,
        vmcs.read_msr(msr::VMX_CR4_FIXED1) as usize,
    )
    .map_err(|err| err.set_field(VmxFieldError::HostCr4))?;

    if mem::size_of::<usize>() > 4 {
        // 64 bits architecture
        if host_cr0 >> 32 != 0 {
            let bit = ((host_cr0 >> 32) << 32).trailing_zeros() as u8;
            return Err(VmxError::Disallowed1(VmxFieldError::HostCr0, bit));
        }
    }

    let exit_ctrls = vmcs.get_vm_exit_ctrls()?;
    let address_space_size = exit_ctrls.contains(ExitControls::HOST_ADDRESS_SPACE_SIZE);
    if address_space_size && host_cr4 & (1 << 5) == 0 {
        // A 64 bits host needs physical address extensions.
        return Err(VmxError::Disallowed0(VmxFieldError::HostCr4, 5));
    }
    if exit_ctrls.contains(ExitControls::LOAD_IA32_EFER) {
        let reserved_bits = !((1 << 0) | (1 << 8) | (1 << 10) | (1 << 11));
        let efer = fields::HostState64::Ia32Efer.vmread(vmcs)?;
        if efer & reserved_bits != 0 {
            let bit = (efer & reserved_bits).trailing_zeros() as u8;
            return Err(VmxError::Disallowed1(VmxFieldError::HostIa32Efer, bit));
        }
        let lme = efer & (1 << 8) != 0;
        let lma = efer & (1 << 10) != 0;
        if address_space_size != lma || address_space_size != lme {
            return Err(VmxError::MisconfiguredBit(VmxFieldError::ExitControls, 9));
        }
    }

    // Checks on Host Segment and Descriptor-Table Registers
    let cs = fields::HostState16::CsSelector.vmread(vmcs)?;
    let ds = fields::HostState16::DsSelector.vmread(vmcs)?;
    let es = fields::HostState16::EsSelector.vmread(vmcs)?;
    let fs = fields::HostState16::FsSelector.vmread(vmcs)?;
    let gs = fields::HostState16::GsSelector.vmread(vmcs)?;
    let ss = fields::HostState16::SsSelector.vmread(vmcs)?;
    let tr = fields::HostState16::TrSelector.vmread(vmcs)?;
    validate_host_selector(cs).map_err(|err| err.set_field(VmxFieldError::HostCsSelector))?;
    validate_host_selector(ds).map_err(|err| err.set_field(VmxFieldError::HostDsSelector))?;
    validate_host_selector(es).map_err(|err| err.set_field(VmxFieldError::HostEsSelector))?;
    validate_host_selector(fs).map_err(|err| err.set_field(VmxFieldError::HostFsSelector))?;
    validate_host_selector(gs).map_err(|err| err.set_field(VmxFieldError::HostGsSelector))?;
    validate_host_selector(ss).map_err(|err| err.set_field(VmxFieldError::HostSsSelector))?;
    validate_host_selector(tr).map_err(|err| err.set_field(VmxFieldError::HostTrSelector))?;

    if cs == 0x0000 {
        return Err(VmxError::Misconfigured(VmxFieldError::HostCsSelector));
    }
    if tr == 0x0000 {
        return Err(VmxError::Misconfigured(VmxFieldError::HostTrSelector));
    }

    let tr_base = fields::HostStateNat::TrBase.vmread(vmcs)?;
    if !is_canonical(tr_base) {
        return Err(VmxError::Misconfigured(VmxFieldError::HostTrBase));
    }

    Ok(())
}

// ———————————————————————————— Helper Functions ———————————————————————————— //

/// Host selectors must have both the RPL and TI flags cleared.
fn validate_host_selector(selector: u16) -> Result<(), VmxError> {
    if selector & 0b111 != 0 {
        Err(VmxError::Disallowed1(
            VmxFieldError::Unknown,
            selector.trailing_zeros() as u8,
        ))
    } else {
        Ok(())
    }
}

/// Validates a control register (CR0 or CR4) against its valid state.
///
/// See Intel Manual volume 3 annex A.7 & A.8.
pub fn validate_cr(cr: usize, fixed_0: usize, fixed_1: usize) -> Result<(), VmxError> {
    let must_be_zero = fixed_0 & !cr;
    if must_be_zero != 0 {
        let idx = must_be_zero.trailing_zeros() as u8;
        return Err(VmxError::Disallowed0(VmxFieldError::Unknown, idx));
    }

    let must_be_zero = (!fixed_1) & cr;
    if must_be_zero != 0 {
        let idx = must_be_zero.trailing_zeros() as u8;
        return Err(VmxError::Disallowed1(VmxFieldError::Unknown, idx));
    }

    Ok(())
}

/// Bits 63:47 must be copies of bit 47 (48 bits linear addresses).
fn is_canonical(addr: usize) -> bool {
    let upper = (addr as u64) >> 47;
    upper == 0 || upper == (1 << 17) - 1
}

// ————————————————————————————————— Tests —————————————————————————————————— //
