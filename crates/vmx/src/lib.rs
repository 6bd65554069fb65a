//! VMX support
//!
//! Construction and lifecycle of the Virtual Machine Control Structure (VMCS) of a virtual CPU:
//! field encodings, backing memory, the clear/load handshake, and the host state and execution
//! controls that must be in place before the first VM entry.
//!
//! Inspired and in part copied from the [x86] crate.
//!
//! [x86]: https://hermitcore.github.io/libhermit-rs/x86/bits64/vmx/index.html
#![cfg_attr(not(test), no_std)]

pub mod bitmaps;
pub mod check;
pub mod config;
pub mod errors;
pub mod fields;
pub mod host;
pub mod msr;
pub mod raw;
pub mod regions;
pub mod vmcs;

#[cfg(test)]
mod tests;

use core::marker::PhantomData;

use bitmaps::{
    EntryControls, ExceptionBitmap, ExitControls, PinbasedControls, PrimaryControls,
    SecondaryControls,
};
use fields::traits::*;
use fields::Ctrl32;
pub use utils::{Frame, HostPhysAddr, HostVirtAddr};

pub use crate::config::VcpuConfig;
pub use crate::errors::{AllocationError, VmcsError, VmxError, VmxFieldError};
pub use crate::host::HostState;
pub use crate::msr::{Msr, VmxBasicInfo};
pub use crate::raw::RawVmx;
pub use crate::regions::{HostStack, RegionKind, VcpuId, VmcsRegions};
pub use crate::vmcs::{Operation, Vmcs, VmcsState};

/// Mask for keeping only the 32 lower bits.
const LOW_32_BITS_MASK: u64 = (1 << 32) - 1;

// ————————————————————————————— VMX Operations ————————————————————————————— //

/// The VMX instructions of a physical core.
///
/// # Safety
///
/// Implementors must execute the instructions on the core the value belongs to and report
/// failures following the VMX conventions (VMfailInvalid / VMfailValid with the instruction error
/// number).
pub unsafe trait Vmx {
    /// Executes VMCLEAR on the VMCS at `addr`.
    fn vmclear(&mut self, addr: HostPhysAddr) -> Result<(), VmxError>;

    /// Executes VMPTRLD, making the VMCS at `addr` the current VMCS.
    fn vmptrld(&mut self, addr: HostPhysAddr) -> Result<(), VmxError>;

    /// Executes VMWRITE on the current VMCS.
    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmxError>;

    /// Executes VMREAD on the current VMCS.
    fn vmread(&self, field: u32) -> Result<u64, VmxError>;

    /// Reads one of the VMX capability MSRs.
    fn read_msr(&self, msr: Msr) -> u64;
}

// ————————————————————————————— Physical Core —————————————————————————————— //

/// A physical core in VMX root operation, and its current-VMCS pointer.
pub struct PhysicalCore<V: Vmx> {
    id: usize,
    vmx: V,
    current: Option<HostPhysAddr>,
    // This fiels makes PhysicalCore !Sync and !Send, therefore it can't be send or shared with
    // another core.
    _not_sync: PhantomData<*const ()>,
}

impl<V: Vmx> PhysicalCore<V> {
    /// Wraps the VMX instructions of the executing core.
    ///
    /// # Safety
    ///
    /// The core must be in VMX root operation (VMXON succeeded), `id` must uniquely identify the
    /// core, and a single `PhysicalCore` may exist per core.
    pub unsafe fn new(id: usize, vmx: V) -> Self {
        PhysicalCore {
            id,
            vmx,
            current: None,
            _not_sync: PhantomData,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The physical address of the VMCS loaded on this core, if any.
    pub fn current_vmcs(&self) -> Option<HostPhysAddr> {
        self.current
    }

    pub fn vmx(&self) -> &V {
        &self.vmx
    }

    pub fn vmx_mut(&mut self) -> &mut V {
        &mut self.vmx
    }

    /// Returns basic info about VMX CPU-defined structures.
    pub fn vmx_info(&self) -> VmxBasicInfo {
        VmxBasicInfo::from_raw(self.vmx.read_msr(msr::VMX_BASIC))
    }

    /// Returns a handle to access the fields of `vmcs`, which must be current on this core.
    pub fn active(&mut self, vmcs: &Vmcs) -> Result<ActiveVmcs<'_, V>, VmcsError> {
        let ptr = vmcs.vmcs_ptr();
        if !vmcs.state().is_loaded() || self.current != Some(ptr) {
            return Err(VmcsError::NotCurrent);
        }
        Ok(ActiveVmcs { core: self, ptr })
    }

    pub(crate) fn clear(&mut self, addr: HostPhysAddr) -> Result<(), VmxError> {
        self.vmx.vmclear(addr)?;
        if self.current == Some(addr) {
            self.current = None;
        }
        Ok(())
    }

    pub(crate) fn load(&mut self, addr: HostPhysAddr) -> Result<(), VmxError> {
        self.vmx.vmptrld(addr)?;
        self.current = Some(addr);
        Ok(())
    }
}

// —————————————————————————————— Active VMCS ——————————————————————————————— //

/// The current VMCS of a core.
///
/// Field reads and writes through `fields::traits` go to this VMCS. The handle mutably borrows
/// the core, hence no other VMCS can be loaded while it is alive.
pub struct ActiveVmcs<'core, V: Vmx> {
    core: &'core mut PhysicalCore<V>,
    ptr: HostPhysAddr,
}

impl<'core, V: Vmx> ActiveVmcs<'core, V> {
    /// Physical address of the VMCS.
    pub fn vmcs_ptr(&self) -> HostPhysAddr {
        self.ptr
    }

    pub fn core_id(&self) -> usize {
        self.core.id
    }

    pub(crate) fn raw_write(&mut self, field: u32, value: u64) -> Result<(), VmxError> {
        self.core.vmx.vmwrite(field, value)
    }

    pub(crate) fn raw_read(&self, field: u32) -> Result<u64, VmxError> {
        self.core.vmx.vmread(field)
    }

    pub fn read_msr(&self, msr: Msr) -> u64 {
        self.core.vmx.read_msr(msr)
    }

    /// Sets the pin-based controls.
    pub fn set_pin_based_ctrls(&mut self, flags: PinbasedControls) -> Result<(), VmxError> {
        self.set_ctrls(
            flags.bits(),
            PinbasedControls::all().bits(),
            msr::VMX_PINBASED_CTLS,
            msr::VMX_TRUE_PINBASED_CTLS,
            Ctrl32::PinBasedExecCtrls,
        )
        .map_err(|err| err.set_field(VmxFieldError::PinBasedControls))
    }

    /// Returns the pin-based controls
    pub fn get_pin_based_ctrls(&self) -> Result<PinbasedControls, VmxError> {
        let ctrls = Ctrl32::PinBasedExecCtrls.vmread(self)?;
        Ok(PinbasedControls::from_bits_truncate(ctrls))
    }

    /// Sets the primary processor-based controls.
    pub fn set_primary_ctrls(&mut self, flags: PrimaryControls) -> Result<(), VmxError> {
        self.set_ctrls(
            flags.bits(),
            PrimaryControls::all().bits(),
            msr::VMX_PROCBASED_CTLS,
            msr::VMX_TRUE_PROCBASED_CTLS,
            Ctrl32::PrimaryProcBasedExecCtrls,
        )
        .map_err(|err| err.set_field(VmxFieldError::PrimaryControls))
    }

    /// Returns the primary processor-based controls.
    pub fn get_primary_ctrls(&self) -> Result<PrimaryControls, VmxError> {
        let ctrls = Ctrl32::PrimaryProcBasedExecCtrls.vmread(self)?;
        Ok(PrimaryControls::from_bits_truncate(ctrls))
    }

    /// Sets the secondary processor-based controls.
    ///
    /// There is no "true" variant of the secondary controls capability MSR.
    pub fn set_secondary_ctrls(&mut self, flags: SecondaryControls) -> Result<(), VmxError> {
        let spec = self.read_msr(msr::VMX_PROCBASED_CTLS2);
        let requested = flags.bits() | (spec & LOW_32_BITS_MASK) as u32;
        let new_flags = get_ctls(requested, spec, SecondaryControls::all().bits())
            .map_err(|err| err.set_field(VmxFieldError::SecondaryControls))?;
        Ctrl32::SecondaryProcBasedVmExecCtrls.vmwrite(self, new_flags)
    }

    /// Returns the secondary processor-based controls.
    pub fn get_secondary_ctrls(&self) -> Result<SecondaryControls, VmxError> {
        let ctrls = Ctrl32::SecondaryProcBasedVmExecCtrls.vmread(self)?;
        Ok(SecondaryControls::from_bits_truncate(ctrls))
    }

    /// Sets the VM exit controls.
    pub fn set_vm_exit_ctrls(&mut self, flags: ExitControls) -> Result<(), VmxError> {
        self.set_ctrls(
            flags.bits(),
            ExitControls::all().bits(),
            msr::VMX_EXIT_CTLS,
            msr::VMX_TRUE_EXIT_CTLS,
            Ctrl32::VmExitCtrls,
        )
        .map_err(|err| err.set_field(VmxFieldError::ExitControls))
    }

    /// Returns the VM exit controls
    pub fn get_vm_exit_ctrls(&self) -> Result<ExitControls, VmxError> {
        let ctrls = Ctrl32::VmExitCtrls.vmread(self)?;
        Ok(ExitControls::from_bits_truncate(ctrls))
    }

    /// Sets the VM entry controls.
    pub fn set_vm_entry_ctrls(&mut self, flags: EntryControls) -> Result<(), VmxError> {
        self.set_ctrls(
            flags.bits(),
            EntryControls::all().bits(),
            msr::VMX_ENTRY_CTLS,
            msr::VMX_TRUE_ENTRY_CTLS,
            Ctrl32::VmEntryCtrls,
        )
        .map_err(|err| err.set_field(VmxFieldError::EntryControls))
    }

    /// Returns the VM entry controls.
    pub fn get_vm_entry_ctrls(&self) -> Result<EntryControls, VmxError> {
        let ctrls = Ctrl32::VmEntryCtrls.vmread(self)?;
        Ok(EntryControls::from_bits_truncate(ctrls))
    }

    /// Sets the exception bitmap.
    pub fn set_exception_bitmap(&mut self, bitmap: ExceptionBitmap) -> Result<(), VmxError> {
        Ctrl32::ExceptionBitmap.vmwrite(self, bitmap.bits())
    }

    /// Gets the exception bitmap.
    pub fn get_exception_bitmap(&self) -> Result<ExceptionBitmap, VmxError> {
        let bitmap = Ctrl32::ExceptionBitmap.vmread(self)?;
        Ok(ExceptionBitmap::from_bits_truncate(bitmap))
    }

    /// Sets a control setting for the current VMCS.
    ///
    /// `raw_flags` are the optional features requested by the caller, `known` the bits the
    /// hypervisor knows about. Bits the CPU requires to be set are always added, the allowed
    /// settings are then read from `spec_msr` or, if supported, `true_spec_msr`.
    ///
    /// See Intel SDM Vol 3D Appendix A.3.1 for allowed settings explanation.
    fn set_ctrls(
        &mut self,
        raw_flags: u32,
        known: u32,
        spec_msr: Msr,
        true_spec_msr: Msr,
        control: Ctrl32,
    ) -> Result<(), VmxError> {
        let spec = self.read_msr(spec_msr);
        let new_flags = if self.core.vmx_info().support_true_ctls {
            let true_spec = self.read_msr(true_spec_msr);
            let required = (true_spec & LOW_32_BITS_MASK) as u32;
            get_true_ctls(raw_flags | required, spec, true_spec, known)?
        } else {
            let required = (spec & LOW_32_BITS_MASK) as u32;
            get_ctls(raw_flags | required, spec, known)?
        };

        control.vmwrite(self, new_flags)
    }
}

/// Computes the control bits when there is no support for true controls.
///
/// In case of error, returns the index of a bit
fn get_ctls(user: u32, spec: u64, known: u32) -> Result<u32, VmxError> {
    // NOTE: see Intel SDM Vol 3C Section 31.5.1, algorithm 3
    let allowed_zeros = (spec & LOW_32_BITS_MASK) as u32;
    let allowed_ones = (spec >> 32) as u32;

    let must_be_0 = !user & allowed_zeros & known;
    if must_be_0 != 0 {
        let idx = must_be_0.trailing_zeros() as u8;
        return Err(VmxError::Disallowed0(VmxFieldError::Unknown, idx));
    }
    let must_be_0 = user & !allowed_ones & known;
    if must_be_0 != 0 {
        let idx = must_be_0.trailing_zeros() as u8;
        return Err(VmxError::Disallowed1(VmxFieldError::Unknown, idx));
    }

    let default_value = allowed_zeros & allowed_ones;
    Ok(user | default_value)
}

/// Computes the control bits when there is support for true controls.
fn get_true_ctls(user: u32, spec: u64, true_spec: u64, known: u32) -> Result<u32, VmxError> {
    // NOTE: see Intel SDM Vol 3C Section 31.5.1, algorithm 3
    let allowed_zeros = (spec & LOW_32_BITS_MASK) as u32;
    let true_allowed_zeros = (true_spec & LOW_32_BITS_MASK) as u32;
    let true_allowed_ones = (true_spec >> 32) as u32;

    let must_be_0 = !user & true_allowed_zeros & known;
    if must_be_0 != 0 {
        let idx = must_be_0.trailing_zeros() as u8;
        return Err(VmxError::Disallowed0(VmxFieldError::Unknown, idx));
    }
    let must_be_0 = user & !true_allowed_ones & known;
    if must_be_0 != 0 {
        let idx = must_be_0.trailing_zeros() as u8;
        return Err(VmxError::Disallowed1(VmxFieldError::Unknown, idx));
    }

    let default_value = true_allowed_zeros & true_allowed_ones;
    let can_be_both = true_allowed_ones & !true_allowed_zeros;
    let must_be_ones = can_be_both & !known & allowed_zeros;
    Ok(default_value | user | must_be_ones)
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    /// See manual Annex A.3.
    #[rustfmt::skip]
    #[test]
    fn ctls_flags_spec() {
        // testing valid combinations
        let spec_0_setting: u64 = 0b001_00_01;
        let spec_1_setting: u64 = 0b011_01_11;
        let user_request:   u32 = 0b000_00_11;
        let known:          u32 = 0b000_11_11;
        let expected:       u32 = 0b001_00_11;

        let spec = (spec_1_setting << 32) + spec_0_setting;
        assert_eq!(get_ctls(user_request, spec, known), Ok(expected));

        // testing disallowed one
        let spec_0_setting: u64 = 0b0_1;
        let spec_1_setting: u64 = 0b0_1;
        let user_request:   u32 = 0b1_1;
        let known:          u32 = 0b1_1;

        let spec = (spec_1_setting << 32) + spec_0_setting;
        assert_eq!(get_ctls(user_request, spec, known), Err(VmxError::Disallowed1(VmxFieldError::Unknown, 1)));

        // testing disallowed zero
        let spec_0_setting: u64 = 0b1;
        let spec_1_setting: u64 = 0b1;
        let user_request:   u32 = 0b0;
        let known:          u32 = 0b1;

        let spec = (spec_1_setting << 32) + spec_0_setting;
        assert_eq!(get_ctls(user_request, spec, known), Err(VmxError::Disallowed0(VmxFieldError::Unknown, 0)));
    }

    /// See manual Annex A.3.
    #[rustfmt::skip]
    #[test]
    fn ctls_flags_true_spec() {
        // testing valid combinations
        let spec_0_setting:      u64 = 0b000_1_00_011;
        let true_spec_0_setting: u64 = 0b001_0_00_010;
        let true_spec_1_setting: u64 = 0b011_1_01_111;
        let user_request:        u32 = 0b000_0_00_111;
        let known:               u32 = 0b000_0_11_111;
        let expected:            u32 = 0b001_1_00_111;

        let spec = spec_0_setting;
        let true_spec = (true_spec_1_setting << 32) + true_spec_0_setting;
        assert_eq!(get_true_ctls(user_request, spec, true_spec, known), Ok(expected));

        // testing disallowed one
        let spec_0_setting:      u64 = 0b0_1;
        let true_spec_0_setting: u64 = 0b0_0;
        let true_spec_1_setting: u64 = 0b0_1;
        let user_request:        u32 = 0b1_1;
        let known:               u32 = 0b1_1;

        let spec = spec_0_setting;
        let true_spec = (true_spec_1_setting << 32) + true_spec_0_setting;
        assert_eq!(
            get_true_ctls(user_request, spec, true_spec, known),
            Err(VmxError::Disallowed1(VmxFieldError::Unknown, 1)),
        );

        // testing disallowed zero
        let spec_0_setting:      u64 = 0b1;
        let true_spec_0_setting: u64 = 0b1;
        let true_spec_1_setting: u64 = 0b0;
        let user_request:        u32 = 0b0;
        let known:               u32 = 0b1;

        let spec = spec_0_setting;
        let true_spec = (true_spec_1_setting << 32) + true_spec_0_setting;
        assert_eq!(
            get_true_ctls(user_request, spec, true_spec, known),
            Err(VmxError::Disallowed0(VmxFieldError::Unknown, 0)),
        );
    }
}
