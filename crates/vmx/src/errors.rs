//! VMX Errors

use core::fmt;

use utils::HostPhysAddr;

use crate::regions::{RegionKind, VcpuId};
use crate::vmcs::{Operation, VmcsState};

/// An error that occured during VMX operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VmxError {
    /// VMCS pointer is valid, but some other error was encountered. Read VM-instruction error
    /// field of VMCS for more details.
    VmFailValid(VmxInstructionError),

    /// VMCS pointer is invalid.
    VmFailInvalid,

    /// Value 1 is not supported for one of the configuration bits for which it was requested.
    Disallowed1(VmxFieldError, u8),

    /// Value 0 is not supported for one of the configuration bits for which it was requested.
    Disallowed0(VmxFieldError, u8),

    /// Current value of the bit is not valid. This can be caused by an equality requirement
    /// between two fields for instance.
    MisconfiguredBit(VmxFieldError, u8),

    /// Current value of the field is not valid. This might be due to restrictions on multiple
    /// bits, for instance a range of the bits might have fixed possible values.
    Misconfigured(VmxFieldError),
}

impl VmxError {
    /// If the error is either a disallowed 0 or a disallowed 1, override the faulty VMX field.
    pub(crate) fn set_field(self, field: VmxFieldError) -> Self {
        match self {
            Self::Disallowed0(_, idx) => Self::Disallowed0(field, idx),
            Self::Disallowed1(_, idx) => Self::Disallowed1(field, idx),
            Self::MisconfiguredBit(_, idx) => Self::MisconfiguredBit(field, idx),
            _ => self,
        }
    }
}

impl fmt::Display for VmxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmxError::VmFailValid(err) => write!(f, "VMfailValid ({:?})", err),
            VmxError::VmFailInvalid => write!(f, "VMfailInvalid"),
            VmxError::Disallowed1(field, bit) => {
                write!(f, "bit {} of {:?} can not be set", bit, field)
            }
            VmxError::Disallowed0(field, bit) => {
                write!(f, "bit {} of {:?} can not be cleared", bit, field)
            }
            VmxError::MisconfiguredBit(field, bit) => {
                write!(f, "bit {} of {:?} is misconfigured", bit, field)
            }
            VmxError::Misconfigured(field) => write!(f, "{:?} is misconfigured", field),
        }
    }
}

/// An error resulting from the execution of a VMX instruction.
///
/// See Intel Manual 3C Section 30.4.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VmxInstructionError {
    /// VMCALL executed in VMX-root operation.
    VmCallRoot,
    /// VMCLEAR with invalid physical address.
    VmClearInvalid,
    /// VMCLEAR with VMXON pointer.
    VmClearVmxon,
    /// VMLAUNCH with non-clear VMCS.
    VmLaunchNonClear,
    /// VMRESUME with non-launched VMCS.
    VmResumeNonLaunched,
    /// VMRESUME after VMXOFF.
    VmResumeAfterVmxoff,
    /// VM entry with invalid control fields.
    VmEntryInvalidCtrlFields,
    /// VM entry with invalid host state.
    VmEntryInvalidHostState,
    /// VMPTRLD with invalid physical address.
    VmPtrldInvalidPhysAddr,
    /// VMPTRLD with VMXON pointer.
    VmPtrldVmxon,
    /// VMPTRLD with incorrect VMCS revision identifier.
    VmPtrldInvalidRevId,
    /// VMREAD/VMWRITE to unsupported component.
    VmAccessUnsupportedField,
    /// VMWRITE to read-only component.
    VmWriteToReadOnly,
    /// VMXON executed in VMX root operation.
    VmxonDuringVmxRoot,
    /// VM entry with invalid executive-VMCS pointer.
    VmEntryInvalidVmcs,
    /// VM entry with non-launched executive VMCS.
    VmEntryNonLaunched,
    /// VM entry with executive-VMCS pointer not VMXON pointer.
    VmEntryVmcsNotVmxon,
    /// VMCALL with non-clear VMCS.
    VmCallNonClearVmcs,
    /// VMCALL with invalid VM-exit control fields,
    VmCallInvalidExitCtrlFields,
    /// VMCALL with incorrect MSEG revision identifier.
    VmCallInvalidRevId,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM.
    VmxoffDualMonitor,
    /// VMCALL with invalid SMM-monitor features.
    VmCallInvalidSmmFeatures,
    /// VM entry with invalid VM-execution control fields in executive VMCS.
    VmEntryInvalidExecCtrlFields,
    /// VM entry with events blocked by MOV SS.
    VmEntryBlockedMovSS,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidInvEptInvPid,
    /// Unknown error.
    Unknown,
}

impl VmxInstructionError {
    pub fn from_u64(err: u64) -> VmxInstructionError {
        match err {
            1 => Self::VmCallRoot,
            2 => Self::VmClearInvalid,
            3 => Self::VmClearVmxon,
            4 => Self::VmLaunchNonClear,
            5 => Self::VmResumeNonLaunched,
            6 => Self::VmResumeAfterVmxoff,
            7 => Self::VmEntryInvalidCtrlFields,
            8 => Self::VmEntryInvalidHostState,
            9 => Self::VmPtrldInvalidPhysAddr,
            10 => Self::VmPtrldVmxon,
            11 => Self::VmPtrldInvalidRevId,
            12 => Self::VmAccessUnsupportedField,
            13 => Self::VmWriteToReadOnly,
            15 => Self::VmxonDuringVmxRoot,
            16 => Self::VmEntryInvalidVmcs,
            17 => Self::VmEntryNonLaunched,
            18 => Self::VmEntryVmcsNotVmxon,
            19 => Self::VmCallNonClearVmcs,
            20 => Self::VmCallInvalidExitCtrlFields,
            22 => Self::VmCallInvalidRevId,
            23 => Self::VmxoffDualMonitor,
            24 => Self::VmCallInvalidSmmFeatures,
            25 => Self::VmEntryInvalidExecCtrlFields,
            26 => Self::VmEntryBlockedMovSS,
            28 => Self::InvalidInvEptInvPid,
            _ => Self::Unknown,
        }
    }
}

/// The field responsible for a configuration error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VmxFieldError {
    // Host
    HostCr0,
    HostCr4,
    HostCsSelector,
    HostDsSelector,
    HostEsSelector,
    HostFsSelector,
    HostGsSelector,
    HostSsSelector,
    HostTrSelector,
    HostRip,
    HostRsp,
    HostIa32Efer,
    HostTrBase,

    // Controls
    PinBasedControls,
    PrimaryControls,
    SecondaryControls,
    ExitControls,
    EntryControls,

    // Other
    Unknown,
}

// ———————————————————————————— Lifecycle Errors ———————————————————————————— //

/// Failure to reserve the memory backing a VMCS.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AllocationError {
    /// The allocator ran out of memory.
    OutOfMemory { vcpu: VcpuId, region: RegionKind },

    /// The allocator returned memory that is not page-aligned.
    Misaligned {
        vcpu: VcpuId,
        region: RegionKind,
        addr: HostPhysAddr,
    },

    /// The host stack must span at least one page.
    EmptyStack { vcpu: VcpuId },
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::OutOfMemory { vcpu, region } => {
                write!(f, "out of memory for {:?} of vCPU {}", region, vcpu.0)
            }
            AllocationError::Misaligned { vcpu, region, addr } => write!(
                f,
                "misaligned {:?} of vCPU {} at 0x{:x}",
                region,
                vcpu.0,
                addr.as_usize()
            ),
            AllocationError::EmptyStack { vcpu } => {
                write!(f, "empty host stack requested for vCPU {}", vcpu.0)
            }
        }
    }
}

/// An error returned by the VMCS lifecycle operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VmcsError {
    /// The backing memory could not be reserved, no VMCS exists.
    Allocation(AllocationError),

    /// VMCLEAR failed.
    ClearFailed(VmxError),

    /// VMPTRLD failed.
    LoadFailed(VmxError),

    /// Writing a field failed, the VMCS is left partially populated.
    FieldWriteFailed {
        field: &'static str,
        error: VmxError,
    },

    /// The processor expects a VMCS region larger than a frame.
    UnsupportedVmcsSize { size: u32 },

    /// The VMCS is not the current VMCS of the executing core.
    NotCurrent,

    /// The VMCS is current (or active) on another core.
    ActiveOnOtherCore { core: usize },

    /// The operation is not allowed in the current state.
    IllegalTransition {
        from: VmcsState,
        operation: Operation,
    },

    /// The populated VMCS does not pass the consistency checks.
    ValidationFailed(VmxError),
}

impl VmcsError {
    /// The lifecycle stage at which the error was raised.
    pub fn stage(&self) -> &'static str {
        match self {
            VmcsError::Allocation(_) => "allocation",
            VmcsError::ClearFailed(_) | VmcsError::LoadFailed(_) => "clear/load handshake",
            VmcsError::FieldWriteFailed { .. } => "population",
            VmcsError::ValidationFailed(_) => "validation",
            VmcsError::UnsupportedVmcsSize { .. }
            | VmcsError::NotCurrent
            | VmcsError::ActiveOnOtherCore { .. }
            | VmcsError::IllegalTransition { .. } => "precondition",
        }
    }
}

impl From<AllocationError> for VmcsError {
    fn from(err: AllocationError) -> Self {
        VmcsError::Allocation(err)
    }
}

impl fmt::Display for VmcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmcsError::Allocation(err) => write!(f, "allocation failed: {}", err),
            VmcsError::ClearFailed(err) => write!(f, "VMCLEAR failed: {}", err),
            VmcsError::LoadFailed(err) => write!(f, "VMPTRLD failed: {}", err),
            VmcsError::FieldWriteFailed { field, error } => {
                write!(f, "failed to write {}: {}", field, error)
            }
            VmcsError::UnsupportedVmcsSize { size } => {
                write!(f, "unsupported VMCS size: 0x{:x} bytes", size)
            }
            VmcsError::NotCurrent => write!(f, "VMCS is not current on this core"),
            VmcsError::ActiveOnOtherCore { core } => write!(f, "VMCS is active on core {}", core),
            VmcsError::IllegalTransition { from, operation } => {
                write!(f, "illegal {:?} from state {:?}", operation, from)
            }
            VmcsError::ValidationFailed(err) => write!(f, "validation failed: {}", err),
        }
    }
}
