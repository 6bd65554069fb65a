//! VMCS fields
//!
//! This module lists the VMCS fields used by the hypervisor.
//!
//! Fields are classified according to their width:
//! - 16 bits
//! - 32 bits
//! - 64 bits
//! - Natural width (32 or 64 bits depending on the architecture)
//!
//! In addition, there a four distinct categories of fields:
//! - Control fields
//! - Read-only fields (VM-exit information)
//! - Guest state
//! - Host state
//!
//! To enforce correct usage of `vmwrite`, i.e. passing arguments with expected width, fields are
//! grouped by category and width and implements a trait enabling `vmwrite` with the expected
//! width. Every access goes through an [`ActiveVmcs`], the proof that the VMCS is current on the
//! executing core.
//!
//! Usage:
//!
//! ```ignore
//! // Bring all traits to current scope, this avoid having to import each trait individually
//! use vmx::fields::traits::*;
//! use vmx::fields::Ctrl64;
//!
//! let mut vmcs = core.active(&vmcs)?;
//! Ctrl64::IoBitmapA.vmwrite(&mut vmcs, 0)?;
//! ```
//!
//! See Intel SDM Vol. 3D Appendix B.

use crate::errors::VmxError;
use crate::{ActiveVmcs, Vmx};

/// Mask for keeping only the 32 lower bits.
const LOW_32_BITS_MASK: u64 = (1 << 32) - 1;

// ————————————————————————————————— Traits ————————————————————————————————— //

// Bring all traits into current scope
use traits::*;

pub mod traits {
    use super::*;

    /// A VMCS field, identified by its 32 bits encoding.
    pub trait VmcsField: Copy {
        /// The raw field encoding.
        fn raw(&self) -> u32;

        /// A human readable name, used in diagnostics.
        fn name(&self) -> &'static str;

        /// The access type, only meaningful for 64 bits fields.
        fn access_type(&self) -> VmcsFieldAccess {
            if self.raw() & 1 == 0 {
                VmcsFieldAccess::Full
            } else {
                VmcsFieldAccess::High
            }
        }

        /// The field type, encoded in bits 11:10.
        fn class(&self) -> VmcsFieldType {
            match (self.raw() >> 10) & 0b11 {
                0 => VmcsFieldType::Control,
                1 => VmcsFieldType::VmExitInformation,
                2 => VmcsFieldType::GuestState,
                _ => VmcsFieldType::HostState,
            }
        }

        /// The field width, encoded in bits 14:13.
        fn width(&self) -> VmcsFieldWidth {
            match (self.raw() >> 13) & 0b11 {
                0 => VmcsFieldWidth::Width16,
                1 => VmcsFieldWidth::Width64,
                2 => VmcsFieldWidth::Width32,
                _ => VmcsFieldWidth::WidthNat,
            }
        }
    }

    /// A VMCS field containing a 64 bits value.
    ///
    /// The value is accessed as two 32 bits halves, the full (low) encoding first and then the
    /// high encoding, so that the same sequence is valid whatever the width of the host.
    pub trait VmcsField64: VmcsField {
        /// Writes a field to the current VMCS.
        fn vmwrite<V: Vmx>(&self, vmcs: &mut ActiveVmcs<'_, V>, value: u64) -> Result<(), VmxError> {
            vmcs.raw_write(self.raw(), value & LOW_32_BITS_MASK)?;
            vmcs.raw_write(self.raw() | 1, value >> 32)
        }

        /// Reads a field from the current VMCS.
        fn vmread<V: Vmx>(&self, vmcs: &ActiveVmcs<'_, V>) -> Result<u64, VmxError> {
            let low = vmcs.raw_read(self.raw())? & LOW_32_BITS_MASK;
            let high = vmcs.raw_read(self.raw() | 1)? & LOW_32_BITS_MASK;
            Ok(low | (high << 32))
        }
    }

    /// A VMCS field containing a 32 bits value.
    pub trait VmcsField32: VmcsField {
        /// Writes a field to the current VMCS.
        fn vmwrite<V: Vmx>(&self, vmcs: &mut ActiveVmcs<'_, V>, value: u32) -> Result<(), VmxError> {
            vmcs.raw_write(self.raw(), value as u64)
        }

        /// Reads a field from the current VMCS.
        fn vmread<V: Vmx>(&self, vmcs: &ActiveVmcs<'_, V>) -> Result<u32, VmxError> {
            vmcs.raw_read(self.raw()).map(|value| value as u32)
        }
    }

    /// A VMCS field containing a 16 bits value.
    pub trait VmcsField16: VmcsField {
        /// Writes a field to the current VMCS.
        fn vmwrite<V: Vmx>(&self, vmcs: &mut ActiveVmcs<'_, V>, value: u16) -> Result<(), VmxError> {
            vmcs.raw_write(self.raw(), value as u64)
        }

        /// Reads a field from the current VMCS.
        fn vmread<V: Vmx>(&self, vmcs: &ActiveVmcs<'_, V>) -> Result<u16, VmxError> {
            vmcs.raw_read(self.raw()).map(|value| value as u16)
        }
    }

    /// A VMCS field containing a natural width value (i.e. 32 bits on 32 bits systems, 64 bits on
    /// 64 bits systems).
    pub trait VmcsFieldNat: VmcsField {
        /// Writes a field to the current VMCS.
        fn vmwrite<V: Vmx>(
            &self,
            vmcs: &mut ActiveVmcs<'_, V>,
            value: usize,
        ) -> Result<(), VmxError> {
            vmcs.raw_write(self.raw(), value as u64)
        }

        /// Reads a field from the current VMCS.
        fn vmread<V: Vmx>(&self, vmcs: &ActiveVmcs<'_, V>) -> Result<usize, VmxError> {
            vmcs.raw_read(self.raw()).map(|value| value as usize)
        }
    }

    /// A VMCS read-only field containing a 32 bits value.
    pub trait VmcsField32Ro: VmcsField {
        /// Reads a field from the current VMCS.
        fn vmread<V: Vmx>(&self, vmcs: &ActiveVmcs<'_, V>) -> Result<u32, VmxError> {
            vmcs.raw_read(self.raw()).map(|value| value as u32)
        }
    }

    /// A VMCS read-only field containing a 64 bits value.
    pub trait VmcsField64Ro: VmcsField {
        /// Reads a field from the current VMCS.
        fn vmread<V: Vmx>(&self, vmcs: &ActiveVmcs<'_, V>) -> Result<u64, VmxError> {
            let low = vmcs.raw_read(self.raw())? & LOW_32_BITS_MASK;
            let high = vmcs.raw_read(self.raw() | 1)? & LOW_32_BITS_MASK;
            Ok(low | (high << 32))
        }
    }

    /// A VMCS read-only field containing a natural-width value.
    pub trait VmcsFieldNatRo: VmcsField {
        /// Reads a field from the current VMCS.
        fn vmread<V: Vmx>(&self, vmcs: &ActiveVmcs<'_, V>) -> Result<usize, VmxError> {
            vmcs.raw_read(self.raw()).map(|value| value as usize)
        }
    }
}

/// Access type of a field, see bit 0 of the encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsFieldAccess {
    Full,
    High,
}

/// Field category, see bits 11:10 of the encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsFieldType {
    Control,
    VmExitInformation,
    GuestState,
    HostState,
}

/// Field width, see bits 14:13 of the encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsFieldWidth {
    Width16,
    Width64,
    Width32,
    WidthNat,
}

/// Declares a `#[repr(u32)]` field enum and implements the given field trait for it.
///
/// Also generates the list of all the variants, used to check the encoding table as a whole.
macro_rules! vmcs_fields {
    (
        $(#[$meta:meta])*
        pub enum $struc:ident: $field:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u32)]
        pub enum $struc {
            $($(#[$vmeta])* $variant = $value,)*
        }

        impl $struc {
            /// All the fields of this kind.
            pub const ALL: &'static [$struc] = &[$($struc::$variant,)*];
        }

        impl VmcsField for $struc {
            #[inline]
            fn raw(&self) -> u32 {
                *self as u32
            }

            fn name(&self) -> &'static str {
                match self {
                    $($struc::$variant => concat!(stringify!($struc), "::", stringify!($variant)),)*
                }
            }
        }

        impl $field for $struc {}
    };
}

// ————————————————————————————— Control Fields ————————————————————————————— //

vmcs_fields! {
    /// VMCS fields encoding of 16 bits control fields.
    pub enum Ctrl16: VmcsField16 {
        Vpid                  = 0x00000000,
        PostedIntNotifVector  = 0x00000002,
        EptpIndex             = 0x00000004,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of 32 bits control fields.
    pub enum Ctrl32: VmcsField32 {
        PinBasedExecCtrls             = 0x00004000,
        PrimaryProcBasedExecCtrls     = 0x00004002,
        ExceptionBitmap               = 0x00004004,
        PageFaultErrCodeMask          = 0x00004006,
        PageFaultErrCodeMatch         = 0x00004008,
        Cr3TargetCount                = 0x0000400A,
        VmExitCtrls                   = 0x0000400C,
        VmExitMsrStoreCount           = 0x0000400E,
        VmExitMsrLoadCount            = 0x00004010,
        VmEntryCtrls                  = 0x00004012,
        VmEntryMsrLoadCount           = 0x00004014,
        VmEntryIntInfoField           = 0x00004016,
        VmEntryExceptErrCode          = 0x00004018,
        VmEntryInstrLength            = 0x0000401A,
        TprThreshold                  = 0x0000401C,
        SecondaryProcBasedVmExecCtrls = 0x0000401E,
        PleGap                        = 0x00004020,
        PleWindow                     = 0x00004022,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of 64 bits control fields.
    pub enum Ctrl64: VmcsField64 {
        IoBitmapA         = 0x00002000,
        IoBitmapB         = 0x00002002,
        MsrBitmaps        = 0x00002004,
        VmExitStoreAddr   = 0x00002006,
        VmExitLoadAddr    = 0x00002008,
        VmEntryLoadAddr   = 0x0000200A,
        ExecVmcsPtr       = 0x0000200C,
        PmlAddr           = 0x0000200E,
        TscOffset         = 0x00002010,
        VirtApicAddr      = 0x00002012,
        ApicAccessAddr    = 0x00002014,
        PostedIntDescAddr = 0x00002016,
        VmFuncCtrls       = 0x00002018,
        EptPtr            = 0x0000201A,
        EoiExitBitmap0    = 0x0000201C,
        EoiExitBitmap1    = 0x0000201E,
        EoiExitBitmap2    = 0x00002020,
        EoiExitBitmap3    = 0x00002022,
        EptpListAddr      = 0x00002024,
        VmreadBitmapAddr  = 0x00002026,
        VmwriteBitmapAddr = 0x00002028,
        VirtExceptInfAddr = 0x0000202A,
        XssExitBitmap     = 0x0000202C,
        EnclsExitBitmap   = 0x0000202E,
        TscMultiplier     = 0x00002032,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of natural width control fields.
    pub enum CtrlNat: VmcsFieldNat {
        Cr0GuestHostMask = 0x00006000,
        Cr4GuestHostMask = 0x00006002,
        Cr0ReadShadow    = 0x00006004,
        Cr4ReadShadow    = 0x00006006,
        Cr3TargetValue0  = 0x00006008,
        Cr3TargetValue1  = 0x0000600A,
        Cr3TargetValue2  = 0x0000600C,
        Cr3TargetValue3  = 0x0000600E,
    }
}

// ——————————————————————————— Host State Fields ———————————————————————————— //

vmcs_fields! {
    /// VMCS fields encoding of 16 bits host state fields.
    pub enum HostState16: VmcsField16 {
        EsSelector = 0x00000C00,
        CsSelector = 0x00000C02,
        SsSelector = 0x00000C04,
        DsSelector = 0x00000C06,
        FsSelector = 0x00000C08,
        GsSelector = 0x00000C0A,
        TrSelector = 0x00000C0C,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of 32 bits host state fields.
    pub enum HostState32: VmcsField32 {
        Ia32SysenterCs = 0x00004C00,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of 64 bits host state fields.
    ///
    /// The high halves live at `encoding + 1` (e.g. 0x2C01 for the PAT).
    pub enum HostState64: VmcsField64 {
        Ia32Pat            = 0x00002C00,
        Ia32Efer           = 0x00002C02,
        Ia32PerfGlobalCtrl = 0x00002C04,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of natural width host state fields.
    pub enum HostStateNat: VmcsFieldNat {
        Cr0             = 0x00006C00,
        Cr3             = 0x00006C02,
        Cr4             = 0x00006C04,
        FsBase          = 0x00006C06,
        GsBase          = 0x00006C08,
        TrBase          = 0x00006C0A,
        GdtrBase        = 0x00006C0C,
        IdtrBase        = 0x00006C0E,
        Ia32SysenterEsp = 0x00006C10,
        Ia32SysenterEip = 0x00006C12,
        Rsp             = 0x00006C14,
        Rip             = 0x00006C16,
    }
}

// ——————————————————————————— Guest State Fields ——————————————————————————— //

vmcs_fields! {
    /// VMCS fields encoding of 16 bits guest state fields.
    pub enum GuestState16: VmcsField16 {
        EsSelector      = 0x00000800,
        CsSelector      = 0x00000802,
        SsSelector      = 0x00000804,
        DsSelector      = 0x00000806,
        FsSelector      = 0x00000808,
        GsSelector      = 0x0000080A,
        LdtrSelector    = 0x0000080C,
        TrSelector      = 0x0000080E,
        InterruptStatus = 0x00000810,
        PmlIndex        = 0x00000812,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of 32 bits guest state fields.
    pub enum GuestState32: VmcsField32 {
        EsLimit                 = 0x00004800,
        CsLimit                 = 0x00004802,
        SsLimit                 = 0x00004804,
        DsLimit                 = 0x00004806,
        FsLimit                 = 0x00004808,
        GsLimit                 = 0x0000480A,
        LdtrLimit               = 0x0000480C,
        TrLimit                 = 0x0000480E,
        GdtrLimit               = 0x00004810,
        IdtrLimit               = 0x00004812,
        EsAccessRights          = 0x00004814,
        CsAccessRights          = 0x00004816,
        SsAccessRights          = 0x00004818,
        DsAccessRights          = 0x0000481A,
        FsAccessRights          = 0x0000481C,
        GsAccessRights          = 0x0000481E,
        LdtrAccessRights        = 0x00004820,
        TrAccessRights          = 0x00004822,
        InterruptibilityState   = 0x00004824,
        ActivityState           = 0x00004826,
        Smbase                  = 0x00004828,
        Ia32SysenterCs          = 0x0000482A,
        /// Only exists if processor support VMX preemption timer.
        VmxPreemptionTimerValue = 0x0000482E,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of 64 bits guest state fields.
    pub enum GuestState64: VmcsField64 {
        VmcsLinkPtr        = 0x00002800,
        Ia32Debugctl       = 0x00002802,
        Ia32Pat            = 0x00002804,
        Ia32Efer           = 0x00002806,
        Ia32PerfGlobalCtrl = 0x00002808,
        Pdpte0             = 0x0000280A,
        Pdpte1             = 0x0000280C,
        Pdpte2             = 0x0000280E,
        Pdpte3             = 0x00002810,
        Ia32Bndcfgs        = 0x00002812,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of natural width guest state fields.
    pub enum GuestStateNat: VmcsFieldNat {
        Cr0                = 0x00006800,
        Cr3                = 0x00006802,
        Cr4                = 0x00006804,
        EsBase             = 0x00006806,
        CsBase             = 0x00006808,
        SsBase             = 0x0000680A,
        DsBase             = 0x0000680C,
        FsBase             = 0x0000680E,
        GsBase             = 0x00006810,
        LdtrBase           = 0x00006812,
        TrBase             = 0x00006814,
        GdtrBase           = 0x00006816,
        IdtrBase           = 0x00006818,
        Dr7                = 0x0000681A,
        Rsp                = 0x0000681C,
        Rip                = 0x0000681E,
        Rflags             = 0x00006820,
        PendingDebugExcept = 0x00006822,
        Ia32SysenterEsp    = 0x00006824,
        Ia32SysenterEip    = 0x00006826,
    }
}

// ——————————————————————————— Read-Only Fields ————————————————————————————— //

vmcs_fields! {
    /// VMCS fields encoding of 32 bits read-only fields.
    pub enum GuestState32Ro: VmcsField32Ro {
        VmInstructionError     = 0x00004400,
        ExitReason             = 0x00004402,
        VmExitInterruptInfo    = 0x00004404,
        VmExitInterruptErrCode = 0x00004406,
        IdtVectoringInfoField  = 0x00004408,
        IdtVectoringErrCode    = 0x0000440A,
        VmExitInstructionLen   = 0x0000440C,
        VmExitInstructionInfo  = 0x0000440E,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of 64 bits read-only fields.
    pub enum GuestState64Ro: VmcsField64Ro {
        GuestPhysicalAddr = 0x00002400,
    }
}

vmcs_fields! {
    /// VMCS fields encoding of natural width read-only fields.
    pub enum GuestStateNatRo: VmcsFieldNatRo {
        ExitQualification = 0x00006400,
        IoRcx             = 0x00006402,
        IoRsi             = 0x00006404,
        IoRdi             = 0x00006406,
        IoRip             = 0x00006408,
        GuestLinearAddr   = 0x0000640A,
    }
}

// ————————————————————————————— Encoding Table ————————————————————————————— //

fn entry<F: VmcsField>(field: &F) -> (&'static str, u32) {
    (field.name(), field.raw())
}

/// Iterates over the name and encoding of every known field.
pub fn all_fields() -> impl Iterator<Item = (&'static str, u32)> {
    Ctrl16::ALL
        .iter()
        .map(entry)
        .chain(Ctrl32::ALL.iter().map(entry))
        .chain(Ctrl64::ALL.iter().map(entry))
        .chain(CtrlNat::ALL.iter().map(entry))
        .chain(HostState16::ALL.iter().map(entry))
        .chain(HostState32::ALL.iter().map(entry))
        .chain(HostState64::ALL.iter().map(entry))
        .chain(HostStateNat::ALL.iter().map(entry))
        .chain(GuestState16::ALL.iter().map(entry))
        .chain(GuestState32::ALL.iter().map(entry))
        .chain(GuestState64::ALL.iter().map(entry))
        .chain(GuestStateNat::ALL.iter().map(entry))
        .chain(GuestState32Ro::ALL.iter().map(entry))
        .chain(GuestState64Ro::ALL.iter().map(entry))
        .chain(GuestStateNatRo::ALL.iter().map(entry))
}

/// Resolves a field name (e.g. `"HostStateNat::Rip"`) to its encoding.
pub fn resolve(name: &str) -> Option<u32> {
    all_fields()
        .find(|(field_name, _)| *field_name == name)
        .map(|(_, encoding)| encoding)
}

// ————————————————————————————————— Tests —————————————————————————————————— //
