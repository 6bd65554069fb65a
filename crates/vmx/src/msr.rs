//! VMX Model Specific Registers
//!
//! A collection of some model specific registers relevant to VMX.

use core::arch::asm;

// ——————————————————————————————— Known MSRs ——————————————————————————————— //

pub const SYSENTER_CS: Msr = Msr::new(0x174);
pub const SYSENTER_ESP: Msr = Msr::new(0x175);
pub const SYSENTER_EIP: Msr = Msr::new(0x176);
pub const IA32_PAT: Msr = Msr::new(0x277);
pub const IA32_PERF_GLOBAL_CTRL: Msr = Msr::new(0x38F);
pub const VMX_BASIC: Msr = Msr::new(0x480);
pub const VMX_PINBASED_CTLS: Msr = Msr::new(0x481);
pub const VMX_PROCBASED_CTLS: Msr = Msr::new(0x482);
pub const VMX_EXIT_CTLS: Msr = Msr::new(0x483);
pub const VMX_ENTRY_CTLS: Msr = Msr::new(0x484);
pub const VMX_CR0_FIXED0: Msr = Msr::new(0x486);
pub const VMX_CR0_FIXED1: Msr = Msr::new(0x487);
pub const VMX_CR4_FIXED0: Msr = Msr::new(0x488);
pub const VMX_CR4_FIXED1: Msr = Msr::new(0x489);
pub const VMX_PROCBASED_CTLS2: Msr = Msr::new(0x48B);
pub const VMX_TRUE_PINBASED_CTLS: Msr = Msr::new(0x48D);
pub const VMX_TRUE_PROCBASED_CTLS: Msr = Msr::new(0x48E);
pub const VMX_TRUE_EXIT_CTLS: Msr = Msr::new(0x48F);
pub const VMX_TRUE_ENTRY_CTLS: Msr = Msr::new(0x490);

/// A model specific register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Msr(u32);

impl Msr {
    /// Creates a new MSR for it's address.
    pub const fn new(reg: u32) -> Self {
        Self(reg)
    }

    /// Returns the address of this MSR.
    pub const fn address(self) -> u32 {
        self.0
    }

    /// Reads 64 bits MSR register.
    ///
    /// ## Safety
    ///
    /// The caller must ensure that this read operation has no unsafe side
    /// effects.
    #[inline]
    pub unsafe fn read(&self) -> u64 {
        let (high, low): (u32, u32);
        asm!(
            "rdmsr",
            in("ecx") self.0,
            out("eax") low, out("edx") high,
            options(nomem, nostack, preserves_flags),
        );
        ((high as u64) << 32) | (low as u64)
    }
}

// ——————————————————————————— VMX Capabilities ————————————————————————————— //

/// Basic VMX Information.
///
/// See Intel SDM Vol. 3D Appendix A-1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmxBasicInfo {
    /// The 31-bits VMCS revision identifier used by the CPU.
    pub revision: u32,

    /// Minimum required size in bytes for VMCS and VMXON regions.
    pub vmcs_width: u32,

    /// Support the VMX_TRUE_CTLS registers.
    pub support_true_ctls: bool,
}

impl VmxBasicInfo {
    /// Decodes the value of the `IA32_VMX_BASIC` MSR.
    pub fn from_raw(raw_info: u64) -> Self {
        let revision = raw_info & ((1 << 31) - 1); // bits 30:0, bit 31 is always 0
        let vmcs_width = (raw_info & ((1 << 45) - 1)) >> 32; // bits 44:32
        let support_true_ctls = raw_info & (1 << 55) != 0;
        VmxBasicInfo {
            revision: revision as u32,
            vmcs_width: vmcs_width as u32,
            support_true_ctls,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basic_info() {
        let info = VmxBasicInfo::from_raw((1 << 55) | (0x1000 << 32) | 0x8000_0004);
        assert_eq!(info.revision, 0x4);
        assert_eq!(info.vmcs_width, 0x1000);
        assert!(info.support_true_ctls);

        let info = VmxBasicInfo::from_raw((0x400 << 32) | 0x12);
        assert_eq!(info.revision, 0x12);
        assert_eq!(info.vmcs_width, 0x400);
        assert!(!info.support_true_ctls);
    }
}
