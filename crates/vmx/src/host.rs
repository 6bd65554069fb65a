//! Host state
//!
//! The state the processor restores on every VM exit. It is captured once from the running core
//! and written into the host-state area of the VMCS, together with the stack and entry point of
//! the VM-exit handler.
//!
//! See Intel SDM Vol. 3C Section 24.5.

use core::arch::asm;

use utils::HostVirtAddr;
use x86_64::instructions::tables::{sgdt, sidt};
use x86_64::registers::model_specific::{Efer, FsBase, GsBase};
use x86_64::registers::segmentation::{Segment, CS, DS, ES, FS, GS, SS};

use crate::bitmaps::ExitControls;
use crate::errors::{VmcsError, VmxError};
use crate::fields::traits::*;
use crate::fields::{HostState16, HostState32, HostState64, HostStateNat};
use crate::{msr, ActiveVmcs, Vmx};

/// Mask for keeping only the 32 lower bits.
const LOW_32_BITS_MASK: u64 = (1 << 32) - 1;

/// A snapshot of the host registers restored on VM exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostState {
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,

    pub cr0: usize,
    pub cr3: usize,
    pub cr4: usize,

    pub fs_base: usize,
    pub gs_base: usize,
    pub tr_base: usize,
    pub gdtr_base: usize,
    pub idtr_base: usize,

    pub sysenter_cs: u32,
    pub sysenter_esp: usize,
    pub sysenter_eip: usize,

    pub pat: u64,
    pub efer: u64,
    pub perf_global_ctrl: u64,
}

impl HostState {
    /// Captures the state of the executing core.
    ///
    /// # Safety
    ///
    /// Must run in ring 0 on the core that will execute the virtual CPU, with the GDT entry of
    /// the task register mapped.
    pub unsafe fn capture() -> Self {
        let gdt = sgdt();
        let idt = sidt();
        let tr: u16;
        // There is no nice wrapper to read `tr` in the x86_64 crate.
        asm!("str {0:x}",
            out(reg) tr,
            options(att_syntax, nostack, nomem, preserves_flags));

        // The TSS descriptor is 16 bytes long in 64 bits mode.
        let descriptor = (gdt.base.as_u64() as usize + (tr & !0b111) as usize) as *const u64;
        let tr_base = get_tr_base(*descriptor.add(1), *descriptor);

        let cr0: usize;
        let cr3: usize;
        let cr4: usize;
        asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));

        HostState {
            es: ES::get_reg().0,
            cs: CS::get_reg().0,
            ss: SS::get_reg().0,
            ds: DS::get_reg().0,
            fs: FS::get_reg().0,
            gs: GS::get_reg().0,
            tr,
            cr0,
            cr3,
            cr4,
            fs_base: FsBase::read().as_u64() as usize,
            gs_base: GsBase::read().as_u64() as usize,
            tr_base: tr_base as usize,
            gdtr_base: gdt.base.as_u64() as usize,
            idtr_base: idt.base.as_u64() as usize,
            sysenter_cs: msr::SYSENTER_CS.read() as u32,
            sysenter_esp: msr::SYSENTER_ESP.read() as usize,
            sysenter_eip: msr::SYSENTER_EIP.read() as usize,
            pat: msr::IA32_PAT.read(),
            efer: Efer::read().bits(),
            perf_global_ctrl: read_perf_global_ctrl(),
        }
    }
}

/// Reads IA32_PERF_GLOBAL_CTRL, which only exists from architectural performance monitoring
/// version 2 onward.
unsafe fn read_perf_global_ctrl() -> u64 {
    let cpuid = core::arch::x86_64::__cpuid(0x0A);
    if cpuid.eax & 0xFF >= 2 {
        msr::IA32_PERF_GLOBAL_CTRL.read()
    } else {
        0
    }
}

// —————————————————————————————— Host Writer ——————————————————————————————— //

/// Writes every host-state field of the current VMCS.
///
/// The 64 bits MSR fields are written only when the exit controls make use of them.
pub(crate) fn write_host_state<V: Vmx>(
    vmcs: &mut ActiveVmcs<'_, V>,
    host: &HostState,
    rsp: HostVirtAddr,
    rip: HostVirtAddr,
    exit_ctrls: ExitControls,
) -> Result<(), VmcsError> {
    // Segments
    write16(vmcs, HostState16::EsSelector, host.es)?;
    write16(vmcs, HostState16::CsSelector, host.cs)?;
    write16(vmcs, HostState16::SsSelector, host.ss)?;
    write16(vmcs, HostState16::DsSelector, host.ds)?;
    write16(vmcs, HostState16::FsSelector, host.fs)?;
    write16(vmcs, HostState16::GsSelector, host.gs)?;
    write16(vmcs, HostState16::TrSelector, host.tr)?;

    // Control registers
    write_nat(vmcs, HostStateNat::Cr0, host.cr0)?;
    write_nat(vmcs, HostStateNat::Cr3, host.cr3)?;
    write_nat(vmcs, HostStateNat::Cr4, host.cr4)?;

    // Bases
    write_nat(vmcs, HostStateNat::FsBase, host.fs_base)?;
    write_nat(vmcs, HostStateNat::GsBase, host.gs_base)?;
    write_nat(vmcs, HostStateNat::TrBase, host.tr_base)?;
    write_nat(vmcs, HostStateNat::GdtrBase, host.gdtr_base)?;
    write_nat(vmcs, HostStateNat::IdtrBase, host.idtr_base)?;

    // MSRs
    write32(vmcs, HostState32::Ia32SysenterCs, host.sysenter_cs)?;
    write_nat(vmcs, HostStateNat::Ia32SysenterEsp, host.sysenter_esp)?;
    write_nat(vmcs, HostStateNat::Ia32SysenterEip, host.sysenter_eip)?;
    if exit_ctrls.contains(ExitControls::LOAD_IA32_EFER) {
        write64(vmcs, HostState64::Ia32Efer, host.efer)?;
    }
    if exit_ctrls.contains(ExitControls::LOAD_IA32_PAT) {
        write64(vmcs, HostState64::Ia32Pat, host.pat)?;
    }
    if exit_ctrls.contains(ExitControls::LOAD_IA32_PERF_GLOBAL_CTRL) {
        write64(vmcs, HostState64::Ia32PerfGlobalCtrl, host.perf_global_ctrl)?;
    }

    // Exit handler
    write_nat(vmcs, HostStateNat::Rsp, rsp.as_usize())?;
    write_nat(vmcs, HostStateNat::Rip, rip.as_usize())?;

    Ok(())
}

/// Tags a failed write with the name of the field.
pub(crate) fn field_error<F: VmcsField>(field: F) -> impl FnOnce(VmxError) -> VmcsError {
    move |error| {
        log::error!("Failed to write {}: {:?}", field.name(), error);
        VmcsError::FieldWriteFailed {
            field: field.name(),
            error,
        }
    }
}

pub(crate) fn write16<V: Vmx, F: VmcsField16>(
    vmcs: &mut ActiveVmcs<'_, V>,
    field: F,
    value: u16,
) -> Result<(), VmcsError> {
    field.vmwrite(vmcs, value).map_err(field_error(field))
}

pub(crate) fn write32<V: Vmx, F: VmcsField32>(
    vmcs: &mut ActiveVmcs<'_, V>,
    field: F,
    value: u32,
) -> Result<(), VmcsError> {
    field.vmwrite(vmcs, value).map_err(field_error(field))
}

pub(crate) fn write64<V: Vmx, F: VmcsField64>(
    vmcs: &mut ActiveVmcs<'_, V>,
    field: F,
    value: u64,
) -> Result<(), VmcsError> {
    field.vmwrite(vmcs, value).map_err(field_error(field))
}

pub(crate) fn write_nat<V: Vmx, F: VmcsFieldNat>(
    vmcs: &mut ActiveVmcs<'_, V>,
    field: F,
    value: usize,
) -> Result<(), VmcsError> {
    field.vmwrite(vmcs, value).map_err(field_error(field))
}

// ———————————————————————————— Helper Functions ———————————————————————————— //

/// Construct the TR base from its system segment descriptor.
///
/// See Intel manual 7.2.3.
pub fn get_tr_base(desc_high: u64, desc_low: u64) -> u64 {
    const BASE_1_MASK: u64 = ((1 << 24) - 1) << 16;
    const BASE_2_MASK: u64 = ((1 << 8) - 1) << 56;

    let mut ptr = 0;
    ptr |= (desc_high & LOW_32_BITS_MASK) << 32;
    ptr |= (desc_low & BASE_2_MASK) >> 32;
    ptr |= (desc_low & BASE_1_MASK) >> 16;
    ptr
}
