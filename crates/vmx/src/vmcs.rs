//! VMCS lifecycle
//!
//! A VMCS goes through the following states:
//!
//! ```text
//! Uninitialized --pre_initialize_vmcs--> Cleared --> Current --initialize_vmcs--> Populated --> Ready
//!                                           ^                                                    |
//!                                           +----------------------- release --------------------+
//! ```
//!
//! `pre_initialize_vmcs` writes the revision identifier, clears the VMCS and makes it current on
//! the executing core. `initialize_vmcs` writes the host state and execution controls, then
//! validates the result. Moving a VMCS to another core requires releasing it (VMCLEAR) on the old
//! core and loading it on the new one, after which its host state must be written again.

use core::cell::Cell;
use core::marker::PhantomData;

use mmu::RangeAllocator;
use utils::{HostPhysAddr, PAGE_SIZE};

use crate::bitmaps::PrimaryControls;
use crate::config::VcpuConfig;
use crate::errors::VmcsError;
use crate::fields::{Ctrl32, Ctrl64, GuestState64};
use crate::host::{field_error, write32, write64, write_host_state, HostState};
use crate::regions::{allocate_regions, free_regions, HostStack, VcpuId, VmcsRegions};
use crate::{check, ActiveVmcs, PhysicalCore, Vmx};

/// The VMCS link pointer must be all ones when VMCS shadowing is not used.
const VMCS_LINK_PTR_NONE: u64 = !0;

/// State of a VMCS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmcsState {
    /// Memory is allocated, the hardware never saw the VMCS.
    Uninitialized,
    /// The VMCS was cleared and is not current on any core.
    Cleared,
    /// The VMCS is current on a core, its content is unspecified.
    Current,
    /// Host state and controls were (possibly partially) written.
    Populated,
    /// The VMCS is fully initialized and passed validation.
    Ready,
}

impl VmcsState {
    /// Returns true if the VMCS has been loaded on a core and not released since.
    pub fn is_loaded(self) -> bool {
        matches!(
            self,
            VmcsState::Current | VmcsState::Populated | VmcsState::Ready
        )
    }
}

/// Lifecycle operations, used to report illegal transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    PreInitialize,
    Initialize,
    Release,
    Load,
}

/// The VMCS of a virtual CPU, together with the memory it references.
pub struct Vmcs {
    vcpu: VcpuId,
    regions: VmcsRegions,
    stack: HostStack,
    state: VmcsState,
    /// The core the VMCS is active on, if any.
    core: Option<usize>,
    // This field makes Vmcs !Sync. It stays Send: a released VMCS can move to the thread running
    // on another core, where it is loaded again.
    _not_sync: PhantomData<Cell<()>>,
}

impl Vmcs {
    /// Allocates the regions and host stack of a virtual CPU.
    ///
    /// No instance exists if the allocation fails, and the hardware is not touched.
    pub fn new<A: RangeAllocator>(
        allocator: &A,
        vcpu: VcpuId,
        config: &VcpuConfig,
    ) -> Result<Self, VmcsError> {
        let (regions, stack) = allocate_regions(allocator, vcpu, config.host_stack_pages)
            .map_err(|err| {
                log::error!("vCPU {}: {}", vcpu.0, err);
                err
            })?;
        Ok(Vmcs {
            vcpu,
            regions,
            stack,
            state: VmcsState::Uninitialized,
            core: None,
            _not_sync: PhantomData,
        })
    }

    pub fn vcpu(&self) -> VcpuId {
        self.vcpu
    }

    pub fn state(&self) -> VmcsState {
        self.state
    }

    /// Returns true once the VMCS can be used for VM entry.
    pub fn is_ready(&self) -> bool {
        self.state == VmcsState::Ready
    }

    /// Physical address of the VMCS region.
    pub fn vmcs_ptr(&self) -> HostPhysAddr {
        self.regions.vmcs.phys_addr
    }

    pub fn regions(&self) -> &VmcsRegions {
        &self.regions
    }

    pub fn host_stack(&self) -> &HostStack {
        &self.stack
    }

    /// The core the VMCS is active on, if any.
    pub fn core(&self) -> Option<usize> {
        self.core
    }

    /// Writes the revision identifier, clears the VMCS and makes it current on `core`.
    ///
    /// Fails without touching the hardware if the CPU expects a VMCS larger than a frame. On
    /// failure the VMCS goes back to `Uninitialized`.
    pub fn pre_initialize_vmcs<V: Vmx>(
        &mut self,
        core: &mut PhysicalCore<V>,
    ) -> Result<(), VmcsError> {
        self.expect_state(VmcsState::Uninitialized, Operation::PreInitialize)?;

        let info = core.vmx_info();
        if info.vmcs_width as usize > PAGE_SIZE {
            log::error!(
                "vCPU {}: VMCS of 0x{:x} bytes does not fit in a frame",
                self.vcpu.0,
                info.vmcs_width
            );
            return Err(VmcsError::UnsupportedVmcsSize {
                size: info.vmcs_width,
            });
        }

        // Initialize the VMCS region by copying the revision ID into the 4 first bytes of VMCS
        // region
        self.regions.vmcs.as_mut()[0..4].copy_from_slice(&info.revision.to_le_bytes());

        let ptr = self.vmcs_ptr();
        core.clear(ptr).map_err(|err| {
            log::error!("vCPU {}: VMCLEAR failed: {:?}", self.vcpu.0, err);
            VmcsError::ClearFailed(err)
        })?;
        self.state = VmcsState::Cleared;

        if let Err(err) = core.load(ptr) {
            log::error!("vCPU {}: VMPTRLD failed: {:?}", self.vcpu.0, err);
            self.state = VmcsState::Uninitialized;
            return Err(VmcsError::LoadFailed(err));
        }
        self.state = VmcsState::Current;
        self.core = Some(core.id());

        log::debug!(
            "vCPU {}: VMCS 0x{:x} current on core {}",
            self.vcpu.0,
            ptr.as_usize(),
            core.id()
        );
        Ok(())
    }

    /// Writes the host state and execution controls, then validates the VMCS.
    ///
    /// The VMCS must be current on `core`. On failure it is left `Populated` and must not be used
    /// for VM entry.
    pub fn initialize_vmcs<V: Vmx>(
        &mut self,
        core: &mut PhysicalCore<V>,
        host: &HostState,
        config: &VcpuConfig,
    ) -> Result<(), VmcsError> {
        match self.state {
            VmcsState::Current => (),
            VmcsState::Uninitialized | VmcsState::Cleared => return Err(VmcsError::NotCurrent),
            state => {
                return Err(VmcsError::IllegalTransition {
                    from: state,
                    operation: Operation::Initialize,
                })
            }
        }

        let mut vmcs = core.active(self)?;
        self.state = VmcsState::Populated;

        let rsp = self.stack.rsp();
        let rip = config.exit_handler;
        write_controls(&mut vmcs, &self.regions, config)?;
        write_host_state(&mut vmcs, host, rsp, rip, config.exit_controls())?;
        write64(&mut vmcs, GuestState64::VmcsLinkPtr, VMCS_LINK_PTR_NONE)?;

        check::check(&vmcs, &self.stack, rip).map_err(|err| {
            log::error!("vCPU {}: invalid VMCS: {:?}", self.vcpu.0, err);
            VmcsError::ValidationFailed(err)
        })?;
        self.state = VmcsState::Ready;

        log::info!(
            "vCPU {}: VMCS ready, exit handler at 0x{:x}",
            self.vcpu.0,
            rip.as_usize()
        );
        Ok(())
    }

    /// Clears the VMCS from `core`, so that it can be loaded on another core.
    pub fn release<V: Vmx>(&mut self, core: &mut PhysicalCore<V>) -> Result<(), VmcsError> {
        if !self.state.is_loaded() {
            return Err(VmcsError::IllegalTransition {
                from: self.state,
                operation: Operation::Release,
            });
        }
        self.expect_core(core)?;

        core.clear(self.vmcs_ptr()).map_err(|err| {
            log::error!("vCPU {}: VMCLEAR failed: {:?}", self.vcpu.0, err);
            VmcsError::ClearFailed(err)
        })?;
        self.state = VmcsState::Cleared;
        self.core = None;
        Ok(())
    }

    /// Makes the VMCS current on `core`.
    ///
    /// A cleared VMCS becomes `Current` and must be initialized again, as its host state belongs
    /// to the previous core. A VMCS already active on `core` keeps its state.
    pub fn load<V: Vmx>(&mut self, core: &mut PhysicalCore<V>) -> Result<(), VmcsError> {
        match self.state {
            VmcsState::Uninitialized => {
                return Err(VmcsError::IllegalTransition {
                    from: self.state,
                    operation: Operation::Load,
                })
            }
            VmcsState::Cleared => (),
            _ => self.expect_core(core)?,
        }

        core.load(self.vmcs_ptr()).map_err(|err| {
            log::error!("vCPU {}: VMPTRLD failed: {:?}", self.vcpu.0, err);
            VmcsError::LoadFailed(err)
        })?;
        if self.state == VmcsState::Cleared {
            self.state = VmcsState::Current;
        }
        self.core = Some(core.id());
        Ok(())
    }

    /// Clears the VMCS if needed and returns its memory to the allocator.
    ///
    /// If the VMCS can not be cleared its memory is leaked rather than reused.
    pub fn teardown<V: Vmx, A: RangeAllocator>(
        self,
        core: &mut PhysicalCore<V>,
        allocator: &A,
    ) -> Result<(), VmcsError> {
        if self.state.is_loaded() {
            self.expect_core(core)?;
            core.clear(self.vmcs_ptr()).map_err(|err| {
                log::error!("vCPU {}: VMCLEAR failed: {:?}", self.vcpu.0, err);
                VmcsError::ClearFailed(err)
            })?;
        }

        log::debug!("vCPU {}: releasing VMCS memory", self.vcpu.0);
        free_regions(allocator, self.regions, self.stack);
        Ok(())
    }

    fn expect_state(&self, expected: VmcsState, operation: Operation) -> Result<(), VmcsError> {
        if self.state != expected {
            return Err(VmcsError::IllegalTransition {
                from: self.state,
                operation,
            });
        }
        Ok(())
    }

    fn expect_core<V: Vmx>(&self, core: &PhysicalCore<V>) -> Result<(), VmcsError> {
        match self.core {
            Some(id) if id != core.id() => Err(VmcsError::ActiveOnOtherCore { core: id }),
            _ => Ok(()),
        }
    }
}

/// Writes the execution, exit and entry controls and the addresses of the VMCS regions.
fn write_controls<V: Vmx>(
    vmcs: &mut ActiveVmcs<'_, V>,
    regions: &VmcsRegions,
    config: &VcpuConfig,
) -> Result<(), VmcsError> {
    let primary = config.primary_controls();
    vmcs.set_pin_based_ctrls(config.pinbased)
        .map_err(field_error(Ctrl32::PinBasedExecCtrls))?;
    vmcs.set_primary_ctrls(primary)
        .map_err(field_error(Ctrl32::PrimaryProcBasedExecCtrls))?;
    if primary.contains(PrimaryControls::SECONDARY_CONTROLS) {
        vmcs.set_secondary_ctrls(config.secondary)
            .map_err(field_error(Ctrl32::SecondaryProcBasedVmExecCtrls))?;
    }
    vmcs.set_vm_exit_ctrls(config.exit_controls())
        .map_err(field_error(Ctrl32::VmExitCtrls))?;
    vmcs.set_vm_entry_ctrls(config.entry)
        .map_err(field_error(Ctrl32::VmEntryCtrls))?;
    vmcs.set_exception_bitmap(config.exceptions)
        .map_err(field_error(Ctrl32::ExceptionBitmap))?;

    // No CR3 target nor MSR areas.
    write32(vmcs, Ctrl32::Cr3TargetCount, 0)?;
    write32(vmcs, Ctrl32::VmExitMsrStoreCount, 0)?;
    write32(vmcs, Ctrl32::VmExitMsrLoadCount, 0)?;
    write32(vmcs, Ctrl32::VmEntryMsrLoadCount, 0)?;

    write64(vmcs, Ctrl64::IoBitmapA, regions.io_bitmap_a.phys_addr.as_u64())?;
    write64(vmcs, Ctrl64::IoBitmapB, regions.io_bitmap_b.phys_addr.as_u64())?;
    write64(vmcs, Ctrl64::MsrBitmaps, regions.msr_bitmap.phys_addr.as_u64())?;
    if primary.contains(PrimaryControls::USE_TPR_SHADOW) {
        write64(
            vmcs,
            Ctrl64::VirtApicAddr,
            regions.virtual_apic.phys_addr.as_u64(),
        )?;
    }
    Ok(())
}

