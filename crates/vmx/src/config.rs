//! Per-vCPU configuration.

use utils::HostVirtAddr;

use crate::bitmaps::{
    EntryControls, ExceptionBitmap, ExitControls, PinbasedControls, PrimaryControls,
    SecondaryControls,
};

/// Configuration of a virtual CPU's VMCS.
///
/// The requested controls only list optional features, the bits mandated by the CPU are added
/// when the VMCS is initialized. An empty request is the conservative default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VcpuConfig {
    /// Number of 4 KiB pages of the host stack used on VM exits.
    pub host_stack_pages: usize,

    /// Entry point of the VM-exit handler, written as host RIP.
    pub exit_handler: HostVirtAddr,

    pub pinbased: PinbasedControls,
    pub primary: PrimaryControls,
    pub secondary: SecondaryControls,

    /// Requested on top of the host address-space size and IA32_EFER loading.
    pub exit: ExitControls,
    pub entry: EntryControls,
    pub exceptions: ExceptionBitmap,
}

impl VcpuConfig {
    pub const DEFAULT_HOST_STACK_PAGES: usize = 0x8;

    /// The exit controls every VMCS gets: a 64 bits host that reloads its EFER on exit.
    pub const BASE_EXIT_CONTROLS: ExitControls = ExitControls::from_bits_truncate(
        ExitControls::HOST_ADDRESS_SPACE_SIZE.bits() | ExitControls::LOAD_IA32_EFER.bits(),
    );

    pub fn new(exit_handler: HostVirtAddr) -> Self {
        VcpuConfig {
            host_stack_pages: Self::DEFAULT_HOST_STACK_PAGES,
            exit_handler,
            pinbased: PinbasedControls::empty(),
            primary: PrimaryControls::empty(),
            secondary: SecondaryControls::empty(),
            exit: ExitControls::empty(),
            entry: EntryControls::empty(),
            exceptions: ExceptionBitmap::empty(),
        }
    }

    pub fn with_host_stack_pages(mut self, pages: usize) -> Self {
        self.host_stack_pages = pages;
        self
    }

    /// The primary controls to request, including the activation of the secondary ones when
    /// needed.
    pub fn primary_controls(&self) -> PrimaryControls {
        if self.secondary.is_empty() {
            self.primary
        } else {
            self.primary | PrimaryControls::SECONDARY_CONTROLS
        }
    }

    pub fn exit_controls(&self) -> ExitControls {
        self.exit | Self::BASE_EXIT_CONTROLS
    }
}
