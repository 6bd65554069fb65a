#![cfg_attr(not(test), no_std)]

mod address;

pub use address::{HostPhysAddr, HostVirtAddr};

/// Size of a physical frame (4 KiB).
pub const PAGE_SIZE: usize = 0x1000;

// ——————————————————————————— Frame Abstraction ———————————————————————————— //

/// Representation of a physical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    /// The physical address of the frame.
    pub phys_addr: HostPhysAddr,

    /// The virtual adddress of the frame using the current mapping.
    ///
    /// WARNING: the mapping must stay stable for the whole duration of VMX operations.
    pub virt_addr: HostVirtAddr,
}

impl Frame {
    /// Creates a new Frame from a physical address and its corresponding virtual address.
    ///
    /// # Safety:
    /// The virtual address must be mapped to the physical address, the page must be exclusively
    /// owned by the frame, and the mapping must remain valid for ever.
    pub unsafe fn new(phys_addr: HostPhysAddr, virt_addr: HostVirtAddr) -> Self {
        Self {
            phys_addr,
            virt_addr,
        }
    }

    /// Returns a mutable view of the frame.
    pub fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: we assume that the frame address is a valid virtual address exclusively owned by
        // the Frame struct.
        unsafe { core::slice::from_raw_parts_mut(self.virt_addr.as_usize() as *mut u8, PAGE_SIZE) }
    }

    pub fn as_ref(&self) -> &[u8] {
        // SAFETY: same as `as_mut`.
        unsafe { core::slice::from_raw_parts(self.virt_addr.as_usize() as *const u8, PAGE_SIZE) }
    }

    /// Returns a mutable view of the frame as an array of u64.
    pub fn as_array_page(&mut self) -> &mut [u64] {
        // SAFETY: same as `as_mut`, frames are page-aligned hence u64-aligned.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.virt_addr.as_usize() as *mut u64,
                PAGE_SIZE / core::mem::size_of::<u64>(),
            )
        }
    }

    /// Zeroes out the frame.
    pub fn zero_out(&mut self) {
        for item in self.as_array_page().iter_mut() {
            *item = 0;
        }
    }

    /// Zeroes out the frame and returns it.
    pub fn zeroed(mut self) -> Self {
        self.zero_out();
        self
    }

    /// Returns true if every byte of the frame is zero.
    pub fn is_zeroed(&self) -> bool {
        self.as_ref().iter().all(|byte| *byte == 0)
    }

    /// Returns true if both the physical and virtual addresses are page-aligned and non-null.
    pub fn is_page_aligned(&self) -> bool {
        !self.phys_addr.is_null()
            && self.phys_addr.is_aligned(PAGE_SIZE)
            && self.virt_addr.is_aligned(PAGE_SIZE)
    }
}
