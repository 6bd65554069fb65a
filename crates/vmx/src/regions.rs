//! Memory backing a VMCS.
//!
//! Each virtual CPU owns five page-sized regions (the VMCS itself, the two I/O bitmaps, the MSR
//! bitmap and the virtual-APIC page) and a contiguous host stack used on VM exits.

use mmu::{PhysRange, RangeAllocator};
use utils::{Frame, HostVirtAddr, PAGE_SIZE};

use crate::errors::AllocationError;

/// Bytes kept free at the top of the host stack.
const HOST_STACK_TOP_PADDING: usize = 16;

/// Identifier of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VcpuId(pub usize);

/// The memory regions of a VMCS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Vmcs,
    IoBitmapA,
    IoBitmapB,
    MsrBitmap,
    VirtualApic,
    HostStack,
}

/// The page-sized regions of a virtual CPU.
#[derive(Debug)]
pub struct VmcsRegions {
    /// The VMCS region, starting with the revision identifier.
    pub vmcs: Frame,
    /// I/O bitmap for ports 0x0000 to 0x7FFF.
    pub io_bitmap_a: Frame,
    /// I/O bitmap for ports 0x8000 to 0xFFFF.
    pub io_bitmap_b: Frame,
    pub msr_bitmap: Frame,
    pub virtual_apic: Frame,
}

impl VmcsRegions {
    /// The regions, in allocation order.
    pub fn frames(&self) -> [(RegionKind, Frame); 5] {
        [
            (RegionKind::Vmcs, self.vmcs),
            (RegionKind::IoBitmapA, self.io_bitmap_a),
            (RegionKind::IoBitmapB, self.io_bitmap_b),
            (RegionKind::MsrBitmap, self.msr_bitmap),
            (RegionKind::VirtualApic, self.virtual_apic),
        ]
    }
}

/// The stack the host runs on after a VM exit.
#[derive(Debug)]
pub struct HostStack {
    range: PhysRange,
    virt_start: HostVirtAddr,
}

impl HostStack {
    pub fn range(&self) -> PhysRange {
        self.range
    }

    pub fn size(&self) -> usize {
        self.range.size()
    }

    /// Lowest virtual address of the stack.
    pub fn bottom(&self) -> HostVirtAddr {
        self.virt_start
    }

    /// Virtual address right past the end of the stack.
    pub fn top(&self) -> HostVirtAddr {
        self.virt_start + self.size()
    }

    /// The stack pointer loaded on VM exits: 16 bytes below the top, 16 bytes aligned.
    pub fn rsp(&self) -> HostVirtAddr {
        (self.top() - HOST_STACK_TOP_PADDING).align_down(16)
    }

    /// Returns true if `addr` lies within the stack.
    pub fn contains(&self, addr: HostVirtAddr) -> bool {
        self.bottom() <= addr && addr < self.top()
    }
}

// ——————————————————————————————— Allocation ——————————————————————————————— //

/// Allocates the zeroed regions and host stack of a virtual CPU.
///
/// Either everything is allocated or nothing is: on failure the memory obtained so far is handed
/// back to the allocator, in reverse order.
pub fn allocate_regions<A: RangeAllocator>(
    allocator: &A,
    vcpu: VcpuId,
    stack_pages: usize,
) -> Result<(VmcsRegions, HostStack), AllocationError> {
    if stack_pages == 0 {
        return Err(AllocationError::EmptyStack { vcpu });
    }

    let mut reservation = Reservation::new(allocator, vcpu);
    let vmcs = reservation.frame(RegionKind::Vmcs)?;
    let io_bitmap_a = reservation.frame(RegionKind::IoBitmapA)?;
    let io_bitmap_b = reservation.frame(RegionKind::IoBitmapB)?;
    let msr_bitmap = reservation.frame(RegionKind::MsrBitmap)?;
    let virtual_apic = reservation.frame(RegionKind::VirtualApic)?;
    let stack = reservation.stack(stack_pages)?;
    reservation.commit();

    log::debug!(
        "vCPU {}: VMCS at 0x{:x}, host stack [0x{:x}, 0x{:x})",
        vcpu.0,
        vmcs.phys_addr.as_usize(),
        stack.range.start.as_usize(),
        stack.range.end.as_usize()
    );

    let regions = VmcsRegions {
        vmcs,
        io_bitmap_a,
        io_bitmap_b,
        msr_bitmap,
        virtual_apic,
    };
    Ok((regions, stack))
}

/// Returns the regions and host stack of a virtual CPU to the allocator.
///
/// The stack goes first, then the frames in reverse allocation order.
pub fn free_regions<A: RangeAllocator>(allocator: &A, regions: VmcsRegions, stack: HostStack) {
    if allocator.free_range(stack.range).is_err() {
        log::warn!(
            "Host stack at 0x{:x} was not reclaimed",
            stack.range.start.as_usize()
        );
    }
    for (region, frame) in regions.frames().iter().rev() {
        if allocator.free_frame(*frame).is_err() {
            log::warn!(
                "{:?} at 0x{:x} was not reclaimed",
                region,
                frame.phys_addr.as_usize()
            );
        }
    }
}

/// Memory allocated so far for a virtual CPU, released on drop unless committed.
struct Reservation<'a, A: RangeAllocator> {
    allocator: &'a A,
    vcpu: VcpuId,
    frames: [Option<Frame>; 5],
    nb_frames: usize,
    stack: Option<PhysRange>,
    committed: bool,
}

impl<'a, A: RangeAllocator> Reservation<'a, A> {
    fn new(allocator: &'a A, vcpu: VcpuId) -> Self {
        Reservation {
            allocator,
            vcpu,
            frames: [None; 5],
            nb_frames: 0,
            stack: None,
            committed: false,
        }
    }

    fn frame(&mut self, region: RegionKind) -> Result<Frame, AllocationError> {
        let vcpu = self.vcpu;
        let frame = self
            .allocator
            .allocate_frame()
            .ok_or(AllocationError::OutOfMemory { vcpu, region })?;
        if !frame.is_page_aligned() {
            let _ = self.allocator.free_frame(frame);
            return Err(AllocationError::Misaligned {
                vcpu,
                region,
                addr: frame.phys_addr,
            });
        }

        self.frames[self.nb_frames] = Some(frame);
        self.nb_frames += 1;
        Ok(frame.zeroed())
    }

    fn stack(&mut self, pages: usize) -> Result<HostStack, AllocationError> {
        let vcpu = self.vcpu;
        let region = RegionKind::HostStack;
        let out_of_memory = AllocationError::OutOfMemory { vcpu, region };
        let size = pages.checked_mul(PAGE_SIZE).ok_or(out_of_memory)?;
        let range = self
            .allocator
            .allocate_range(size)
            .ok_or(out_of_memory)?;
        let virt_start = HostVirtAddr::new(
            range.start.as_usize() + self.allocator.get_physical_offset().as_usize(),
        );
        if range.start.is_null()
            || !range.start.is_aligned(PAGE_SIZE)
            || !virt_start.is_aligned(PAGE_SIZE)
        {
            let _ = self.allocator.free_range(range);
            return Err(AllocationError::Misaligned {
                vcpu,
                region,
                addr: range.start,
            });
        }
        self.stack = Some(range);

        // SAFETY: the allocator guarantees the range is mapped at the physical offset and owned
        // by us.
        unsafe {
            core::ptr::write_bytes(virt_start.as_usize() as *mut u8, 0, range.size());
        }
        Ok(HostStack { range, virt_start })
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl<'a, A: RangeAllocator> Drop for Reservation<'a, A> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(range) = self.stack.take() {
            let _ = self.allocator.free_range(range);
        }
        for frame in self.frames[..self.nb_frames].iter().rev().flatten() {
            let _ = self.allocator.free_frame(*frame);
        }
    }
}

