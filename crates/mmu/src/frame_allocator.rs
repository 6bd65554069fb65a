//! The traits used to obtain physical memory, and a simple range-backed implementation.

use core::cell::Cell;

use utils::{Frame, HostPhysAddr, HostVirtAddr, PAGE_SIZE};

/// A source of page-sized physical frames.
///
/// # Safety
///
/// Implementors must only hand out frames that are mapped at `phys_addr + physical offset`,
/// page-aligned, and not owned by anybody else.
pub unsafe trait FrameAllocator {
    /// Allocates a frame.
    fn allocate_frame(&self) -> Option<Frame>;

    /// Frees a frame.
    fn free_frame(&self, _frame: Frame) -> Result<(), ()> {
        // Default implementation: leak all the pages
        Ok(())
    }

    /// Returns the boundaries of usable physical memory.
    fn get_boundaries(&self) -> (usize, usize);

    /// Returns the offset between physical and virtual addresses.
    fn get_physical_offset(&self) -> HostVirtAddr;
}

/// A source of physically contiguous memory ranges.
///
/// # Safety
///
/// Same requirements as [`FrameAllocator`], for every page of the returned range.
pub unsafe trait RangeAllocator: FrameAllocator {
    /// Allocates a range of physical memory.
    fn allocate_range(&self, size: usize) -> Option<PhysRange>;

    /// Frees a range of physical memory.
    fn free_range(&self, _range: PhysRange) -> Result<(), ()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A range of physical memory.
pub struct PhysRange {
    /// Start of the physical range (inclusive).
    pub start: HostPhysAddr,
    /// End of the physical range (exclusive).
    pub end: HostPhysAddr,
}

impl PhysRange {
    pub fn size(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    /// Returns true if the two ranges share at least one byte.
    pub fn overlaps(&self, other: &PhysRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `addr` lies within the range.
    pub fn contains(&self, addr: HostPhysAddr) -> bool {
        self.start <= addr && addr < self.end
    }
}

impl From<Frame> for PhysRange {
    fn from(frame: Frame) -> Self {
        PhysRange {
            start: frame.phys_addr,
            end: frame.phys_addr + PAGE_SIZE,
        }
    }
}

// ————————————————————————— Range Frame Allocator —————————————————————————— //

/// A bump allocator handing out frames from a fixed physical range.
///
/// Freed memory is reclaimed only when it sits right below the cursor, which is the case when
/// allocations are rolled back in reverse order.
pub struct RangeFrameAllocator {
    range_start: HostPhysAddr,
    range_end: HostPhysAddr,
    cursor: Cell<HostPhysAddr>,
    physical_memory_offset: HostVirtAddr,
}

impl RangeFrameAllocator {
    /// Creates an allocator for `[range_start, range_end)`, shrunk to page boundaries.
    ///
    /// # Safety
    ///
    /// The whole range must be mapped at `physical_memory_offset`, unused, and remain so for the
    /// lifetime of the allocator and of the frames it hands out.
    pub unsafe fn new(
        range_start: HostPhysAddr,
        range_end: HostPhysAddr,
        physical_memory_offset: HostVirtAddr,
    ) -> Self {
        log::debug!(
            "Allocator range: [0x{:x}, 0x{:x}]",
            range_start.as_usize(),
            range_end.as_usize()
        );
        let range_start = range_start.align_up(PAGE_SIZE).unwrap_or(range_end);
        let range_end = range_end.align_down(PAGE_SIZE);
        Self {
            range_start,
            range_end,
            cursor: Cell::new(range_start),
            physical_memory_offset,
        }
    }

    fn to_virt(&self, addr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::new(addr.as_usize() + self.physical_memory_offset.as_usize())
    }

    fn reclaim(&self, range: PhysRange) -> Result<(), ()> {
        if range.start < self.range_start || range.end > self.range_end {
            return Err(());
        }
        if range.end == self.cursor.get() {
            self.cursor.set(range.start);
        }
        Ok(())
    }
}

unsafe impl FrameAllocator for RangeFrameAllocator {
    fn allocate_frame(&self) -> Option<Frame> {
        let cursor = self.cursor.get();
        if cursor.as_usize() + PAGE_SIZE <= self.range_end.as_usize() {
            self.cursor.set(cursor + PAGE_SIZE);
            // SAFETY: the range is mapped at the physical offset and frames are never handed out
            // twice.
            Some(unsafe { Frame::new(cursor, self.to_virt(cursor)) })
        } else {
            None
        }
    }

    fn free_frame(&self, frame: Frame) -> Result<(), ()> {
        self.reclaim(frame.into())
    }

    fn get_boundaries(&self) -> (usize, usize) {
        (self.range_start.as_usize(), self.range_end.as_usize())
    }

    fn get_physical_offset(&self) -> HostVirtAddr {
        self.physical_memory_offset
    }
}

unsafe impl RangeAllocator for RangeFrameAllocator {
    fn allocate_range(&self, size: usize) -> Option<PhysRange> {
        let cursor = self.cursor.get();
        let end = cursor.as_usize().checked_add(size)?;
        let new_cursor = HostPhysAddr::new(end).align_up(PAGE_SIZE)?;
        if size != 0 && new_cursor <= self.range_end {
            self.cursor.set(new_cursor);
            Some(PhysRange {
                start: cursor,
                end: new_cursor,
            })
        } else {
            None
        }
    }

    fn free_range(&self, range: PhysRange) -> Result<(), ()> {
        self.reclaim(range)
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
