//! # Tests for the VMX crate.
//!
//! The VMX instructions are emulated in software, the VMCS fields being stored per VMCS pointer,
//! and the memory handed out by the allocators is backed by a heap buffer.

mod scenario;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::collections::HashMap;

use mmu::{FrameAllocator, PhysRange, RangeAllocator, RangeFrameAllocator};
use utils::{Frame, HostPhysAddr, HostVirtAddr, PAGE_SIZE};

use crate::errors::{VmxError, VmxInstructionError};
use crate::{msr, HostState, Msr, PhysicalCore, Vmx};

/// Entry point of the VM-exit handler used by the tests.
pub const EXIT_HANDLER: HostVirtAddr = HostVirtAddr::new(0xffff_8000_0010_0000);

/// Physical address of the first page of test memory.
pub const MEMORY_START: usize = 0x1000;

const LOW_32_BITS_MASK: u64 = (1 << 32) - 1;

// ———————————————————————————— Emulated VMX ————————————————————————————— //

/// A VMX instruction executed by the emulated core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Clear(usize),
    Load(usize),
    Write(u32, u64),
}

/// A software model of the VMX instructions of a core.
pub struct EmulatedVmx {
    msrs: HashMap<u32, u64>,
    fields: HashMap<HostPhysAddr, HashMap<u32, u64>>,
    current: Option<HostPhysAddr>,
    pub fail_clear: Option<VmxError>,
    pub fail_load: Option<VmxError>,
    pub fail_write: Option<(u32, VmxError)>,
    pub ops: Vec<Op>,
}

impl EmulatedVmx {
    /// A core without support for the "true" control MSRs.
    pub fn new() -> Self {
        let mut msrs = HashMap::new();
        msrs.insert(msr::VMX_BASIC.address(), (0x1000 << 32) | 0x4);
        msrs.insert(msr::VMX_PINBASED_CTLS.address(), 0x0000_00ff_0000_0016);
        msrs.insert(msr::VMX_PROCBASED_CTLS.address(), 0xfff9_fffe_0401_e172);
        msrs.insert(msr::VMX_PROCBASED_CTLS2.address(), 0x0000_00ff_0000_0000);
        msrs.insert(msr::VMX_EXIT_CTLS.address(), 0x00ff_ffff_0003_6dff);
        msrs.insert(msr::VMX_ENTRY_CTLS.address(), 0x0003_ffff_0000_11ff);
        msrs.insert(msr::VMX_CR0_FIXED0.address(), 0x8000_0021);
        msrs.insert(msr::VMX_CR0_FIXED1.address(), 0xffff_ffff);
        msrs.insert(msr::VMX_CR4_FIXED0.address(), 0x2000);
        msrs.insert(msr::VMX_CR4_FIXED1.address(), 0x0037_27ff);

        EmulatedVmx {
            msrs,
            fields: HashMap::new(),
            current: None,
            fail_clear: None,
            fail_load: None,
            fail_write: None,
            ops: Vec::new(),
        }
    }

    /// A core with the "true" control MSRs, which do not require CR3 exiting.
    pub fn with_true_ctls() -> Self {
        let mut vmx = Self::new();
        let basic = vmx.msr(msr::VMX_BASIC) | (1 << 55);
        vmx.msrs.insert(msr::VMX_BASIC.address(), basic);
        for (regular, true_msr) in [
            (msr::VMX_PINBASED_CTLS, msr::VMX_TRUE_PINBASED_CTLS),
            (msr::VMX_EXIT_CTLS, msr::VMX_TRUE_EXIT_CTLS),
            (msr::VMX_ENTRY_CTLS, msr::VMX_TRUE_ENTRY_CTLS),
        ]
        .iter()
        {
            let value = vmx.msr(*regular);
            vmx.msrs.insert(true_msr.address(), value);
        }
        vmx.msrs
            .insert(msr::VMX_TRUE_PROCBASED_CTLS.address(), 0xfff9_fffe_0400_6172);
        vmx
    }

    pub fn set_msr(&mut self, msr: Msr, value: u64) {
        self.msrs.insert(msr.address(), value);
    }

    fn msr(&self, msr: Msr) -> u64 {
        self.msrs.get(&msr.address()).copied().unwrap_or(0)
    }

    /// The value of a field of the VMCS at `vmcs`, whether it is current or not.
    pub fn field(&self, vmcs: HostPhysAddr, field: u32) -> Option<u64> {
        self.fields.get(&vmcs)?.get(&field).copied()
    }

    /// The encodings written so far, in order.
    pub fn written(&self) -> Vec<u32> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Write(field, _) => Some(*field),
                _ => None,
            })
            .collect()
    }
}

/// Width bits 14:13 of an encoding equal to 1 denote a 64 bits field.
fn is_64_bits(field: u32) -> bool {
    (field >> 13) & 0b11 == 1
}

unsafe impl Vmx for EmulatedVmx {
    fn vmclear(&mut self, addr: HostPhysAddr) -> Result<(), VmxError> {
        if let Some(err) = self.fail_clear {
            return Err(err);
        }
        self.ops.push(Op::Clear(addr.as_usize()));
        if self.current == Some(addr) {
            self.current = None;
        }
        Ok(())
    }

    fn vmptrld(&mut self, addr: HostPhysAddr) -> Result<(), VmxError> {
        if let Some(err) = self.fail_load {
            return Err(err);
        }
        self.ops.push(Op::Load(addr.as_usize()));
        self.fields.entry(addr).or_default();
        self.current = Some(addr);
        Ok(())
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmxError> {
        let current = self.current.ok_or(VmxError::VmFailInvalid)?;
        match self.fail_write {
            Some((failing, err)) if failing == field => return Err(err),
            _ => (),
        }
        if (field >> 10) & 0b11 == 1 {
            return Err(VmxError::VmFailValid(
                VmxInstructionError::VmWriteToReadOnly,
            ));
        }
        self.ops.push(Op::Write(field, value));

        let fields = self.fields.entry(current).or_default();
        if is_64_bits(field) {
            let entry = fields.entry(field & !1).or_insert(0);
            if field & 1 == 0 {
                *entry = value;
            } else {
                *entry = (*entry & LOW_32_BITS_MASK) | (value << 32);
            }
        } else {
            let value = match (field >> 13) & 0b11 {
                0 => value as u16 as u64,
                2 => value as u32 as u64,
                _ => value,
            };
            fields.insert(field, value);
        }
        Ok(())
    }

    fn vmread(&self, field: u32) -> Result<u64, VmxError> {
        let current = self.current.ok_or(VmxError::VmFailInvalid)?;
        let fields = &self.fields[&current];
        if is_64_bits(field) {
            let value = fields.get(&(field & !1)).copied().unwrap_or(0);
            if field & 1 == 0 {
                Ok(value)
            } else {
                Ok(value >> 32)
            }
        } else {
            Ok(fields.get(&field).copied().unwrap_or(0))
        }
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        self.msr(msr)
    }
}

pub fn core(id: usize, vmx: EmulatedVmx) -> PhysicalCore<EmulatedVmx> {
    // SAFETY: the emulated instructions do not touch the hardware.
    unsafe { PhysicalCore::new(id, vmx) }
}

/// A host state that passes the consistency checks against the emulated MSRs.
pub fn host_state() -> HostState {
    HostState {
        es: 0x10,
        cs: 0x08,
        ss: 0x10,
        ds: 0x10,
        fs: 0x10,
        gs: 0x10,
        tr: 0x28,
        cr0: 0x8005_0033,
        cr3: 0x0010_0000,
        cr4: 0x26a0,
        fs_base: 0,
        gs_base: 0xffff_8000_0000_1000,
        tr_base: 0xffff_8000_0000_2000,
        gdtr_base: 0xffff_8000_0000_3000,
        idtr_base: 0xffff_8000_0000_4000,
        sysenter_cs: 0x08,
        sysenter_esp: 0,
        sysenter_eip: 0,
        pat: 0x0007_0406_0007_0406,
        efer: 0xd01,
        perf_global_ctrl: 0,
    }
}

// ————————————————————————————— Test Memory —————————————————————————————— //

/// Heap memory standing for the physical range `[MEMORY_START, MEMORY_START + size)`.
///
/// The memory is filled with garbage, so that zeroing can be observed.
pub struct TestMemory {
    buffer: *mut u8,
    layout: Layout,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let buffer = unsafe { alloc_zeroed(layout) };
        assert!(!buffer.is_null());
        unsafe { core::ptr::write_bytes(buffer, 0xAA, size) };
        TestMemory { buffer, layout }
    }

    pub fn end(&self) -> usize {
        MEMORY_START + self.layout.size()
    }

    pub fn offset(&self) -> HostVirtAddr {
        HostVirtAddr::new(self.buffer as usize - MEMORY_START)
    }

    /// An allocator over the physical range `[start, end)`.
    pub fn allocator(&self, start: usize, end: usize) -> RangeFrameAllocator {
        assert!(MEMORY_START <= start && end <= self.end());
        unsafe {
            RangeFrameAllocator::new(HostPhysAddr::new(start), HostPhysAddr::new(end), self.offset())
        }
    }

    /// An allocator over the whole memory.
    pub fn range_allocator(&self) -> RangeFrameAllocator {
        self.allocator(MEMORY_START, self.end())
    }

    /// An allocator handing out frames below `split` and ranges above.
    pub fn split_allocator(&self, split: usize) -> SplitAllocator {
        SplitAllocator {
            frames: self.allocator(MEMORY_START, split),
            ranges: self.allocator(split, self.end()),
        }
    }

    /// Returns true if the bytes of `[virt, virt + size)` are all zero.
    pub fn is_zeroed(&self, virt: HostVirtAddr, size: usize) -> bool {
        let slice = unsafe { core::slice::from_raw_parts(virt.as_usize() as *const u8, size) };
        slice.iter().all(|byte| *byte == 0)
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.buffer, self.layout) };
    }
}

/// Frames and ranges coming from two distinct pools.
pub struct SplitAllocator {
    pub frames: RangeFrameAllocator,
    pub ranges: RangeFrameAllocator,
}

unsafe impl FrameAllocator for SplitAllocator {
    fn allocate_frame(&self) -> Option<Frame> {
        self.frames.allocate_frame()
    }

    fn free_frame(&self, frame: Frame) -> Result<(), ()> {
        self.frames.free_frame(frame)
    }

    fn get_boundaries(&self) -> (usize, usize) {
        (
            self.frames.get_boundaries().0,
            self.ranges.get_boundaries().1,
        )
    }

    fn get_physical_offset(&self) -> HostVirtAddr {
        self.frames.get_physical_offset()
    }
}

unsafe impl RangeAllocator for SplitAllocator {
    fn allocate_range(&self, size: usize) -> Option<PhysRange> {
        self.ranges.allocate_range(size)
    }

    fn free_range(&self, range: PhysRange) -> Result<(), ()> {
        self.ranges.free_range(range)
    }
}

/// Hands out a frame that is not page-aligned. Nothing is ever dereferenced.
pub struct MisalignedAllocator {
    pub frees: Cell<usize>,
}

unsafe impl FrameAllocator for MisalignedAllocator {
    fn allocate_frame(&self) -> Option<Frame> {
        Some(unsafe { Frame::new(HostPhysAddr::new(0x1800), HostVirtAddr::new(0x1800)) })
    }

    fn free_frame(&self, _frame: Frame) -> Result<(), ()> {
        self.frees.set(self.frees.get() + 1);
        Ok(())
    }

    fn get_boundaries(&self) -> (usize, usize) {
        (0x1000, 0x2000)
    }

    fn get_physical_offset(&self) -> HostVirtAddr {
        HostVirtAddr::new(0)
    }
}

unsafe impl RangeAllocator for MisalignedAllocator {
    fn allocate_range(&self, _size: usize) -> Option<PhysRange> {
        None
    }
}
