//! Memory Management Unit
//!
//! Physical memory allocation interfaces shared by the VMX layer and its callers.

#![cfg_attr(not(test), no_std)]
pub mod frame_allocator;

pub use frame_allocator::{FrameAllocator, PhysRange, RangeAllocator, RangeFrameAllocator};
