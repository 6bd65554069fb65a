//! Address representation
use core::ops::{Add, Sub};

/// A macro for implementing addresses types.
///
/// An address is just a wrapper around an `usize`, with alignment helpers. Physical and virtual
/// host addresses are distinct types so that a VMCS field expecting a physical pointer can not be
/// fed a virtual one by mistake.
macro_rules! addr_impl {
    ($name:ident) => {
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Creates an address that points to `0`.
            #[inline]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Returns true if the address is a multiple of `align`.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "`align` must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns address downwards.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "`align` must be a power of two");
                Self::new(self.0 & !(align - 1))
            }

            /// Aligns address upwards, returns `None` on overflow.
            #[inline]
            pub const fn align_up(self, align: usize) -> Option<Self> {
                assert!(align.is_power_of_two(), "`align` must be a power of two");
                let align_mask = align - 1;
                if self.0 & align_mask == 0 {
                    return Some(self);
                }
                match (self.0 | align_mask).checked_add(1) {
                    Some(aligned) => Some(Self::new(aligned)),
                    None => None,
                }
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, other: usize) -> Self {
                Self::new(self.0 + other)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, other: usize) -> Self {
                Self::new(self.0 - other)
            }
        }
    };
}

addr_impl!(HostPhysAddr);
addr_impl!(HostVirtAddr);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alignment() {
        let addr = HostPhysAddr::new(0x1234);
        assert!(!addr.is_aligned(0x1000));
        assert_eq!(addr.align_down(0x1000), HostPhysAddr::new(0x1000));
        assert_eq!(addr.align_up(0x1000), Some(HostPhysAddr::new(0x2000)));
        assert_eq!(
            HostPhysAddr::new(0x2000).align_up(0x1000),
            Some(HostPhysAddr::new(0x2000))
        );
        assert_eq!(HostVirtAddr::new(usize::MAX).align_up(0x10), None);
        assert!(HostVirtAddr::new(0x10).is_aligned(16));
    }
}
