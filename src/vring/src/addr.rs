/*
Copyright 2026  The vring Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! CPU and Device Address Spaces
//!
//! The driver addresses memory through CPU virtual addresses ([`VirtAddr`]),
//! while the device only understands bus addresses ([`DeviceAddr`]). The two
//! are deliberately separate types: the only way from one to the other is
//! through an [`AddressTranslate`] implementation.

use core::fmt;

use bytemuck::{Pod, Zeroable};

/// An address as seen by the CPU running the driver.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct VirtAddr(u64);

/// An address as seen by the device (bus / guest-physical / IOVA).
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct DeviceAddr(u64);

macro_rules! addr_common {
    ($ty:ident) => {
        impl $ty {
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Offset the address by `off` bytes.
            #[inline]
            pub const fn add(self, off: u64) -> Self {
                Self(self.0 + off)
            }

            #[inline]
            pub const fn checked_add(self, off: u64) -> Option<Self> {
                match self.0.checked_add(off) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            /// Byte distance from `base` to `self`, if `self` is not below `base`.
            #[inline]
            pub const fn offset_from(self, base: Self) -> Option<u64> {
                self.0.checked_sub(base.0)
            }

            #[inline]
            pub const fn is_aligned(self, align: u64) -> bool {
                self.0.is_multiple_of(align)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

addr_common!(VirtAddr);
addr_common!(DeviceAddr);

impl VirtAddr {
    /// Take the address of a CPU pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.addr() as u64)
    }
}

/// Conversion between the driver's and the device's view of memory.
///
/// Implementations decide what "device address" means on a platform: identity
/// on most firmware targets, a fixed offset behind a simple bus window, or an
/// IOMMU lookup.
pub trait AddressTranslate {
    /// Translate a CPU address into the address the device must be given.
    fn virt_to_device(&self, addr: VirtAddr) -> DeviceAddr;

    /// Translate a device address back into a CPU address.
    fn device_to_virt(&self, addr: DeviceAddr) -> VirtAddr;
}

/// Device and CPU share one flat address space.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityMap;

impl AddressTranslate for IdentityMap {
    #[inline]
    fn virt_to_device(&self, addr: VirtAddr) -> DeviceAddr {
        DeviceAddr(addr.0)
    }

    #[inline]
    fn device_to_virt(&self, addr: DeviceAddr) -> VirtAddr {
        VirtAddr(addr.0)
    }
}

/// Device addresses are CPU addresses shifted by a constant bus offset.
#[derive(Clone, Copy, Debug, Default)]
pub struct OffsetMap {
    offset: u64,
}

impl OffsetMap {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl AddressTranslate for OffsetMap {
    #[inline]
    fn virt_to_device(&self, addr: VirtAddr) -> DeviceAddr {
        DeviceAddr(addr.0.wrapping_add(self.offset))
    }

    #[inline]
    fn device_to_virt(&self, addr: DeviceAddr) -> VirtAddr {
        VirtAddr(addr.0.wrapping_sub(self.offset))
    }
}

impl<T: AddressTranslate + ?Sized> AddressTranslate for &T {
    fn virt_to_device(&self, addr: VirtAddr) -> DeviceAddr {
        (**self).virt_to_device(addr)
    }

    fn device_to_virt(&self, addr: DeviceAddr) -> VirtAddr {
        (**self).device_to_virt(addr)
    }
}

impl<T: AddressTranslate + ?Sized> AddressTranslate for alloc::rc::Rc<T> {
    fn virt_to_device(&self, addr: VirtAddr) -> DeviceAddr {
        (**self).virt_to_device(addr)
    }

    fn device_to_virt(&self, addr: DeviceAddr) -> VirtAddr {
        (**self).device_to_virt(addr)
    }
}

impl<T: AddressTranslate + ?Sized> AddressTranslate for alloc::sync::Arc<T> {
    fn virt_to_device(&self, addr: VirtAddr) -> DeviceAddr {
        (**self).virt_to_device(addr)
    }

    fn device_to_virt(&self, addr: DeviceAddr) -> VirtAddr {
        (**self).device_to_virt(addr)
    }
}
