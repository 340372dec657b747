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

use crate::PAGE_SIZE;
use crate::addr::{DeviceAddr, VirtAddr};
use crate::pool::AllocError;

/// A physically contiguous run of pages the device can reach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaRegion {
    /// CPU address of the first byte.
    pub virt: VirtAddr,
    /// Device address of the first byte.
    pub device: DeviceAddr,
    /// Number of [`PAGE_SIZE`] pages.
    pub pages: usize,
}

impl DmaRegion {
    pub const fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// Number of pages needed to hold `bytes`.
    pub const fn pages_for(bytes: usize) -> usize {
        bytes.div_ceil(PAGE_SIZE)
    }
}

/// Page allocator for ring and bounce memory.
///
/// Implemented by the platform; regions must be page aligned and stay valid
/// until handed back to [`free_pages`](Self::free_pages).
pub trait DmaAllocator {
    fn alloc_pages(&self, pages: usize) -> Result<DmaRegion, AllocError>;

    fn free_pages(&self, region: DmaRegion);
}

impl<T: DmaAllocator + ?Sized> DmaAllocator for &T {
    fn alloc_pages(&self, pages: usize) -> Result<DmaRegion, AllocError> {
        (**self).alloc_pages(pages)
    }

    fn free_pages(&self, region: DmaRegion) {
        (**self).free_pages(region)
    }
}

impl<T: DmaAllocator + ?Sized> DmaAllocator for alloc::rc::Rc<T> {
    fn alloc_pages(&self, pages: usize) -> Result<DmaRegion, AllocError> {
        (**self).alloc_pages(pages)
    }

    fn free_pages(&self, region: DmaRegion) {
        (**self).free_pages(region)
    }
}

impl<T: DmaAllocator + ?Sized> DmaAllocator for alloc::sync::Arc<T> {
    fn alloc_pages(&self, pages: usize) -> Result<DmaRegion, AllocError> {
        (**self).alloc_pages(pages)
    }

    fn free_pages(&self, region: DmaRegion) {
        (**self).free_pages(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(DmaRegion::pages_for(0), 0);
        assert_eq!(DmaRegion::pages_for(1), 1);
        assert_eq!(DmaRegion::pages_for(PAGE_SIZE), 1);
        assert_eq!(DmaRegion::pages_for(PAGE_SIZE + 1), 2);
    }
}
