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

use std::sync::{Arc, Mutex};

use vring::{
    AddressTranslate, AllocError, DeviceAddr, DmaAllocator, DmaRegion, MemOps, OffsetMap, PAGE_SIZE,
    VirtAddr,
};

/// CPU address of the first byte of every [`TestMemory`].
pub const MEMORY_BASE: u64 = 0x1000_0000;
/// Device addresses are CPU addresses plus this.
pub const DEVICE_OFFSET: u64 = 0x2_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds {
    pub addr: VirtAddr,
    pub len: usize,
}

/// Guest-memory stand-in shared between a driver and a simulated device.
///
/// The lock orders every access, so the release/acquire points only need to
/// go through it like any other access.
#[derive(Debug)]
pub struct TestMemory {
    bytes: Mutex<Vec<u8>>,
    map: OffsetMap,
}

impl TestMemory {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0u8; size]),
            map: OffsetMap::new(DEVICE_OFFSET),
        })
    }

    pub fn base(&self) -> VirtAddr {
        VirtAddr::new(MEMORY_BASE)
    }

    pub fn size(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    /// CPU address `offset` bytes into the memory.
    pub fn at(&self, offset: usize) -> VirtAddr {
        self.base().add(offset as u64)
    }

    /// Describe `pages` pages starting `offset` bytes in as a DMA region.
    pub fn region(&self, offset: usize, pages: usize) -> DmaRegion {
        let virt = self.at(offset);
        DmaRegion {
            virt,
            device: self.virt_to_device(virt),
            pages,
        }
    }

    pub fn read_bytes(&self, addr: VirtAddr, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(addr, &mut out).unwrap();
        out
    }

    pub fn write_bytes(&self, addr: VirtAddr, data: &[u8]) {
        self.write(addr, data).unwrap();
    }

    fn range(&self, addr: VirtAddr, len: usize, size: usize) -> Result<std::ops::Range<usize>, OutOfBounds> {
        let err = OutOfBounds { addr, len };
        let start = addr.offset_from(self.base()).ok_or(err)? as usize;
        let end = start.checked_add(len).ok_or(err)?;
        (end <= size).then_some(start..end).ok_or(err)
    }
}

impl AddressTranslate for TestMemory {
    fn virt_to_device(&self, addr: VirtAddr) -> DeviceAddr {
        self.map.virt_to_device(addr)
    }

    fn device_to_virt(&self, addr: DeviceAddr) -> VirtAddr {
        self.map.device_to_virt(addr)
    }
}

impl MemOps for TestMemory {
    type Error = OutOfBounds;

    fn read(&self, addr: VirtAddr, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let bytes = self.bytes.lock().unwrap();
        let range = self.range(addr, dst.len(), bytes.len())?;
        dst.copy_from_slice(&bytes[range]);
        Ok(dst.len())
    }

    fn write(&self, addr: VirtAddr, src: &[u8]) -> Result<usize, Self::Error> {
        let mut bytes = self.bytes.lock().unwrap();
        let range = self.range(addr, src.len(), bytes.len())?;
        bytes[range].copy_from_slice(src);
        Ok(src.len())
    }

    fn load_acquire(&self, addr: VirtAddr) -> Result<u16, Self::Error> {
        let mut raw = [0u8; 2];
        self.read(addr, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    fn store_release(&self, addr: VirtAddr, val: u16) -> Result<(), Self::Error> {
        self.write(addr, &val.to_le_bytes())?;
        Ok(())
    }
}

#[derive(Debug)]
struct PageState {
    used: Vec<bool>,
    max_pages: Option<usize>,
    allocs: usize,
}

/// First-fit page allocator over a window of a [`TestMemory`].
#[derive(Debug)]
pub struct PageAllocator {
    mem: Arc<TestMemory>,
    first: usize,
    state: Mutex<PageState>,
}

impl PageAllocator {
    /// Hand out `pages` pages starting `offset` bytes into `mem`.
    pub fn new(mem: Arc<TestMemory>, offset: usize, pages: usize) -> Self {
        assert!(offset % PAGE_SIZE == 0);
        assert!(offset + pages * PAGE_SIZE <= mem.size());
        Self {
            mem,
            first: offset / PAGE_SIZE,
            state: Mutex::new(PageState {
                used: vec![false; pages],
                max_pages: None,
                allocs: 0,
            }),
        }
    }

    /// Refuse requests larger than `max` pages.
    pub fn set_max_pages(&self, max: Option<usize>) {
        self.state.lock().unwrap().max_pages = max;
    }

    pub fn pages_in_use(&self) -> usize {
        self.state.lock().unwrap().used.iter().filter(|u| **u).count()
    }

    /// Number of allocation attempts so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().allocs
    }
}

impl DmaAllocator for PageAllocator {
    fn alloc_pages(&self, pages: usize) -> Result<DmaRegion, AllocError> {
        let mut state = self.state.lock().unwrap();
        state.allocs += 1;

        if pages == 0 {
            return Err(AllocError::InvalidArg);
        }
        if state.max_pages.is_some_and(|max| pages > max) {
            return Err(AllocError::OutOfMemory);
        }

        let total = state.used.len();
        let start = (0..(total + 1).saturating_sub(pages))
            .find(|&s| state.used[s..s + pages].iter().all(|u| !u))
            .ok_or(AllocError::OutOfMemory)?;
        state.used[start..start + pages].fill(true);

        Ok(self.mem.region((self.first + start) * PAGE_SIZE, pages))
    }

    fn free_pages(&self, region: DmaRegion) {
        let page = (region.virt.offset_from(self.mem.base()).unwrap() as usize) / PAGE_SIZE;
        let start = page - self.first;
        let mut state = self.state.lock().unwrap();
        for used in &mut state.used[start..start + region.pages] {
            assert!(*used, "page freed twice: {region:?}");
            *used = false;
        }
    }
}
