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

//! In-crate doubles for shared memory, the page allocator, the notifier and
//! the device side of a ring.

use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::PAGE_SIZE;
use crate::access::MemOps;
use crate::addr::{AddressTranslate, DeviceAddr, OffsetMap, VirtAddr};
use crate::desc::{DescTable, Descriptor};
use crate::dma::{DmaAllocator, DmaRegion};
use crate::layout::VringLayout;
use crate::pool::AllocError;
use crate::queue::Notifier;
use crate::ring::{AvailFlags, AvailRing, UsedElem, UsedFlags, UsedRing};

/// Where test memory pretends to live in the CPU address space.
const TEST_BASE: u64 = 0x4000_0000;
/// Device addresses are CPU addresses plus this.
const DEVICE_OFFSET: u64 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds {
    pub addr: VirtAddr,
    pub len: usize,
}

/// Heap-backed stand-in for shared memory.
///
/// Accesses outside the buffer fail instead of panicking so out-of-range
/// addresses surface as [`VirtqError::MemError`](crate::VirtqError::MemError).
#[derive(Debug)]
pub struct TestMem {
    bytes: RefCell<Vec<u8>>,
    map: OffsetMap,
    fail_writes: Cell<bool>,
    fail_reads: Cell<bool>,
}

impl TestMem {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: RefCell::new(vec![0u8; size]),
            map: OffsetMap::new(DEVICE_OFFSET),
            fail_writes: Cell::new(false),
            fail_reads: Cell::new(false),
        }
    }

    /// CPU address of the first byte; page aligned.
    pub fn base(&self) -> VirtAddr {
        VirtAddr::new(TEST_BASE)
    }

    pub fn size(&self) -> usize {
        self.bytes.borrow().len()
    }

    /// Describe `len` bytes at `offset` as a DMA region.
    pub fn carve(&self, offset: usize, len: usize) -> DmaRegion {
        assert!(offset % PAGE_SIZE == 0 && len % PAGE_SIZE == 0);
        assert!(offset + len <= self.size());
        let virt = self.base().add(offset as u64);
        DmaRegion {
            virt,
            device: self.virt_to_device(virt),
            pages: len / PAGE_SIZE,
        }
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// Make every subsequent read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.set(fail);
    }

    fn range(&self, addr: VirtAddr, len: usize) -> Result<core::ops::Range<usize>, OutOfBounds> {
        let err = OutOfBounds { addr, len };
        let start = addr.offset_from(self.base()).ok_or(err)? as usize;
        let end = start.checked_add(len).ok_or(err)?;
        if end > self.size() {
            return Err(err);
        }
        Ok(start..end)
    }
}

impl AddressTranslate for TestMem {
    fn virt_to_device(&self, addr: VirtAddr) -> DeviceAddr {
        self.map.virt_to_device(addr)
    }

    fn device_to_virt(&self, addr: DeviceAddr) -> VirtAddr {
        self.map.device_to_virt(addr)
    }
}

impl MemOps for TestMem {
    type Error = OutOfBounds;

    fn read(&self, addr: VirtAddr, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let range = self.range(addr, dst.len())?;
        if self.fail_reads.get() {
            return Err(OutOfBounds {
                addr,
                len: dst.len(),
            });
        }
        dst.copy_from_slice(&self.bytes.borrow()[range]);
        Ok(dst.len())
    }

    fn write(&self, addr: VirtAddr, src: &[u8]) -> Result<usize, Self::Error> {
        let range = self.range(addr, src.len())?;
        if self.fail_writes.get() {
            return Err(OutOfBounds {
                addr,
                len: src.len(),
            });
        }
        self.bytes.borrow_mut()[range].copy_from_slice(src);
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

/// First-fit page allocator over a window of a [`TestMem`].
#[derive(Debug)]
pub struct TestDma<M> {
    mem: M,
    base: VirtAddr,
    used: RefCell<Vec<bool>>,
    max_pages: Cell<Option<usize>>,
}

impl<M: AddressTranslate> TestDma<M> {
    /// Hand out pages from `len` bytes starting `offset` bytes into `mem`.
    pub fn new(mem: M, offset: usize, len: usize) -> Self
    where
        M: core::ops::Deref<Target = TestMem>,
    {
        let base = mem.base().add(offset as u64);
        Self {
            mem,
            base,
            used: RefCell::new(vec![false; len / PAGE_SIZE]),
            max_pages: Cell::new(None),
        }
    }

    /// Refuse any request larger than `max` pages.
    pub fn set_max_pages(&self, max: Option<usize>) {
        self.max_pages.set(max);
    }

    pub fn pages_in_use(&self) -> usize {
        self.used.borrow().iter().filter(|u| **u).count()
    }
}

impl<M: AddressTranslate> DmaAllocator for TestDma<M> {
    fn alloc_pages(&self, pages: usize) -> Result<DmaRegion, AllocError> {
        if pages == 0 {
            return Err(AllocError::InvalidArg);
        }
        if self.max_pages.get().is_some_and(|max| pages > max) {
            return Err(AllocError::OutOfMemory);
        }

        let mut used = self.used.borrow_mut();
        let start = (0..used.len().saturating_sub(pages - 1))
            .find(|&s| used[s..s + pages].iter().all(|u| !u))
            .ok_or(AllocError::OutOfMemory)?;
        used[start..start + pages].iter_mut().for_each(|u| *u = true);

        let virt = self.base.add((start * PAGE_SIZE) as u64);
        Ok(DmaRegion {
            virt,
            device: self.mem.virt_to_device(virt),
            pages,
        })
    }

    fn free_pages(&self, region: DmaRegion) {
        let start = (region.virt.as_u64() - self.base.as_u64()) as usize / PAGE_SIZE;
        let mut used = self.used.borrow_mut();
        for page in &mut used[start..start + region.pages] {
            assert!(*page, "double free of page in {region:?}");
            *page = false;
        }
    }
}

/// Counts notifications.
#[derive(Debug, Default)]
pub struct TestNotifier {
    count: Cell<usize>,
    last: Cell<Option<u16>>,
}

impl TestNotifier {
    pub fn count(&self) -> usize {
        self.count.get()
    }

    pub fn last_queue(&self) -> Option<u16> {
        self.last.get()
    }
}

impl Notifier for TestNotifier {
    fn notify(&self, queue_index: u16) {
        self.count.set(self.count.get() + 1);
        self.last.set(Some(queue_index));
    }
}

/// Minimal device: reads what the driver published and completes chains.
pub struct TestDevice<M> {
    mem: M,
    desc: DescTable,
    avail: AvailRing,
    used: UsedRing,
    depth: u16,
    used_idx: Cell<u16>,
}

impl<M: MemOps> TestDevice<M> {
    pub fn new(mem: M, base: VirtAddr, layout: VringLayout) -> Self {
        let (desc, avail, used) = layout.place(base).unwrap();
        Self {
            mem,
            desc,
            avail,
            used,
            depth: layout.depth(),
            used_idx: Cell::new(0),
        }
    }

    pub fn avail_flags(&self) -> AvailFlags {
        self.avail.flags(&self.mem).unwrap()
    }

    pub fn avail_idx(&self) -> u16 {
        self.avail.idx(&self.mem).unwrap()
    }

    pub fn avail_slot(&self, slot: u16) -> u16 {
        self.avail.read_slot(&self.mem, slot).unwrap()
    }

    pub fn used_event(&self) -> u16 {
        self.avail.used_event(&self.mem).unwrap()
    }

    pub fn read_desc(&self, slot: u16) -> Descriptor {
        Descriptor::read_from(&self.mem, self.desc.raw_addr(slot).unwrap()).unwrap()
    }

    /// Follow NEXT links from `head`.
    pub fn walk_chain(&self, head: u16) -> Vec<Descriptor> {
        let mut out = Vec::new();
        let mut slot = head;
        loop {
            let d = self.read_desc(slot);
            out.push(d);
            if !d.is_next() {
                return out;
            }
            assert!(out.len() <= self.depth as usize, "chain loops");
            slot = d.next;
        }
    }

    pub fn read_device(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let virt = self.mem.device_to_virt(DeviceAddr::new(addr));
        self.mem.read(virt, &mut buf).unwrap();
        buf
    }

    pub fn write_device(&self, addr: u64, data: &[u8]) {
        let virt = self.mem.device_to_virt(DeviceAddr::new(addr));
        self.mem.write(virt, data).unwrap();
    }

    /// Publish one used entry, valid or not.
    pub fn complete(&self, id: u32, len: u32) {
        let idx = self.used_idx.get();
        self.used
            .write_elem(&self.mem, idx & (self.depth - 1), UsedElem { id, len })
            .unwrap();
        let idx = idx.wrapping_add(1);
        self.used.publish_idx(&self.mem, idx).unwrap();
        self.used_idx.set(idx);
    }

    pub fn set_used_flags(&self, flags: UsedFlags) {
        self.used.set_flags(&self.mem, flags).unwrap();
    }

    pub fn set_avail_event(&self, idx: u16) {
        self.used.set_avail_event(&self.mem, idx).unwrap();
    }
}
