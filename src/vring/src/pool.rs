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
//! Bitmap slab allocator for bounce scratch space.
//!
//! - [`Slab`] hands out runs of fixed `N`-byte slots from one region, tracked
//!   in a flat `FixedBitSet`.
//! - [`BufferPool`] splits one DMA region into a small-slot slab (default 256
//!   bytes) for headers and status bytes, and a page-slot slab for payloads.
//!
//! Search is first-fit from the lowest slot, using `fixedbitset`'s word-wise
//! zero scan. The most recently freed run is remembered and handed out again
//! first, so a submit/complete loop keeps reusing the same scratch.
//!
//! Requests of at most `L` bytes try the lower slab first and fall back to the
//! upper one when it is full; larger requests go straight to the upper slab.

use atomic_refcell::AtomicRefCell;
use fixedbitset::FixedBitSet;
use thiserror::Error;

use crate::addr::VirtAddr;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("region base {0} is not slot aligned")]
    InvalidAlign(VirtAddr),
    #[error("invalid free of {1} bytes at {0}")]
    InvalidFree(VirtAddr, usize),
    #[error("invalid argument")]
    InvalidArg,
    #[error("empty region")]
    EmptyRegion,
    #[error("out of memory")]
    OutOfMemory,
    #[error("address overflow")]
    Overflow,
}

/// A run of slots handed out by a [`Slab`] or [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// CPU address of the first byte
    pub addr: VirtAddr,
    /// Length in bytes, rounded up to the slot size
    pub len: usize,
}

impl Allocation {
    fn end(&self) -> u64 {
        self.addr.as_u64() + self.len as u64
    }

    fn overlaps(&self, other: &Allocation) -> bool {
        self.addr.as_u64() < other.end() && other.addr.as_u64() < self.end()
    }
}

#[derive(Debug, Clone)]
pub struct Slab<const N: usize> {
    base: VirtAddr,
    /// One bit per slot, set while allocated.
    used: FixedBitSet,
    /// Most recently freed run.
    last_free: Option<Allocation>,
}

impl<const N: usize> Slab<N> {
    /// Manage `region_len` bytes at `base`. The tail that does not fill a
    /// whole slot is ignored.
    pub fn new(base: VirtAddr, region_len: usize) -> Result<Self, AllocError> {
        if !base.is_aligned(N as u64) {
            return Err(AllocError::InvalidAlign(base));
        }

        let slots = region_len / N;
        if slots == 0 {
            return Err(AllocError::EmptyRegion);
        }

        Ok(Self {
            base,
            used: FixedBitSet::with_capacity(slots),
            last_free: None,
        })
    }

    #[inline]
    fn addr_of(&self, slot: usize) -> Option<VirtAddr> {
        self.base.checked_add((slot as u64).checked_mul(N as u64)?)
    }

    /// Slot index of `alloc`, if it is a well-formed run inside this slab.
    fn slots_of(&self, alloc: Allocation) -> Option<core::ops::Range<usize>> {
        if alloc.len == 0 || !alloc.len.is_multiple_of(N) {
            return None;
        }
        let off = alloc.addr.offset_from(self.base)? as usize;
        if !off.is_multiple_of(N) {
            return None;
        }
        let start = off / N;
        let end = start + alloc.len / N;
        (end <= self.used.len()).then_some(start..end)
    }

    fn find_run(&mut self, count: usize) -> Option<usize> {
        if let Some(run) = self.last_free
            && run.len >= count * N
        {
            self.last_free = None;
            return self.slots_of(run).map(|r| r.start);
        }

        let total = self.used.len();
        self.used
            .zeroes()
            .find(|&start| start + count <= total && self.used.count_zeroes(start..start + count) == count)
    }

    /// Reserve at least `len` bytes of consecutive slots.
    pub fn alloc(&mut self, len: usize) -> Result<Allocation, AllocError> {
        if len == 0 {
            return Err(AllocError::InvalidArg);
        }

        let count = len.div_ceil(N);
        if count > self.used.len() {
            return Err(AllocError::OutOfMemory);
        }

        let start = self.find_run(count).ok_or(AllocError::OutOfMemory)?;
        let addr = self.addr_of(start).ok_or(AllocError::Overflow)?;
        self.used.insert_range(start..start + count);

        let alloc = Allocation {
            addr,
            len: count * N,
        };
        if self.last_free.is_some_and(|run| run.overlaps(&alloc)) {
            self.last_free = None;
        }
        Ok(alloc)
    }

    /// Return a run obtained from [`alloc`](Self::alloc).
    ///
    /// Double frees and runs not owned by this slab are rejected.
    pub fn dealloc(&mut self, alloc: Allocation) -> Result<(), AllocError> {
        let range = self
            .slots_of(alloc)
            .ok_or(AllocError::InvalidFree(alloc.addr, alloc.len))?;

        if !self.used.contains_all_in_range(range.clone()) {
            return Err(AllocError::InvalidFree(alloc.addr, alloc.len));
        }

        self.used.remove_range(range);
        self.last_free = Some(alloc);
        Ok(())
    }

    pub fn free_bytes(&self) -> usize {
        self.used.count_zeroes(..) * N
    }

    pub fn capacity(&self) -> usize {
        self.used.len() * N
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr.offset_from(self.base)
            .is_some_and(|off| off < self.capacity() as u64)
    }

    pub const fn slot_size() -> usize {
        N
    }
}

#[derive(Debug)]
struct Tiers<const L: usize, const U: usize> {
    lower: Slab<L>,
    upper: Slab<U>,
}

/// Share of the region given to the small-slot slab, as `1 / LOWER_FRACTION`.
const LOWER_FRACTION: usize = 8;

impl<const L: usize, const U: usize> Tiers<L, U> {
    fn new(base: VirtAddr, region_len: usize) -> Result<Self, AllocError> {
        let lower_len = region_len / LOWER_FRACTION;
        let lower_base = align_to(base, L).ok_or(AllocError::Overflow)?;
        let lower = Slab::<L>::new(lower_base, lower_len)?;

        let upper_start = lower_base
            .checked_add(lower.capacity() as u64)
            .ok_or(AllocError::Overflow)?;
        let upper_base = align_to(upper_start, U).ok_or(AllocError::Overflow)?;
        let consumed = upper_base
            .offset_from(base)
            .ok_or(AllocError::Overflow)? as usize;
        let upper = Slab::<U>::new(upper_base, region_len.saturating_sub(consumed))?;

        Ok(Self { lower, upper })
    }

    fn alloc(&mut self, len: usize) -> Result<Allocation, AllocError> {
        if len <= L {
            match self.lower.alloc(len) {
                Err(AllocError::OutOfMemory) => {}
                other => return other,
            }
        }
        self.upper.alloc(len)
    }

    fn dealloc(&mut self, alloc: Allocation) -> Result<(), AllocError> {
        if self.lower.contains(alloc.addr) {
            self.lower.dealloc(alloc)
        } else {
            self.upper.dealloc(alloc)
        }
    }
}

fn align_to(addr: VirtAddr, align: usize) -> Option<VirtAddr> {
    let a = align as u64;
    let rounded = addr.as_u64().checked_add(a - 1)? & !(a - 1);
    Some(VirtAddr::new(rounded))
}

/// Two-tier pool over one region, usable through a shared reference.
#[derive(Debug)]
pub struct BufferPool<const L: usize = 256, const U: usize = 4096> {
    tiers: AtomicRefCell<Tiers<L, U>>,
}

impl<const L: usize, const U: usize> BufferPool<L, U> {
    pub fn new(base: VirtAddr, region_len: usize) -> Result<Self, AllocError> {
        Ok(Self {
            tiers: AtomicRefCell::new(Tiers::new(base, region_len)?),
        })
    }

    /// Allocate at least `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        self.tiers.borrow_mut().alloc(len)
    }

    /// Free a block returned by [`alloc`](Self::alloc).
    pub fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        self.tiers.borrow_mut().dealloc(alloc)
    }

    pub fn free_bytes(&self) -> usize {
        let tiers = self.tiers.borrow();
        tiers.lower.free_bytes() + tiers.upper.free_bytes()
    }

    pub fn capacity(&self) -> usize {
        let tiers = self.tiers.borrow();
        tiers.lower.capacity() + tiers.upper.capacity()
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        let tiers = self.tiers.borrow();
        tiers.lower.contains(addr) || tiers.upper.contains(addr)
    }
}
