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

//! Bounce Buffering
//!
//! Some platforms cannot hand a caller's buffer to the device directly: the
//! buffer may sit outside the device's DMA window, be misaligned for it, or
//! live in memory the IOMMU does not map. For those segments the queue asks a
//! [`BounceBuffers`] manager for a scratch region the device can reach, and
//! the descriptor points at the scratch instead.
//!
//! Data moves at two points only:
//!
//! - [`acquire`](BounceBuffers::acquire) copies outbound bytes into scratch
//!   before the descriptor is published;
//! - [`release`](BounceBuffers::release) copies inbound bytes back to the
//!   caller after the device has completed the chain.
//!
//! [`PoolBounce`] is a ready-made manager that carves scratch space out of one
//! DMA region with a [`BufferPool`].

use log::warn;
use thiserror::Error;

use crate::access::MemOps;
use crate::addr::{DeviceAddr, VirtAddr};
use crate::dma::DmaRegion;
use crate::pool::{AllocError, Allocation, BufferPool};
use crate::sg::Segment;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceError {
    #[error("no bounce scratch space left")]
    OutOfMemory,
    #[error("segment of {0} bytes exceeds the bounce pool")]
    TooLarge(u32),
    #[error("bounce pool error: {0}")]
    Alloc(#[from] AllocError),
    #[error("bounce copy failed")]
    MemError,
}

/// A scratch region standing in for one caller segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BounceRegion {
    /// CPU address of the scratch bytes.
    pub scratch: VirtAddr,
    /// Device address of the scratch bytes; this goes in the descriptor.
    pub device: DeviceAddr,
    /// Bytes reserved for the scratch, at least `orig.len`.
    pub capacity: usize,
    /// The caller segment being bounced.
    pub orig: Segment,
}

/// Scratch-buffer manager consulted by the queue for every segment.
pub trait BounceBuffers {
    /// Platform policy: must this segment go through scratch memory?
    fn should_bounce(&self, seg: &Segment) -> bool;

    /// Reserve scratch for `seg`. Outbound segments are copied in before
    /// this returns.
    fn acquire(&self, seg: &Segment) -> Result<BounceRegion, BounceError>;

    /// Give scratch back after completion, copying inbound bytes to the
    /// caller first. The scratch is returned even when the copy fails.
    fn release(&self, region: BounceRegion) -> Result<(), BounceError>;

    /// Give scratch back without any copy.
    fn discard(&self, region: BounceRegion);
}

/// Never bounces; every segment is handed to the device as is.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBounce;

impl BounceBuffers for NoBounce {
    fn should_bounce(&self, _seg: &Segment) -> bool {
        false
    }

    fn acquire(&self, _seg: &Segment) -> Result<BounceRegion, BounceError> {
        Err(BounceError::OutOfMemory)
    }

    fn release(&self, _region: BounceRegion) -> Result<(), BounceError> {
        Ok(())
    }

    fn discard(&self, _region: BounceRegion) {}
}

/// When [`PoolBounce`] substitutes scratch for a caller buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BouncePolicy {
    /// Bounce every segment.
    Always,
    /// Bounce segments whose address is not a multiple of `align`.
    Unaligned { align: u64 },
    /// Bounce segments whose device address range ends above `limit`,
    /// e.g. a device limited to 32-bit DMA.
    Above { limit: u64 },
}

/// Bounce manager backed by a slab pool over one DMA region.
#[derive(Debug)]
pub struct PoolBounce<M: MemOps> {
    pool: BufferPool,
    mem: M,
    region: DmaRegion,
    policy: BouncePolicy,
}

impl<M: MemOps> PoolBounce<M> {
    /// Manage scratch space in `region`. The region must stay mapped until
    /// handed back by [`into_region`](Self::into_region).
    pub fn new(mem: M, region: DmaRegion, policy: BouncePolicy) -> Result<Self, BounceError> {
        let pool = BufferPool::new(region.virt, region.size())?;
        Ok(Self {
            pool,
            mem,
            region,
            policy,
        })
    }

    pub fn policy(&self) -> BouncePolicy {
        self.policy
    }

    pub fn free_bytes(&self) -> usize {
        self.pool.free_bytes()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Tear down the manager and get the backing region back for freeing.
    pub fn into_region(self) -> DmaRegion {
        self.region
    }

    fn device_addr(&self, scratch: VirtAddr) -> Option<DeviceAddr> {
        let off = scratch.offset_from(self.region.virt)?;
        self.region.device.checked_add(off)
    }

    fn give_back(&self, region: &BounceRegion) -> Result<(), BounceError> {
        self.pool.dealloc(Allocation {
            addr: region.scratch,
            len: region.capacity,
        })?;
        Ok(())
    }
}

impl<M: MemOps> BounceBuffers for PoolBounce<M> {
    fn should_bounce(&self, seg: &Segment) -> bool {
        match self.policy {
            BouncePolicy::Always => true,
            BouncePolicy::Unaligned { align } => !seg.addr.is_aligned(align),
            BouncePolicy::Above { limit } => {
                let start = self.mem.virt_to_device(seg.addr).as_u64();
                start.saturating_add(seg.len as u64) > limit
            }
        }
    }

    fn acquire(&self, seg: &Segment) -> Result<BounceRegion, BounceError> {
        let want = (seg.len as usize).max(1);
        if want > self.pool.capacity() {
            return Err(BounceError::TooLarge(seg.len));
        }

        let alloc = self.pool.alloc(want).map_err(|e| match e {
            AllocError::OutOfMemory => BounceError::OutOfMemory,
            other => BounceError::Alloc(other),
        })?;

        let region = BounceRegion {
            scratch: alloc.addr,
            device: self.device_addr(alloc.addr).ok_or(BounceError::MemError)?,
            capacity: alloc.len,
            orig: *seg,
        };

        if !seg.is_writable()
            && self
                .mem
                .copy(seg.addr, region.scratch, seg.len as usize)
                .is_err()
        {
            self.discard(region);
            return Err(BounceError::MemError);
        }

        Ok(region)
    }

    fn release(&self, region: BounceRegion) -> Result<(), BounceError> {
        let copied = if region.orig.is_writable() {
            self.mem
                .copy(region.scratch, region.orig.addr, region.orig.len as usize)
                .map_err(|_| BounceError::MemError)
        } else {
            Ok(())
        };

        self.give_back(&region)?;
        copied
    }

    fn discard(&self, region: BounceRegion) {
        if let Err(e) = self.give_back(&region) {
            warn!("dropping bounce region at {}: {e}", region.scratch);
        }
    }
}

impl<T: BounceBuffers + ?Sized> BounceBuffers for &T {
    fn should_bounce(&self, seg: &Segment) -> bool {
        (**self).should_bounce(seg)
    }

    fn acquire(&self, seg: &Segment) -> Result<BounceRegion, BounceError> {
        (**self).acquire(seg)
    }

    fn release(&self, region: BounceRegion) -> Result<(), BounceError> {
        (**self).release(region)
    }

    fn discard(&self, region: BounceRegion) {
        (**self).discard(region)
    }
}

impl<T: BounceBuffers + ?Sized> BounceBuffers for alloc::rc::Rc<T> {
    fn should_bounce(&self, seg: &Segment) -> bool {
        (**self).should_bounce(seg)
    }

    fn acquire(&self, seg: &Segment) -> Result<BounceRegion, BounceError> {
        (**self).acquire(seg)
    }

    fn release(&self, region: BounceRegion) -> Result<(), BounceError> {
        (**self).release(region)
    }

    fn discard(&self, region: BounceRegion) {
        (**self).discard(region)
    }
}

impl<T: BounceBuffers + ?Sized> BounceBuffers for alloc::sync::Arc<T> {
    fn should_bounce(&self, seg: &Segment) -> bool {
        (**self).should_bounce(seg)
    }

    fn acquire(&self, seg: &Segment) -> Result<BounceRegion, BounceError> {
        (**self).acquire(seg)
    }

    fn release(&self, region: BounceRegion) -> Result<(), BounceError> {
        (**self).release(region)
    }

    fn discard(&self, region: BounceRegion) {
        (**self).discard(region)
    }
}
