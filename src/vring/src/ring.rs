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

//! Split Virtqueue Avail and Used Rings
//!
//! Typed views over the two index rings of a split virtqueue. A view only
//! knows where its ring lives; every access takes the [`MemOps`] backend and
//! is an explicit publish (driver to device) or observe (device to driver)
//! step.
//!
//! ```text
//! avail (driver writes, device reads)
//! ┌───────┬─────┬──────────────────────┬────────────┐
//! │ flags │ idx │ ring[depth]: u16     │ used_event │
//! └───────┴─────┴──────────────────────┴────────────┘
//!
//! used (device writes, driver reads)
//! ┌───────┬─────┬──────────────────────┬─────────────┐
//! │ flags │ idx │ ring[depth]: {id,len}│ avail_event │
//! └───────┴─────┴──────────────────────┴─────────────┘
//! ```
//!
//! The 16-bit header words (`flags`, `idx`, and the event fields) are the
//! synchronisation points with the device and always go through
//! [`MemOps::load_acquire`] / [`MemOps::store_release`]. Ring slots are plain
//! data and are ordered by the index store that publishes them.
//!
//! Both sides' accessors are exposed: the driver engine uses the publish half
//! of [`AvailRing`] and the observe half of [`UsedRing`], while device models
//! in tests use the opposite halves.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::MemOps;
use crate::addr::VirtAddr;

bitflags! {
    /// Flags the driver publishes in `avail.flags`.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AvailFlags: u16 {
        /// The driver does not want an interrupt when buffers are consumed.
        const NO_INTERRUPT = 1 << 0;
    }
}

bitflags! {
    /// Flags the device publishes in `used.flags`.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct UsedFlags: u16 {
        /// The device does not want a notification when buffers are added.
        const NO_NOTIFY = 1 << 0;
    }
}

/// One used ring entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq)]
pub struct UsedElem {
    /// Index of the chain head the device has finished with.
    pub id: u32,
    /// Bytes the device wrote into the chain's writable segments.
    pub len: u32,
}

impl UsedElem {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

const HDR_FLAGS: u64 = 0;
const HDR_IDX: u64 = 2;
const HDR_RING: u64 = 4;

/// The driver-owned avail ring.
#[derive(Clone, Copy, Debug)]
pub struct AvailRing {
    base: VirtAddr,
    depth: u16,
}

impl AvailRing {
    pub fn new(base: VirtAddr, depth: u16) -> Self {
        debug_assert!(base.is_aligned(2));
        Self { base, depth }
    }

    /// Bytes occupied by an avail ring of `depth` entries.
    pub const fn size(depth: usize) -> usize {
        2 * (3 + depth)
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    #[inline]
    fn slot_addr(&self, slot: u16) -> VirtAddr {
        debug_assert!(slot < self.depth);
        self.base.add(HDR_RING + 2 * slot as u64)
    }

    #[inline]
    fn used_event_addr(&self) -> VirtAddr {
        self.base.add(HDR_RING + 2 * self.depth as u64)
    }

    pub fn flags<M: MemOps>(&self, mem: &M) -> Result<AvailFlags, M::Error> {
        let raw = mem.load_acquire(self.base.add(HDR_FLAGS))?;
        Ok(AvailFlags::from_bits_retain(raw))
    }

    pub fn set_flags<M: MemOps>(&self, mem: &M, flags: AvailFlags) -> Result<(), M::Error> {
        mem.store_release(self.base.add(HDR_FLAGS), flags.bits())
    }

    /// Observe the published avail index.
    pub fn idx<M: MemOps>(&self, mem: &M) -> Result<u16, M::Error> {
        mem.load_acquire(self.base.add(HDR_IDX))
    }

    /// Publish a new avail index.
    ///
    /// Release semantics: every descriptor and slot write issued before this
    /// call is visible to the device before the new index is.
    pub fn publish_idx<M: MemOps>(&self, mem: &M, idx: u16) -> Result<(), M::Error> {
        mem.store_release(self.base.add(HDR_IDX), idx)
    }

    /// Write a chain head into a ring slot. `slot` is already masked.
    pub fn write_slot<M: MemOps>(&self, mem: &M, slot: u16, head: u16) -> Result<(), M::Error> {
        mem.write_val(self.slot_addr(slot), head.to_le())
    }

    pub fn read_slot<M: MemOps>(&self, mem: &M, slot: u16) -> Result<u16, M::Error> {
        let raw: u16 = mem.read_val(self.slot_addr(slot))?;
        Ok(u16::from_le(raw))
    }

    pub fn used_event<M: MemOps>(&self, mem: &M) -> Result<u16, M::Error> {
        mem.load_acquire(self.used_event_addr())
    }

    pub fn set_used_event<M: MemOps>(&self, mem: &M, idx: u16) -> Result<(), M::Error> {
        mem.store_release(self.used_event_addr(), idx)
    }
}

/// The device-owned used ring.
#[derive(Clone, Copy, Debug)]
pub struct UsedRing {
    base: VirtAddr,
    depth: u16,
}

impl UsedRing {
    pub fn new(base: VirtAddr, depth: u16) -> Self {
        debug_assert!(base.is_aligned(4));
        Self { base, depth }
    }

    /// Bytes occupied by a used ring of `depth` entries.
    pub const fn size(depth: usize) -> usize {
        2 * 3 + UsedElem::SIZE * depth
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    #[inline]
    fn elem_addr(&self, slot: u16) -> VirtAddr {
        debug_assert!(slot < self.depth);
        self.base.add(HDR_RING + UsedElem::SIZE as u64 * slot as u64)
    }

    #[inline]
    fn avail_event_addr(&self) -> VirtAddr {
        self.base
            .add(HDR_RING + UsedElem::SIZE as u64 * self.depth as u64)
    }

    pub fn flags<M: MemOps>(&self, mem: &M) -> Result<UsedFlags, M::Error> {
        let raw = mem.load_acquire(self.base.add(HDR_FLAGS))?;
        Ok(UsedFlags::from_bits_retain(raw))
    }

    pub fn set_flags<M: MemOps>(&self, mem: &M, flags: UsedFlags) -> Result<(), M::Error> {
        mem.store_release(self.base.add(HDR_FLAGS), flags.bits())
    }

    /// Observe the device's used index.
    ///
    /// Acquire semantics: used entries the device wrote before publishing
    /// this index are visible to reads issued after this call.
    pub fn idx<M: MemOps>(&self, mem: &M) -> Result<u16, M::Error> {
        mem.load_acquire(self.base.add(HDR_IDX))
    }

    pub fn publish_idx<M: MemOps>(&self, mem: &M, idx: u16) -> Result<(), M::Error> {
        mem.store_release(self.base.add(HDR_IDX), idx)
    }

    /// Read the used entry in `slot`. `slot` is already masked.
    pub fn read_elem<M: MemOps>(&self, mem: &M, slot: u16) -> Result<UsedElem, M::Error> {
        let raw: UsedElem = mem.read_val(self.elem_addr(slot))?;
        Ok(UsedElem {
            id: u32::from_le(raw.id),
            len: u32::from_le(raw.len),
        })
    }

    pub fn write_elem<M: MemOps>(&self, mem: &M, slot: u16, elem: UsedElem) -> Result<(), M::Error> {
        let raw = UsedElem {
            id: elem.id.to_le(),
            len: elem.len.to_le(),
        };
        mem.write_val(self.elem_addr(slot), raw)
    }

    pub fn avail_event<M: MemOps>(&self, mem: &M) -> Result<u16, M::Error> {
        mem.load_acquire(self.avail_event_addr())
    }

    pub fn set_avail_event<M: MemOps>(&self, mem: &M, idx: u16) -> Result<(), M::Error> {
        mem.store_release(self.avail_event_addr(), idx)
    }
}

/// Has the index moved past `event_idx` in the step from `old` to `new`?
///
/// All arithmetic is modulo 2^16, so the check stays correct when the
/// indices wrap. Same rule as virtio's `vring_need_event`.
#[inline(always)]
pub fn need_event(event_idx: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event_idx).wrapping_sub(1) < new.wrapping_sub(old)
}
