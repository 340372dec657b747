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

//! Split Virtqueue Descriptor Types
//!
//! This module defines the shared descriptor format of the split virtqueue as
//! specified in VIRTIO 1.x section 2.7.5. Each descriptor names one buffer
//! segment of a scatter-gather chain; chains are linked through `next`.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::MemOps;
use crate::addr::VirtAddr;
use crate::shadow::DescIndex;

bitflags! {
    /// Descriptor flags as defined by VIRTIO specification.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        /// This marks a buffer as continuing via the next field.
        const NEXT     = 1 << 0;
        /// This marks a buffer as device write-only (otherwise device read-only).
        const WRITE    = 1 << 1;
        /// This means the buffer contains a list of buffer descriptors (never set by this engine).
        const INDIRECT = 1 << 2;
    }
}

/// One entry of the shared descriptor table, in wire order.
///
/// Multi-byte fields hold native values; [`write_to`](Self::write_to) and
/// [`read_from`](Self::read_from) convert to and from the little-endian
/// layout the device parses.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// Device address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Flags (NEXT, WRITE, INDIRECT).
    pub flags: u16,
    /// Next descriptor index if NEXT is set.
    pub next: u16,
}

const _: () = assert!(core::mem::size_of::<Descriptor>() == 16);
const _: () = assert!(Descriptor::ADDR_OFFSET == 0);
const _: () = assert!(Descriptor::LEN_OFFSET == 8);
const _: () = assert!(Descriptor::FLAGS_OFFSET == 12);
const _: () = assert!(Descriptor::NEXT_OFFSET == 14);

impl Descriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    /// Required alignment of the descriptor table (VIRTIO 1.x 2.7).
    pub const ALIGN: usize = 16;

    pub const ADDR_OFFSET: usize = core::mem::offset_of!(Self, addr);
    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);
    pub const NEXT_OFFSET: usize = core::mem::offset_of!(Self, next);

    pub fn new(addr: u64, len: u32, flags: DescFlags, next: u16) -> Self {
        Self {
            addr,
            len,
            flags: flags.bits(),
            next,
        }
    }

    /// Get flags as a [`DescFlags`] bitfield.
    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    /// Is this descriptor writeable by the device?
    #[inline]
    pub fn is_writeable(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }

    /// Does this descriptor point to a next descriptor in the chain?
    #[inline]
    pub fn is_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    /// Serialise into shared memory at `at`.
    ///
    /// No ordering is implied; the descriptor becomes visible to the device
    /// only through the release store of the avail index that follows.
    pub fn write_to<M: MemOps>(&self, mem: &M, at: VirtAddr) -> Result<(), M::Error> {
        let wire = Self {
            addr: self.addr.to_le(),
            len: self.len.to_le(),
            flags: self.flags.to_le(),
            next: self.next.to_le(),
        };
        mem.write_val(at, wire)
    }

    /// Deserialise from shared memory at `at`.
    pub fn read_from<M: MemOps>(mem: &M, at: VirtAddr) -> Result<Self, M::Error> {
        let wire: Self = mem.read_val(at)?;
        Ok(Self {
            addr: u64::from_le(wire.addr),
            len: u32::from_le(wire.len),
            flags: u16::from_le(wire.flags),
            next: u16::from_le(wire.next),
        })
    }
}

/// The descriptor table in shared memory.
#[derive(Debug, Clone, Copy)]
pub struct DescTable {
    base: VirtAddr,
    len: u16,
}

impl DescTable {
    /// Describe a descriptor table of `len` entries starting at `base`.
    ///
    /// `base` must be aligned to [`Descriptor::ALIGN`]; the caller guarantees the
    /// memory stays valid for the lifetime of the table.
    pub fn new(base: VirtAddr, len: u16) -> Self {
        debug_assert!(base.is_aligned(Descriptor::ALIGN as u64));
        Self { base, len }
    }

    /// Address of the descriptor at `idx`.
    #[inline]
    pub fn desc_addr(&self, idx: DescIndex) -> VirtAddr {
        debug_assert!(idx.get() < self.len);
        self.base.add(idx.get() as u64 * Descriptor::SIZE as u64)
    }

    /// Address of the descriptor at a raw slot number, or None if out of bounds.
    pub fn raw_addr(&self, slot: u16) -> Option<VirtAddr> {
        (slot < self.len).then(|| self.base.add(slot as u64 * Descriptor::SIZE as u64))
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Get number of descriptors in table
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Size of the table in bytes.
    pub const fn size(len: usize) -> usize {
        len * Descriptor::SIZE
    }
}
