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

//! Driver-private Descriptor State
//!
//! The [`ShadowTable`] holds the authoritative copy of every descriptor. The
//! shared descriptor table is only ever written from it, never read back, so
//! the driver's view cannot be corrupted by the device.
//!
//! Free slots form a singly linked list through the entries' `next` fields,
//! starting at `free_head`. Allocating a chain of `n` slots takes the first
//! `n` nodes of that list as they are, so the chain links are already in
//! place; releasing splices the whole chain back in front of the list.
//!
//! ```text
//! free_head ─> 3 ─> 4 ─> 5 ─> 6 ─> ...
//!
//! allocate_chain(2) = [3, 4]        free_head ─> 5 ─> 6 ─> ...
//! release_chain(3)                  free_head ─> 3 ─> 4 ─> 5 ─> 6 ─> ...
//! ```

use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::addr::{DeviceAddr, VirtAddr};
use crate::bounce::BounceRegion;
use crate::desc::{DescFlags, Descriptor};

/// A descriptor slot number known to be inside the table.
///
/// Only [`ShadowTable`] creates these, so holding one means the bounds check
/// has already been done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescIndex(u16);

impl DescIndex {
    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    #[inline]
    fn slot(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for DescIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slots of one chain in link order.
pub type ChainSlots = SmallVec<[DescIndex; 8]>;

/// Driver copy of one descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShadowDesc {
    /// Address handed to the device (scratch address when bounced).
    pub addr: DeviceAddr,
    /// The caller's buffer.
    pub buf: VirtAddr,
    pub len: u32,
    pub flags: DescFlags,
    pub next: u16,
    /// Set only on the first slot of a submitted chain.
    pub chain_head: bool,
    pub bounce: Option<BounceRegion>,
}

impl ShadowDesc {
    /// The shared-table form of this entry.
    pub fn to_wire(&self) -> Descriptor {
        Descriptor::new(self.addr.as_u64(), self.len, self.flags, self.next)
    }
}

#[derive(Debug)]
pub struct ShadowTable {
    entries: Vec<ShadowDesc>,
    free_head: u16,
    num_free: u16,
}

impl ShadowTable {
    /// A table of `depth` free slots linked `0 -> 1 -> ... -> depth - 1`.
    pub fn new(depth: u16) -> Self {
        let entries = (0..depth)
            .map(|i| ShadowDesc {
                next: i.wrapping_add(1),
                ..Default::default()
            })
            .collect();

        Self {
            entries,
            free_head: 0,
            num_free: depth,
        }
    }

    /// Bounds-check a raw slot number, e.g. a used ring id.
    #[inline]
    pub fn index(&self, raw: u32) -> Option<DescIndex> {
        ((raw as usize) < self.entries.len()).then_some(DescIndex(raw as u16))
    }

    pub fn depth(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    pub fn free_head(&self) -> u16 {
        self.free_head
    }

    #[inline]
    pub fn get(&self, idx: DescIndex) -> &ShadowDesc {
        &self.entries[idx.slot()]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: DescIndex) -> &mut ShadowDesc {
        &mut self.entries[idx.slot()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (DescIndex, &ShadowDesc)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (DescIndex(i as u16), e))
    }

    /// Reserve `n` slots from the front of the free list.
    ///
    /// The returned slots are already linked through `next` in order. Returns
    /// None without touching the list when fewer than `n` slots are free.
    pub fn allocate_chain(&mut self, n: usize) -> Option<ChainSlots> {
        if n == 0 || n > self.num_free as usize {
            return None;
        }

        let mut slots = ChainSlots::with_capacity(n);
        let mut cur = self.free_head;
        for _ in 0..n {
            slots.push(DescIndex(cur));
            cur = self.entries[cur as usize].next;
        }

        self.free_head = cur;
        self.num_free -= n as u16;
        Some(slots)
    }

    /// Return the chain starting at `head` to the free list.
    ///
    /// `f` sees every slot in chain order before it is freed. The whole chain
    /// is released even if `f` fails for some slots; the first failure is
    /// returned. On success returns the number of slots released.
    pub fn release_chain<E>(
        &mut self,
        head: DescIndex,
        mut f: impl FnMut(DescIndex, &mut ShadowDesc) -> Result<(), E>,
    ) -> Result<usize, E> {
        let depth = self.entries.len();
        let mut first_err = None;
        let mut idx = head;
        let mut count = 1usize;

        loop {
            let entry = &mut self.entries[idx.slot()];
            if let Err(e) = f(idx, entry) {
                first_err.get_or_insert(e);
            }
            if !entry.flags.contains(DescFlags::NEXT) {
                break;
            }
            debug_assert!(count < depth, "chain longer than the table");
            idx = DescIndex(entry.next);
            count += 1;
        }

        self.entries[idx.slot()].next = self.free_head;
        self.free_head = head.get();
        self.num_free += count as u16;

        match first_err {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Slots on the free list, in list order.
    #[cfg(test)]
    pub(crate) fn free_slots(&self) -> Vec<u16> {
        let mut out = Vec::with_capacity(self.num_free as usize);
        let mut cur = self.free_head;
        for _ in 0..self.num_free {
            out.push(cur);
            cur = self.entries[cur as usize].next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use core::convert::Infallible;

    use super::*;

    fn link(table: &mut ShadowTable, slots: &[DescIndex]) {
        for (i, &s) in slots.iter().enumerate() {
            let e = table.get_mut(s);
            e.flags = if i + 1 < slots.len() {
                DescFlags::NEXT
            } else {
                DescFlags::empty()
            };
        }
        table.get_mut(slots[0]).chain_head = true;
    }

    fn release(table: &mut ShadowTable, head: DescIndex) -> usize {
        table
            .release_chain(head, |_, e| {
                e.chain_head = false;
                Ok::<_, Infallible>(())
            })
            .unwrap()
    }

    #[test]
    fn fresh_table_links_in_order() {
        let t = ShadowTable::new(4);
        assert_eq!(t.num_free(), 4);
        assert_eq!(t.free_slots(), [0, 1, 2, 3]);
    }

    #[test]
    fn index_is_bounds_checked() {
        let t = ShadowTable::new(8);
        assert_eq!(t.index(7).map(DescIndex::get), Some(7));
        assert!(t.index(8).is_none());
        assert!(t.index(u32::MAX).is_none());
    }

    #[test]
    fn allocate_takes_front_of_list() {
        let mut t = ShadowTable::new(8);
        let chain = t.allocate_chain(3).unwrap();
        assert_eq!(chain.iter().map(|d| d.get()).collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(t.num_free(), 5);
        assert_eq!(t.free_head(), 3);
    }

    #[test]
    fn allocate_fails_without_side_effects() {
        let mut t = ShadowTable::new(2);
        assert!(t.allocate_chain(3).is_none());
        assert!(t.allocate_chain(0).is_none());
        assert_eq!(t.free_slots(), [0, 1]);
    }

    #[test]
    fn release_splices_chain_in_front() {
        let mut t = ShadowTable::new(8);
        let a = t.allocate_chain(2).unwrap();
        let b = t.allocate_chain(3).unwrap();
        link(&mut t, &a);
        link(&mut t, &b);

        assert_eq!(release(&mut t, a[0]), 2);
        assert_eq!(t.free_slots(), [0, 1, 5, 6, 7]);

        // reuse the released slots out of order
        let c = t.allocate_chain(3).unwrap();
        assert_eq!(c.iter().map(|d| d.get()).collect::<Vec<_>>(), [0, 1, 5]);
        link(&mut t, &c);
        release(&mut t, b[0]);
        release(&mut t, c[0]);
        assert_eq!(t.num_free(), 8);

        let mut all = t.free_slots();
        all.sort_unstable();
        assert_eq!(all, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn release_visits_every_slot_and_reports_first_error() {
        let mut t = ShadowTable::new(4);
        let chain = t.allocate_chain(3).unwrap();
        link(&mut t, &chain);

        let mut seen = Vec::new();
        let res = t.release_chain(chain[0], |idx, _| {
            seen.push(idx.get());
            if idx.get() == 0 { Ok(()) } else { Err(idx.get()) }
        });

        assert_eq!(res, Err(1));
        assert_eq!(seen, [0, 1, 2]);
        assert_eq!(t.num_free(), 4);
    }

    #[test]
    fn to_wire_copies_device_view() {
        let e = ShadowDesc {
            addr: DeviceAddr::new(0x8000_1000),
            buf: VirtAddr::new(0x1000),
            len: 64,
            flags: DescFlags::WRITE,
            next: 3,
            chain_head: true,
            bounce: None,
        };
        let d = e.to_wire();
        assert_eq!(d.addr, 0x8000_1000);
        assert_eq!(d.len, 64);
        assert!(d.is_writeable());
        assert_eq!(d.next, 3);
    }
}
