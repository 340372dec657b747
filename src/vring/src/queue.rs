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

//! Split Virtqueue (driver side)
//!
//! [`Virtqueue`] ties the driver-private [`ShadowTable`] to the shared rings
//! of one queue and implements the four driver operations:
//!
//! - **add**: reserve a chain, bounce or translate each segment, publish the
//!   descriptors and the chain head, then release-store `avail.idx`;
//! - **get_completed**: acquire-load `used.idx`, validate the used id against
//!   the shadow table, copy bounced data back and recycle the chain;
//! - **kick**: decide from `used.flags` or `avail_event` whether the device
//!   needs a notification;
//! - **poll**: cheap "anything new?" check against a remembered used index.
//!
//! # Lifecycle
//!
//! ```text
//!   create ──> add* ──> kick ──> get_completed* ──> destroy
//!               ^                     │
//!               └─────────────────────┘
//! ```
//!
//! A queue is driven from a single context; every mutating operation takes
//! `&mut self`. The device runs concurrently and is only synchronised with
//! through the release store of `avail.idx`, the acquire load of `used.idx`
//! and full barriers around the notification fields.
//!
//! A used entry naming a slot that is not an in-flight chain head means the
//! driver and device disagree about the ring. The queue is then marked broken
//! and refuses all further `add` and `get_completed` calls.

use core::fmt;

use alloc::vec::Vec;

use log::{debug, error, warn};
use smallvec::SmallVec;
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::PAGE_SIZE;
use crate::access::MemOps;
use crate::addr::{DeviceAddr, VirtAddr};
use crate::bounce::{BounceBuffers, BounceRegion, NoBounce};
use crate::config::QueueConfig;
use crate::desc::{DescFlags, DescTable, Descriptor};
use crate::dma::{DmaAllocator, DmaRegion};
use crate::error::{Busy, VirtqError};
use crate::layout::VringLayout;
use crate::ring::{AvailFlags, AvailRing, UsedElem, UsedFlags, UsedRing, need_event};
use crate::sg::SgList;
use crate::shadow::{ChainSlots, DescIndex, ShadowTable};

/// Signals the device that a queue has new buffers.
pub trait Notifier {
    fn notify(&self, queue_index: u16);
}

impl<T: Notifier + ?Sized> Notifier for &T {
    fn notify(&self, queue_index: u16) {
        (**self).notify(queue_index)
    }
}

impl<T: Notifier + ?Sized> Notifier for alloc::rc::Rc<T> {
    fn notify(&self, queue_index: u16) {
        (**self).notify(queue_index)
    }
}

impl<T: Notifier + ?Sized> Notifier for alloc::sync::Arc<T> {
    fn notify(&self, queue_index: u16) {
        (**self).notify(queue_index)
    }
}

/// A chain the device has finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Caller address of the chain's first segment.
    pub buf: VirtAddr,
    /// Bytes the device reports having written.
    pub len: u32,
    /// Head slot the chain occupied.
    pub head: DescIndex,
}

type Mapped = SmallVec<[(DeviceAddr, Option<BounceRegion>); 8]>;

/// Driver side of one split virtqueue.
pub struct Virtqueue<M, N, B = NoBounce> {
    index: u16,
    mem: M,
    notifier: N,
    bounce: B,

    /// Pages holding the three rings.
    region: DmaRegion,
    layout: VringLayout,
    desc: DescTable,
    avail: AvailRing,
    used: UsedRing,

    shadow: ShadowTable,
    /// Next avail index to publish.
    avail_idx_shadow: u16,
    /// Last value written to `avail.flags`.
    avail_flags_shadow: AvailFlags,
    /// Next used index to consume.
    last_used_idx: u16,
    /// Chains published since the last kick decision.
    num_added: u16,
    event_idx: bool,
    broken: bool,
}

impl<M, N, B> Virtqueue<M, N, B>
where
    M: MemOps,
    N: Notifier,
    B: BounceBuffers,
{
    /// Allocate, zero and initialise a queue.
    ///
    /// When `alloc` cannot provide the requested ring the depth is halved
    /// until the ring fits in a single page, which is tried last. The
    /// resulting depth is reported by [`depth`](Self::depth).
    ///
    /// # Errors
    ///
    /// - [`VirtqError::Layout`] - depth or alignment is not usable
    /// - [`VirtqError::RingAllocation`] - no allocation succeeded
    /// - [`VirtqError::MemError`] - the ring could not be zeroed
    #[cfg_attr(feature = "tracing", instrument(skip_all, level = "Trace"))]
    pub fn create<A: DmaAllocator>(
        cfg: &QueueConfig,
        mem: M,
        alloc: &A,
        notifier: N,
        bounce: B,
    ) -> Result<Self, VirtqError> {
        let requested = VringLayout::new(cfg.depth(), cfg.align())?;
        let (layout, region) = alloc_ring(requested, alloc)?;

        let placed = layout.place(region.virt).map_err(VirtqError::from);
        let zeroed = placed.and_then(|parts| {
            mem.fill(region.virt, 0, layout.size())
                .map(|_| parts)
                .map_err(|_| VirtqError::MemError)
        });
        let (desc, avail, used) = match zeroed {
            Ok(parts) => parts,
            Err(e) => {
                alloc.free_pages(region);
                return Err(e);
            }
        };

        let mut vq = Self {
            index: cfg.index(),
            mem,
            notifier,
            bounce,
            region,
            layout,
            desc,
            avail,
            used,
            shadow: ShadowTable::new(layout.depth()),
            avail_idx_shadow: 0,
            avail_flags_shadow: AvailFlags::empty(),
            last_used_idx: 0,
            num_added: 0,
            event_idx: cfg.event_idx(),
            broken: false,
        };

        if !cfg.interrupts() {
            vq.avail_flags_shadow |= AvailFlags::NO_INTERRUPT;
            if !vq.event_idx && vq.avail.set_flags(&vq.mem, vq.avail_flags_shadow).is_err() {
                alloc.free_pages(vq.region);
                return Err(VirtqError::MemError);
            }
        }

        debug!(
            "vq{}: created depth {} (requested {}) at {} / {}",
            vq.index,
            layout.depth(),
            cfg.depth(),
            region.virt,
            region.device
        );
        Ok(vq)
    }

    /// Submit a scatter-gather list as one chain.
    ///
    /// The chain is visible to the device when this returns but the device is
    /// not notified; call [`kick`](Self::kick) (or use
    /// [`add_and_kick`](Self::add_and_kick)). Either the whole chain is
    /// published or nothing is.
    ///
    /// # Errors
    ///
    /// - [`VirtqError::Broken`] - an earlier protocol error disabled the queue
    /// - [`VirtqError::InsufficientDescriptors`] - fewer free slots than
    ///   segments; if the list has outbound segments the device has been
    ///   notified so it can drain the ring
    /// - [`VirtqError::BounceAllocation`] - a segment needed scratch space that
    ///   could not be had
    #[cfg_attr(feature = "tracing", instrument(skip_all, level = "Trace"))]
    pub fn add(&mut self, sg: &SgList) -> Result<DescIndex, VirtqError> {
        if self.broken {
            return Err(VirtqError::Broken);
        }

        let needed = sg.len();
        let free = self.shadow.num_free() as usize;
        if free < needed {
            if sg.has_outbound() {
                debug!(
                    "vq{}: ring full ({free} free, {needed} needed), notifying device",
                    self.index
                );
                self.notifier.notify(self.index);
            }
            return Err(VirtqError::InsufficientDescriptors { needed, free });
        }

        let mapped = self.map_segments(sg)?;
        let Some(slots) = self.shadow.allocate_chain(needed) else {
            self.unmap(mapped);
            return Err(VirtqError::InsufficientDescriptors { needed, free });
        };

        let last = needed - 1;
        for (i, (seg, (addr, bounce))) in sg.segments().iter().zip(mapped).enumerate() {
            let entry = self.shadow.get_mut(slots[i]);
            let mut flags = DescFlags::empty();
            flags.set(DescFlags::NEXT, i < last);
            flags.set(DescFlags::WRITE, seg.is_writable());

            entry.addr = addr;
            entry.buf = seg.addr;
            entry.len = seg.len;
            entry.flags = flags;
            entry.chain_head = i == 0;
            entry.bounce = bounce;
        }

        let head = slots[0];
        if let Err(e) = self.publish(&slots) {
            error!("vq{}: publishing chain {head} failed, queue disabled", self.index);
            self.broken = true;
            return Err(e);
        }

        debug!(
            "vq{}: added chain {head} ({needed} segments), avail idx {}",
            self.index, self.avail_idx_shadow
        );

        // The chain is already visible to the device; a failed kick must not
        // turn into an error for it.
        if self.num_added == u16::MAX {
            if let Err(e) = self.kick() {
                warn!("vq{}: forced kick failed ({e}), notifying anyway", self.index);
                self.num_added = 0;
                self.notify();
            }
        }

        Ok(head)
    }

    /// [`add`](Self::add) followed by [`kick`](Self::kick).
    pub fn add_and_kick(&mut self, sg: &SgList) -> Result<DescIndex, VirtqError> {
        let head = self.add(sg)?;
        self.kick()?;
        Ok(head)
    }

    fn map_segments(&self, sg: &SgList) -> Result<Mapped, VirtqError> {
        let mut mapped = Mapped::new();

        for seg in sg.segments() {
            if !self.bounce.should_bounce(seg) {
                mapped.push((self.mem.virt_to_device(seg.addr), None));
                continue;
            }

            match self.bounce.acquire(seg) {
                Ok(region) => mapped.push((region.device, Some(region))),
                Err(e) => {
                    debug!("vq{}: bounce of {} bytes failed: {e}", self.index, seg.len);
                    self.unmap(mapped);
                    return Err(e.into());
                }
            }
        }

        Ok(mapped)
    }

    fn unmap(&self, mapped: Mapped) {
        for region in mapped.into_iter().filter_map(|(_, b)| b) {
            self.bounce.discard(region);
        }
    }

    /// Copy the chain's shadow entries to the shared table and expose its
    /// head through the avail ring.
    fn publish(&mut self, slots: &ChainSlots) -> Result<(), VirtqError> {
        for &slot in slots {
            self.shadow
                .get(slot)
                .to_wire()
                .write_to(&self.mem, self.desc.desc_addr(slot))
                .map_err(|_| VirtqError::MemError)?;
        }

        let ring_slot = self.avail_idx_shadow & self.mask();
        self.avail
            .write_slot(&self.mem, ring_slot, slots[0].get())
            .map_err(|_| VirtqError::MemError)?;

        self.avail_idx_shadow = self.avail_idx_shadow.wrapping_add(1);
        self.avail
            .publish_idx(&self.mem, self.avail_idx_shadow)
            .map_err(|_| VirtqError::MemError)?;
        self.num_added = self.num_added.wrapping_add(1);

        Ok(())
    }

    /// Does the device want to hear about the chains added since the last
    /// kick?
    pub fn should_notify(&self) -> Result<bool, VirtqError> {
        // order the avail.idx store before reading device state
        self.mem.full_barrier();

        if self.event_idx {
            let new = self.avail_idx_shadow;
            let old = new.wrapping_sub(self.num_added);
            let event = self
                .used
                .avail_event(&self.mem)
                .map_err(|_| VirtqError::MemError)?;
            Ok(need_event(event, new, old))
        } else {
            let flags = self.used.flags(&self.mem).map_err(|_| VirtqError::MemError)?;
            Ok(!flags.contains(UsedFlags::NO_NOTIFY))
        }
    }

    /// Notify the device if it asked for it. Returns whether it was notified.
    #[cfg_attr(feature = "tracing", instrument(skip_all, level = "Trace"))]
    pub fn kick(&mut self) -> Result<bool, VirtqError> {
        let needed = self.should_notify()?;
        self.num_added = 0;
        if needed {
            self.notify();
        }
        Ok(needed)
    }

    /// Notify the device unconditionally.
    pub fn notify(&self) {
        self.notifier.notify(self.index);
    }

    /// Has the device published anything we have not consumed?
    fn more_used(&self) -> Result<bool, VirtqError> {
        let idx = self.used.idx(&self.mem).map_err(|_| VirtqError::MemError)?;
        Ok(idx != self.last_used_idx)
    }

    /// Reap one completed chain, if any.
    ///
    /// Returns `Ok(None)` when the device has not completed anything new.
    /// Bounced device-writable segments have been copied back into the
    /// caller's buffers by the time this returns.
    ///
    /// # Errors
    ///
    /// - [`VirtqError::ProtocolDesync`] - the device returned an id that is not
    ///   an in-flight chain head; the queue is now broken
    /// - [`VirtqError::Broken`] - the queue was broken earlier
    /// - [`VirtqError::CopyBack`] - copying bounced data back failed; the
    ///   chain has been reclaimed regardless and the error names it
    #[cfg_attr(feature = "tracing", instrument(skip_all, level = "Trace"))]
    pub fn get_completed(&mut self) -> Result<Option<Completion>, VirtqError> {
        if self.broken {
            return Err(VirtqError::Broken);
        }

        if !self.more_used()? {
            return Ok(None);
        }

        let slot = self.last_used_idx & self.mask();
        let UsedElem { id, len } = self
            .used
            .read_elem(&self.mem, slot)
            .map_err(|_| VirtqError::MemError)?;

        let head = match self.shadow.index(id) {
            Some(head) if self.shadow.get(head).chain_head => head,
            _ => {
                error!(
                    "vq{}: used id {id} at used idx {} is not an in-flight chain head",
                    self.index, self.last_used_idx
                );
                self.broken = true;
                return Err(VirtqError::ProtocolDesync { id });
            }
        };

        let buf = self.shadow.get(head).buf;
        let bounce = &self.bounce;
        let released = self.shadow.release_chain(head, |_, entry| {
            entry.chain_head = false;
            match entry.bounce.take() {
                Some(region) => bounce.release(region),
                None => Ok(()),
            }
        });

        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        if self.event_idx {
            self.avail
                .set_used_event(&self.mem, self.last_used_idx)
                .map_err(|_| VirtqError::MemError)?;
            self.mem.full_barrier();
        }

        if let Err(source) = released {
            warn!("vq{}: bounce copy-back for chain {head} failed: {source}", self.index);
            return Err(VirtqError::CopyBack {
                head,
                buf,
                len,
                source,
            });
        }

        debug!("vq{}: completed chain {head}, len {len}", self.index);
        Ok(Some(Completion { buf, len, head }))
    }

    /// Has the used index moved away from `last_seen`?
    pub fn poll(&self, last_seen: u16) -> Result<bool, VirtqError> {
        self.mem.full_barrier();
        let idx = self.used.idx(&self.mem).map_err(|_| VirtqError::MemError)?;
        Ok(idx != last_seen)
    }

    /// Free the ring pages.
    ///
    /// Refused while chains are in flight, unless the queue is broken: the
    /// device can no longer be trusted to return them, so any bounce scratch
    /// they hold is discarded.
    #[cfg_attr(feature = "tracing", instrument(skip_all, level = "Trace"))]
    pub fn destroy<A: DmaAllocator>(mut self, alloc: &A) -> Result<(), Busy<Self>> {
        let in_flight = self.num_in_flight();
        if in_flight != 0 && !self.broken {
            warn!("vq{}: not destroying, {in_flight} descriptors in flight", self.index);
            return Err(Busy {
                queue: self,
                in_flight,
            });
        }

        if in_flight != 0 {
            for raw in 0..self.depth() {
                let Some(slot) = self.shadow.index(raw as u32) else {
                    continue;
                };
                if let Some(region) = self.shadow.get_mut(slot).bounce.take() {
                    self.bounce.discard(region);
                }
            }
        }

        debug!("vq{}: destroyed, freeing {} pages", self.index, self.region.pages);
        alloc.free_pages(self.region);
        Ok(())
    }

    #[inline]
    fn mask(&self) -> u16 {
        self.layout.depth() - 1
    }

    /// Snapshot the shared ring state for diagnostics.
    pub fn dump(&self) -> Result<VirtqueueDump, VirtqError> {
        let mem_err = |_| VirtqError::MemError;
        let depth = self.depth();

        let mut descs = Vec::with_capacity(depth as usize);
        for slot in 0..depth {
            let at = self.desc.raw_addr(slot).ok_or(VirtqError::MemError)?;
            descs.push(Descriptor::read_from(&self.mem, at).map_err(mem_err)?);
        }

        let avail_ring = (0..depth)
            .map(|s| self.avail.read_slot(&self.mem, s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(mem_err)?;
        let used_ring = (0..depth)
            .map(|s| self.used.read_elem(&self.mem, s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(mem_err)?;

        Ok(VirtqueueDump {
            index: self.index,
            desc_addr: self.desc_addr(),
            depth,
            free_head: self.shadow.free_head(),
            num_added: self.num_added,
            num_free: self.shadow.num_free(),
            last_used_idx: self.last_used_idx,
            avail_flags_shadow: self.avail_flags_shadow.bits(),
            avail_idx_shadow: self.avail_idx_shadow,
            descs,
            avail_flags: self.avail.flags(&self.mem).map_err(mem_err)?.bits(),
            avail_idx: self.avail.idx(&self.mem).map_err(mem_err)?,
            avail_ring,
            used_flags: self.used.flags(&self.mem).map_err(mem_err)?.bits(),
            used_idx: self.used.idx(&self.mem).map_err(mem_err)?,
            used_ring,
        })
    }

    /// Write [`dump`](Self::dump) to the log at debug level.
    pub fn log_dump(&self) {
        match self.dump() {
            Ok(dump) => debug!("{dump}"),
            Err(e) => warn!("vq{}: dump failed: {e}", self.index),
        }
    }
}

impl<M, N, B> Virtqueue<M, N, B> {
    /// Queue number on the device.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Number of descriptors; may be below the requested depth.
    pub fn depth(&self) -> u16 {
        self.layout.depth()
    }

    pub fn num_free(&self) -> usize {
        self.shadow.num_free() as usize
    }

    pub fn num_in_flight(&self) -> usize {
        self.depth() as usize - self.num_free()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn event_idx(&self) -> bool {
        self.event_idx
    }

    /// Index of the next used entry to consume; pass to [`poll`](Self::poll).
    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }

    pub fn layout(&self) -> VringLayout {
        self.layout
    }

    /// Device address of the descriptor table.
    pub fn desc_addr(&self) -> DeviceAddr {
        self.region.device
    }

    /// Device address of the avail ring.
    pub fn avail_addr(&self) -> DeviceAddr {
        self.region.device.add(self.layout.avail_offset() as u64)
    }

    /// Device address of the used ring.
    pub fn used_addr(&self) -> DeviceAddr {
        self.region.device.add(self.layout.used_offset() as u64)
    }

    /// CPU address of the ring memory.
    pub fn ring_base(&self) -> VirtAddr {
        self.region.virt
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn shadow(&self) -> &ShadowTable {
        &self.shadow
    }
}

impl<M, N, B> fmt::Debug for Virtqueue<M, N, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Virtqueue")
            .field("index", &self.index)
            .field("depth", &self.depth())
            .field("num_free", &self.shadow.num_free())
            .field("avail_idx", &self.avail_idx_shadow)
            .field("last_used_idx", &self.last_used_idx)
            .field("event_idx", &self.event_idx)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// Try `layout`, halving the depth on failure while the ring spans more than
/// a page; a single-page ring is the last attempt.
fn alloc_ring<A: DmaAllocator>(
    mut layout: VringLayout,
    alloc: &A,
) -> Result<(VringLayout, DmaRegion), VirtqError> {
    loop {
        let size = layout.size();
        let pages = DmaRegion::pages_for(size);

        match alloc.alloc_pages(pages) {
            Ok(region) if region.size() >= size => return Ok((layout, region)),
            Ok(region) => {
                warn!("allocator returned {} pages, wanted {pages}", region.pages);
                alloc.free_pages(region);
            }
            Err(e) => debug!("ring of depth {} ({pages} pages) unavailable: {e}", layout.depth()),
        }

        if size <= PAGE_SIZE {
            return Err(VirtqError::RingAllocation);
        }
        layout = layout.halved().ok_or(VirtqError::RingAllocation)?;
    }
}

/// Point-in-time copy of a queue's shared and private state.
///
/// `Display` renders the classic multi-line dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtqueueDump {
    pub index: u16,
    pub desc_addr: DeviceAddr,
    pub depth: u16,
    pub free_head: u16,
    pub num_added: u16,
    pub num_free: u16,
    pub last_used_idx: u16,
    pub avail_flags_shadow: u16,
    pub avail_idx_shadow: u16,
    pub descs: Vec<Descriptor>,
    pub avail_flags: u16,
    pub avail_idx: u16,
    pub avail_ring: Vec<u16>,
    pub used_flags: u16,
    pub used_idx: u16,
    pub used_ring: Vec<UsedElem>,
}

impl fmt::Display for VirtqueueDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "virtqueue {}:", self.index)?;
        writeln!(
            f,
            "\tindex {}, phys addr {}, num {}",
            self.index, self.desc_addr, self.depth
        )?;
        writeln!(
            f,
            "\tfree_head {}, num_added {}, num_free {}",
            self.free_head, self.num_added, self.num_free
        )?;
        writeln!(
            f,
            "\tlast_used_idx {}, avail_flags_shadow {}, avail_idx_shadow {}",
            self.last_used_idx, self.avail_flags_shadow, self.avail_idx_shadow
        )?;

        writeln!(f, "Descriptor dump:")?;
        for (i, d) in self.descs.iter().enumerate() {
            writeln!(
                f,
                "\tdesc[{i}] = {{ {:#x}, len {}, flags {}, next {} }}",
                d.addr, d.len, d.flags, d.next
            )?;
        }

        writeln!(f, "Avail ring dump:")?;
        writeln!(f, "\tflags {}, idx {}", self.avail_flags, self.avail_idx)?;
        for (i, head) in self.avail_ring.iter().enumerate() {
            writeln!(f, "\tavail[{i}] = {head}")?;
        }

        writeln!(f, "Used ring dump:")?;
        writeln!(f, "\tflags {}, idx {}", self.used_flags, self.used_idx)?;
        for (i, e) in self.used_ring.iter().enumerate() {
            writeln!(f, "\tused[{i}] = {{ {}, {} }}", e.id, e.len)?;
        }
        Ok(())
    }
}
