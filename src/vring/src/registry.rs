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

//! Ownership of every queue a driver has created.
//!
//! Queues are stored in an arena and named by [`QueueHandle`]. Freed slots
//! are reused by the next [`QueueRegistry::create`].

use alloc::vec::Vec;

use log::debug;
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::access::MemOps;
use crate::bounce::{BounceBuffers, NoBounce};
use crate::config::QueueConfig;
use crate::dma::DmaAllocator;
use crate::error::VirtqError;
use crate::queue::{Notifier, Virtqueue};

/// Names a queue inside a [`QueueRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle(u16);

impl QueueHandle {
    pub const fn get(self) -> u16 {
        self.0
    }
}

pub struct QueueRegistry<M, N, B = NoBounce> {
    queues: Vec<Option<Virtqueue<M, N, B>>>,
}

impl<M, N, B> Default for QueueRegistry<M, N, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, N, B> QueueRegistry<M, N, B> {
    pub const fn new() -> Self {
        Self { queues: Vec::new() }
    }

    pub fn get(&self, handle: QueueHandle) -> Option<&Virtqueue<M, N, B>> {
        self.queues.get(handle.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: QueueHandle) -> Option<&mut Virtqueue<M, N, B>> {
        self.queues.get_mut(handle.0 as usize)?.as_mut()
    }

    /// Live queues with their handles, in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (QueueHandle, &Virtqueue<M, N, B>)> {
        self.queues
            .iter()
            .enumerate()
            .filter_map(|(i, q)| Some((QueueHandle(i as u16), q.as_ref()?)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (QueueHandle, &mut Virtqueue<M, N, B>)> {
        self.queues
            .iter_mut()
            .enumerate()
            .filter_map(|(i, q)| Some((QueueHandle(i as u16), q.as_mut()?)))
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        self.queues.iter().filter(|q| q.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle of the live queue with device queue number `index`.
    pub fn find_by_index(&self, index: u16) -> Option<QueueHandle> {
        self.iter()
            .find(|(_, q)| q.index() == index)
            .map(|(h, _)| h)
    }
}

impl<M, N, B> QueueRegistry<M, N, B>
where
    M: MemOps,
    N: Notifier,
    B: BounceBuffers,
{
    /// Create a queue and take ownership of it.
    #[cfg_attr(feature = "tracing", instrument(skip_all, level = "Trace"))]
    pub fn create<A: DmaAllocator>(
        &mut self,
        cfg: &QueueConfig,
        mem: M,
        alloc: &A,
        notifier: N,
        bounce: B,
    ) -> Result<QueueHandle, VirtqError> {
        let slot = free_slot(&self.queues)?;
        let vq = Virtqueue::create(cfg, mem, alloc, notifier, bounce)?;

        if slot == self.queues.len() {
            self.queues.push(Some(vq));
        } else {
            self.queues[slot] = Some(vq);
        }

        debug!("registered vq{} as handle {slot}", cfg.index());
        Ok(QueueHandle(slot as u16))
    }

    /// Destroy one queue. A queue with descriptors in flight stays
    /// registered.
    #[cfg_attr(feature = "tracing", instrument(skip_all, level = "Trace"))]
    pub fn destroy<A: DmaAllocator>(
        &mut self,
        handle: QueueHandle,
        alloc: &A,
    ) -> Result<(), VirtqError> {
        let slot = self
            .queues
            .get_mut(handle.0 as usize)
            .ok_or(VirtqError::InvalidHandle)?;
        let vq = slot.take().ok_or(VirtqError::InvalidHandle)?;

        vq.destroy(alloc).map_err(|busy| {
            let err = VirtqError::QueueBusy {
                in_flight: busy.in_flight,
            };
            *slot = Some(busy.into_inner());
            err
        })
    }

    /// Destroy every idle queue.
    ///
    /// Busy queues stay registered; the error reports how many descriptors
    /// they hold between them.
    pub fn destroy_all<A: DmaAllocator>(&mut self, alloc: &A) -> Result<(), VirtqError> {
        let mut in_flight = 0;

        for slot in &mut self.queues {
            let Some(vq) = slot.take() else {
                continue;
            };
            if let Err(busy) = vq.destroy(alloc) {
                in_flight += busy.in_flight;
                *slot = Some(busy.into_inner());
            }
        }

        if in_flight != 0 {
            return Err(VirtqError::QueueBusy { in_flight });
        }
        self.queues.clear();
        Ok(())
    }
}

impl<M, N, B> core::fmt::Debug for QueueRegistry<M, N, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter().map(|(_, q)| q)).finish()
    }
}

/// First empty slot, or the next one to push. Handles are `u16`, so the
/// arena never grows past `u16::MAX + 1` entries.
fn free_slot<T>(slots: &[Option<T>]) -> Result<usize, VirtqError> {
    match slots.iter().position(Option::is_none) {
        Some(free) => Ok(free),
        None if slots.len() <= u16::MAX as usize => Ok(slots.len()),
        None => Err(VirtqError::RegistryFull),
    }
}
