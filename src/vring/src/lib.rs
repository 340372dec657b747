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

//! Split Virtqueue Ring Engine
//!
//! This crate implements the driver side of a virtio split virtqueue: the
//! shared-memory protocol a boot-time driver uses to hand scatter-gather
//! buffers to a device and to reap them once the device is done.
//!
//! # Architecture
//!
//! - **Driver-private state** ([`ShadowTable`]): the authoritative copy of every
//!   descriptor, with the free list threaded through its `next` links.
//! - **Shared layout** ([`Descriptor`], [`AvailRing`], [`UsedRing`], [`VringLayout`]):
//!   the exact binary format the device parses. The engine only touches it in
//!   explicit publish (driver → device) and observe (device → driver) steps.
//! - **Queue** ([`Virtqueue`]): chain attach, avail publishing, used reaping and
//!   the kick decision for one queue.
//! - **Registry** ([`QueueRegistry`]): owns the queues of one device and hands
//!   out [`QueueHandle`]s.
//!
//! # Collaborators
//!
//! The engine never dereferences addresses itself. Platform code supplies:
//!
//! - [`MemOps`] for reads, writes and the acquire/release points on the ring,
//! - [`AddressTranslate`] to turn CPU addresses ([`VirtAddr`]) into bus
//!   addresses ([`DeviceAddr`]),
//! - [`DmaAllocator`] for the ring pages,
//! - [`Notifier`] to signal the device,
//! - [`BounceBuffers`] when buffers cannot be handed to the device directly.
//!
//! # Quick Start
//!
//! ```ignore
//! let cfg = QueueConfig::default().with_depth(8);
//! let mut vq = Virtqueue::create(&cfg, mem, &dma, notifier, NoBounce)?;
//!
//! let sg = SgListBuilder::new()
//!     .readable(header, 16)
//!     .writable(status, 1)
//!     .build()?;
//! vq.add_and_kick(&sg)?;
//!
//! while vq.get_completed()?.is_none() {
//!     // poll with a deadline of your own
//! }
//! ```

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

/// Size of the allocation unit handed out by [`DmaAllocator`].
pub const PAGE_SIZE: usize = 0x1_000; // 4KB

mod access;
mod addr;
mod bounce;
mod config;
mod desc;
mod dma;
mod error;
mod layout;
mod pool;
mod queue;
mod registry;
mod ring;
mod sg;
mod shadow;

#[cfg(test)]
pub(crate) mod test_util;

pub use access::MemOps;
pub use addr::{AddressTranslate, DeviceAddr, IdentityMap, OffsetMap, VirtAddr};
pub use bounce::{BounceBuffers, BounceError, BouncePolicy, BounceRegion, NoBounce, PoolBounce};
pub use config::QueueConfig;
pub use desc::{DescFlags, DescTable, Descriptor};
pub use dma::{DmaAllocator, DmaRegion};
pub use error::{Busy, VirtqError};
pub use layout::{LayoutError, VringLayout};
pub use pool::{AllocError, Allocation, BufferPool, Slab};
pub use queue::{Completion, Notifier, Virtqueue, VirtqueueDump};
pub use registry::{QueueHandle, QueueRegistry};
pub use ring::{AvailFlags, AvailRing, UsedElem, UsedFlags, UsedRing, need_event};
pub use sg::{Direction, Readable, Segment, SgList, SgListBuilder, Writable};
pub use shadow::{DescIndex, ShadowDesc, ShadowTable};
