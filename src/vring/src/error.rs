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

use core::fmt;

use thiserror::Error;

use crate::addr::VirtAddr;
use crate::bounce::BounceError;
use crate::layout::LayoutError;
use crate::shadow::DescIndex;

/// Errors that can occur in virtqueue operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtqError {
    #[error("need {needed} free descriptors, have {free}")]
    InsufficientDescriptors { needed: usize, free: usize },
    #[error("scatter-gather list is empty")]
    EmptyChain,
    #[error("readable segment follows a writable one")]
    BadChain,
    #[error("device returned invalid used id {id}")]
    ProtocolDesync { id: u32 },
    #[error("queue is broken")]
    Broken,
    #[error("bounce buffer allocation failed: {0}")]
    BounceAllocation(#[from] BounceError),
    /// The chain completed and was reclaimed, but bounced data could not be
    /// copied back into the caller's buffers.
    #[error("chain {head} completed with len {len}, copy-back failed: {source}")]
    CopyBack {
        head: DescIndex,
        buf: VirtAddr,
        len: u32,
        source: BounceError,
    },
    #[error("invalid ring layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("no memory for the ring")]
    RingAllocation,
    #[error("queue has {in_flight} descriptors in flight")]
    QueueBusy { in_flight: usize },
    #[error("no queue behind this handle")]
    InvalidHandle,
    #[error("every queue handle is in use")]
    RegistryFull,
    #[error("shared memory access failed")]
    MemError,
}

/// A teardown refused because descriptors are still in flight.
///
/// Carries the queue back to the caller so it can be drained and destroyed
/// again.
pub struct Busy<Q> {
    pub queue: Q,
    pub in_flight: usize,
}

impl<Q> Busy<Q> {
    pub fn into_inner(self) -> Q {
        self.queue
    }
}

impl<Q> fmt::Debug for Busy<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Busy")
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl<Q> fmt::Display for Busy<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue has {} descriptors in flight", self.in_flight)
    }
}

impl<Q> core::error::Error for Busy<Q> {}

impl<Q> From<Busy<Q>> for VirtqError {
    fn from(busy: Busy<Q>) -> Self {
        VirtqError::QueueBusy {
            in_flight: busy.in_flight,
        }
    }
}
