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

use core::cmp::{max, min};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Parameters for creating one [`Virtqueue`](crate::Virtqueue).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueConfig {
    /// Queue number on the device, passed to the notifier.
    index: u16,
    /// Requested number of descriptors. Creation may shrink it.
    depth: u32,
    /// Used ring alignment required by the transport.
    align: usize,
    /// VIRTIO_F_EVENT_IDX was negotiated.
    event_idx: bool,
    /// The driver wants used-buffer interrupts.
    interrupts: bool,
}

impl QueueConfig {
    /// The default queue depth
    pub const DEFAULT_DEPTH: u32 = 256;
    /// The minimum queue depth
    pub const MIN_DEPTH: u32 = 1;
    /// The maximum queue depth allowed by the split ring format
    pub const MAX_DEPTH: u32 = 32768;
    /// The default used ring alignment (legacy page alignment)
    pub const DEFAULT_ALIGN: usize = 4096;
    /// The minimum used ring alignment
    pub const MIN_ALIGN: usize = 4;

    pub const fn new(index: u16) -> Self {
        Self {
            index,
            depth: Self::DEFAULT_DEPTH,
            align: Self::DEFAULT_ALIGN,
            event_idx: false,
            interrupts: false,
        }
    }

    /// Set the requested depth. Zero selects `DEFAULT_DEPTH`; other values
    /// are clamped to `MIN_DEPTH..=MAX_DEPTH`. Power-of-two-ness is checked
    /// when the queue is created.
    #[cfg_attr(feature = "tracing", instrument(skip_all, level = "Trace"))]
    pub fn set_depth(&mut self, depth: u32) {
        self.depth = match depth {
            0 => Self::DEFAULT_DEPTH,
            1.. => min(Self::MAX_DEPTH, max(depth, Self::MIN_DEPTH)),
        };
    }

    /// Set the used ring alignment. Zero selects `DEFAULT_ALIGN`; smaller
    /// values are raised to `MIN_ALIGN`.
    #[cfg_attr(feature = "tracing", instrument(skip_all, level = "Trace"))]
    pub fn set_align(&mut self, align: usize) {
        self.align = match align {
            0 => Self::DEFAULT_ALIGN,
            1.. => max(align, Self::MIN_ALIGN),
        };
    }

    pub fn set_event_idx(&mut self, enabled: bool) {
        self.event_idx = enabled;
    }

    pub fn set_interrupts(&mut self, enabled: bool) {
        self.interrupts = enabled;
    }

    pub fn with_index(mut self, index: u16) -> Self {
        self.index = index;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.set_depth(depth);
        self
    }

    pub fn with_align(mut self, align: usize) -> Self {
        self.set_align(align);
        self
    }

    pub fn with_event_idx(mut self, enabled: bool) -> Self {
        self.set_event_idx(enabled);
        self
    }

    pub fn with_interrupts(mut self, enabled: bool) -> Self {
        self.set_interrupts(enabled);
        self
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn event_idx(&self) -> bool {
        self.event_idx
    }

    pub fn interrupts(&self) -> bool {
        self.interrupts
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(0)
    }
}
