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

use std::sync::Arc;

use vring::{
    BounceBuffers, NoBounce, PAGE_SIZE, QueueConfig, VirtAddr, Virtqueue, VirtqError,
};
use vring_testing::{CountingNotifier, PageAllocator, SimDevice, TestMemory};

pub type Mem = Arc<TestMemory>;
pub type Queue<B = NoBounce> = Virtqueue<Mem, Arc<CountingNotifier>, B>;

/// Memory map of a harness:
/// pages `0..RING_PAGES` for rings, `BOUNCE_PAGE..` for bounce scratch,
/// `BUFFER_PAGE..` for caller buffers.
pub const RING_PAGES: usize = 16;
pub const BOUNCE_PAGE: usize = 16;
pub const BOUNCE_PAGES: usize = 8;
pub const BUFFER_PAGE: usize = 32;
pub const TOTAL_PAGES: usize = 64;

pub struct Harness {
    pub mem: Mem,
    pub alloc: PageAllocator,
    pub notifier: Arc<CountingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        let mem = TestMemory::new(TOTAL_PAGES * PAGE_SIZE);
        let alloc = PageAllocator::new(mem.clone(), 0, RING_PAGES);
        Self {
            mem,
            alloc,
            notifier: Arc::new(CountingNotifier::default()),
        }
    }

    pub fn try_queue(&self, cfg: &QueueConfig) -> Result<Queue, VirtqError> {
        Virtqueue::create(cfg, self.mem.clone(), &self.alloc, self.notifier.clone(), NoBounce)
    }

    pub fn queue(&self, cfg: &QueueConfig) -> Queue {
        self.try_queue(cfg).unwrap()
    }

    pub fn queue_with<B: BounceBuffers>(&self, cfg: &QueueConfig, bounce: B) -> Queue<B> {
        Virtqueue::create(cfg, self.mem.clone(), &self.alloc, self.notifier.clone(), bounce)
            .unwrap()
    }

    pub fn device<B>(&self, vq: &Queue<B>) -> SimDevice<Mem> {
        SimDevice::attach(self.mem.clone(), vq).unwrap()
    }

    /// Caller buffer `n`, 256 bytes apart.
    pub fn buf(&self, n: usize) -> VirtAddr {
        self.mem.at(BUFFER_PAGE * PAGE_SIZE + n * 0x100)
    }
}

pub fn small(depth: u32) -> QueueConfig {
    QueueConfig::default().with_depth(depth).with_align(4)
}
