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

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use vring::{
    AvailFlags, AvailRing, DescTable, Descriptor, DeviceAddr, MemOps, Notifier, UsedElem,
    UsedFlags, UsedRing, VirtAddr, Virtqueue, VringLayout,
};

/// A chain the device has taken off the avail ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub head: u16,
    pub descs: Vec<Descriptor>,
}

impl Request {
    pub fn readable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descs.iter().filter(|d| !d.is_writeable())
    }

    pub fn writable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descs.iter().filter(|d| d.is_writeable())
    }
}

/// Device side of a split ring, driven by hand from a test.
///
/// It parses the shared layout only, never the driver's private state.
pub struct SimDevice<M> {
    mem: M,
    desc: DescTable,
    avail: AvailRing,
    used: UsedRing,
    depth: u16,
    last_avail: u16,
    used_idx: u16,
}

impl<M: MemOps> SimDevice<M> {
    pub fn new(mem: M, base: VirtAddr, layout: VringLayout) -> Result<Self> {
        let (desc, avail, used) = layout
            .place(base)
            .map_err(|e| anyhow!("bad ring placement: {e}"))?;
        Ok(Self {
            mem,
            desc,
            avail,
            used,
            depth: layout.depth(),
            last_avail: 0,
            used_idx: 0,
        })
    }

    /// Attach to the rings of `vq`.
    pub fn attach<N, B>(mem: M, vq: &Virtqueue<M, N, B>) -> Result<Self> {
        Self::new(mem, vq.ring_base(), vq.layout())
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn avail_idx(&self) -> Result<u16> {
        self.avail
            .idx(&self.mem)
            .map_err(|e| anyhow!("reading avail.idx: {e:?}"))
    }

    pub fn avail_flags(&self) -> Result<AvailFlags> {
        self.avail
            .flags(&self.mem)
            .map_err(|e| anyhow!("reading avail.flags: {e:?}"))
    }

    pub fn used_event(&self) -> Result<u16> {
        self.avail
            .used_event(&self.mem)
            .map_err(|e| anyhow!("reading used_event: {e:?}"))
    }

    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }

    pub fn read_desc(&self, slot: u16) -> Result<Descriptor> {
        let at = self
            .desc
            .raw_addr(slot)
            .ok_or_else(|| anyhow!("descriptor {slot} out of range"))?;
        Descriptor::read_from(&self.mem, at).map_err(|e| anyhow!("reading desc {slot}: {e:?}"))
    }

    /// Take the next published chain, if any.
    pub fn poll_avail(&mut self) -> Result<Option<Request>> {
        if self.avail_idx()? == self.last_avail {
            return Ok(None);
        }

        let slot = self.last_avail & (self.depth - 1);
        let head = self
            .avail
            .read_slot(&self.mem, slot)
            .map_err(|e| anyhow!("reading avail[{slot}]: {e:?}"))?;
        let descs = self
            .walk_chain(head)
            .with_context(|| format!("walking chain at {head}"))?;

        self.last_avail = self.last_avail.wrapping_add(1);
        Ok(Some(Request { head, descs }))
    }

    fn walk_chain(&self, head: u16) -> Result<Vec<Descriptor>> {
        let mut descs = Vec::new();
        let mut slot = head;
        let mut seen_writable = false;

        loop {
            let d = self.read_desc(slot)?;
            if d.is_writeable() {
                seen_writable = true;
            } else if seen_writable {
                bail!("readable descriptor {slot} after a writable one");
            }
            descs.push(d);

            if !d.is_next() {
                return Ok(descs);
            }
            if descs.len() >= self.depth as usize {
                bail!("chain from {head} does not terminate");
            }
            slot = d.next;
        }
    }

    /// Bytes the driver exposed in `desc`.
    pub fn read(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let mut out = vec![0u8; desc.len as usize];
        let at = self.mem.device_to_virt(DeviceAddr::new(desc.addr));
        self.mem
            .read(at, &mut out)
            .map_err(|e| anyhow!("reading buffer {:#x}: {e:?}", desc.addr))?;
        Ok(out)
    }

    /// Fill a device-writable descriptor; returns the bytes written.
    pub fn write(&self, desc: &Descriptor, data: &[u8]) -> Result<u32> {
        if !desc.is_writeable() {
            bail!("descriptor at {:#x} is device read-only", desc.addr);
        }
        let n = data.len().min(desc.len as usize);
        let at = self.mem.device_to_virt(DeviceAddr::new(desc.addr));
        self.mem
            .write(at, &data[..n])
            .map_err(|e| anyhow!("writing buffer {:#x}: {e:?}", desc.addr))?;
        Ok(n as u32)
    }

    /// Return a chain to the driver.
    pub fn complete(&mut self, head: u16, len: u32) -> Result<()> {
        self.push_used_raw(head as u32, len)
    }

    /// Publish a used entry without checking `id`.
    pub fn push_used_raw(&mut self, id: u32, len: u32) -> Result<()> {
        let slot = self.used_idx & (self.depth - 1);
        self.used
            .write_elem(&self.mem, slot, UsedElem { id, len })
            .map_err(|e| anyhow!("writing used[{slot}]: {e:?}"))?;
        self.used_idx = self.used_idx.wrapping_add(1);
        self.used
            .publish_idx(&self.mem, self.used_idx)
            .map_err(|e| anyhow!("publishing used.idx: {e:?}"))
    }

    /// Serve every pending chain with `f`, which returns the used length.
    pub fn process<F>(&mut self, mut f: F) -> Result<usize>
    where
        F: FnMut(&Request, &Self) -> Result<u32>,
    {
        let mut served = 0;
        while let Some(req) = self.poll_avail()? {
            let len = f(&req, self)?;
            self.complete(req.head, len)?;
            served += 1;
        }
        Ok(served)
    }

    pub fn set_no_notify(&self, suppress: bool) -> Result<()> {
        let flags = if suppress {
            UsedFlags::NO_NOTIFY
        } else {
            UsedFlags::empty()
        };
        self.used
            .set_flags(&self.mem, flags)
            .map_err(|e| anyhow!("writing used.flags: {e:?}"))
    }

    pub fn set_avail_event(&self, idx: u16) -> Result<()> {
        self.used
            .set_avail_event(&self.mem, idx)
            .map_err(|e| anyhow!("writing avail_event: {e:?}"))
    }
}

/// Notifier that counts doorbell writes.
#[derive(Debug, Default)]
pub struct CountingNotifier {
    count: AtomicUsize,
    last: AtomicU32,
}

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last_queue(&self) -> Option<u16> {
        match self.last.load(Ordering::SeqCst) {
            0 => None,
            v => Some((v - 1) as u16),
        }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
        self.last.store(0, Ordering::SeqCst);
    }
}

impl Notifier for CountingNotifier {
    fn notify(&self, queue_index: u16) {
        self.last.store(queue_index as u32 + 1, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}
