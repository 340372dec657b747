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

//! Scatter-gather lists submitted to a queue.
//!
//! A virtio chain lists every device-readable (outbound) segment before any
//! device-writable (inbound) one. [`SgListBuilder`] enforces that order in
//! the type system; [`SgList::from_segments`] checks it at runtime.

use core::marker::PhantomData;

use smallvec::SmallVec;

use crate::addr::VirtAddr;
use crate::error::VirtqError;

/// Which way the bytes of a segment travel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum Direction {
    /// Driver to device; the device only reads the segment.
    ToDevice,
    /// Device to driver; the device writes the segment.
    FromDevice,
}

/// One contiguous caller buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Segment {
    pub addr: VirtAddr,
    pub len: u32,
    pub direction: Direction,
}

impl Segment {
    pub const fn new(addr: VirtAddr, len: u32, direction: Direction) -> Self {
        Self {
            addr,
            len,
            direction,
        }
    }

    /// A segment the device reads.
    pub const fn readable(addr: VirtAddr, len: u32) -> Self {
        Self::new(addr, len, Direction::ToDevice)
    }

    /// A segment the device writes.
    pub const fn writable(addr: VirtAddr, len: u32) -> Self {
        Self::new(addr, len, Direction::FromDevice)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.direction == Direction::FromDevice
    }
}

/// Type-state: readable segments may still be added.
#[derive(Debug)]
pub struct Readable;

/// Type-state: only writable segments may be added.
#[derive(Debug)]
pub struct Writable;

/// Builds an [`SgList`] with all readable segments ahead of writable ones.
#[derive(Debug)]
pub struct SgListBuilder<S> {
    segs: SmallVec<[Segment; 16]>,
    outbound: usize,
    state: PhantomData<S>,
}

impl Default for SgListBuilder<Readable> {
    fn default() -> Self {
        Self::new()
    }
}

impl SgListBuilder<Readable> {
    pub fn new() -> Self {
        Self {
            segs: SmallVec::new(),
            outbound: 0,
            state: PhantomData,
        }
    }

    /// Append a segment the device reads.
    pub fn readable(mut self, addr: VirtAddr, len: u32) -> Self {
        self.segs.push(Segment::readable(addr, len));
        self.outbound += 1;
        self
    }

    /// Append a segment the device writes. No readable segment may follow.
    pub fn writable(self, addr: VirtAddr, len: u32) -> SgListBuilder<Writable> {
        SgListBuilder::<Writable> {
            segs: self.segs,
            outbound: self.outbound,
            state: PhantomData,
        }
        .writable(addr, len)
    }

    pub fn build(self) -> Result<SgList, VirtqError> {
        SgList::finish(self.segs, self.outbound)
    }
}

impl SgListBuilder<Writable> {
    pub fn writable(mut self, addr: VirtAddr, len: u32) -> Self {
        self.segs.push(Segment::writable(addr, len));
        self
    }

    pub fn build(self) -> Result<SgList, VirtqError> {
        SgList::finish(self.segs, self.outbound)
    }
}

/// An ordered, non-empty list of segments forming one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgList {
    segs: SmallVec<[Segment; 16]>,
    /// Number of leading outbound segments.
    outbound: usize,
}

impl SgList {
    fn finish(segs: SmallVec<[Segment; 16]>, outbound: usize) -> Result<Self, VirtqError> {
        if segs.is_empty() {
            return Err(VirtqError::EmptyChain);
        }
        Ok(Self { segs, outbound })
    }

    /// Build from segments in any container, checking the
    /// readable-before-writable order.
    pub fn from_segments(segs: &[Segment]) -> Result<Self, VirtqError> {
        let outbound = segs.iter().take_while(|s| !s.is_writable()).count();
        if segs[outbound..].iter().any(|s| !s.is_writable()) {
            return Err(VirtqError::BadChain);
        }
        Self::finish(SmallVec::from_slice(segs), outbound)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segs
    }

    pub fn readables(&self) -> &[Segment] {
        &self.segs[..self.outbound]
    }

    pub fn writables(&self) -> &[Segment] {
        &self.segs[self.outbound..]
    }

    /// Does the device have anything to read in this list?
    pub fn has_outbound(&self) -> bool {
        self.outbound > 0
    }

    // An SgList is never empty.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.segs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: VirtAddr = VirtAddr::new(0x1000);
    const B: VirtAddr = VirtAddr::new(0x2000);
    const C: VirtAddr = VirtAddr::new(0x3000);

    #[test]
    fn builder_keeps_order_and_split() {
        let sg = SgListBuilder::new()
            .readable(A, 16)
            .readable(B, 512)
            .writable(C, 1)
            .build()
            .unwrap();

        assert_eq!(sg.len(), 3);
        assert_eq!(sg.readables().len(), 2);
        assert_eq!(sg.writables(), &[Segment::writable(C, 1)]);
        assert!(sg.has_outbound());
    }

    #[test]
    fn writables_keep_appending_after_the_switch() {
        let sg = SgListBuilder::new()
            .readable(A, 4)
            .writable(B, 8)
            .writable(C, 16)
            .build()
            .unwrap();

        assert_eq!(
            sg.writables(),
            &[Segment::writable(B, 8), Segment::writable(C, 16)]
        );
    }

    #[test]
    fn empty_builder_is_rejected() {
        assert_eq!(SgListBuilder::new().build(), Err(VirtqError::EmptyChain));
        assert_eq!(SgList::from_segments(&[]), Err(VirtqError::EmptyChain));
    }

    #[test]
    fn writable_only_list_has_no_outbound() {
        let sg = SgListBuilder::new().writable(A, 64).build().unwrap();
        assert!(!sg.has_outbound());
        assert!(sg.readables().is_empty());
    }

    #[test]
    fn from_segments_rejects_readable_after_writable() {
        let segs = [Segment::writable(A, 8), Segment::readable(B, 8)];
        assert_eq!(SgList::from_segments(&segs), Err(VirtqError::BadChain));
    }

    #[test]
    fn from_segments_matches_builder() {
        let segs = [Segment::readable(A, 8), Segment::writable(B, 8)];
        let built = SgListBuilder::new()
            .readable(A, 8)
            .writable(B, 8)
            .build()
            .unwrap();
        assert_eq!(SgList::from_segments(&segs).unwrap(), built);
    }
}
