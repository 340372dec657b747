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

use thiserror::Error;

use crate::addr::VirtAddr;
use crate::desc::{DescTable, Descriptor};
use crate::ring::{AvailRing, UsedElem, UsedRing};

/// Largest queue depth the split ring format allows.
pub const MAX_DEPTH: u32 = 32768;

/// Smallest alignment of the used ring allowed by the split ring format.
pub const MIN_ALIGN: usize = 4;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    #[error("queue depth {0} is not a power of two in 1..=32768")]
    InvalidDepth(u32),
    #[error("ring alignment {0} is not a power of two >= 4")]
    InvalidAlignment(usize),
    #[error("ring base {0:#x} is not aligned to 16 bytes")]
    Misaligned(u64),
}

#[inline]
pub(crate) const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Geometry of a split virtqueue in one contiguous memory region.
///
/// # Memory Layout
///
/// ```text
/// 0                     descriptor table   16 * depth bytes
/// 16 * depth            avail ring         flags, idx, ring[depth], used_event
/// align_up(.., align)   used ring          flags, idx, ring[depth] {id, len}, avail_event
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VringLayout {
    depth: u16,
    align: usize,
}

impl VringLayout {
    /// Validate `depth` and `align` and describe the resulting ring.
    ///
    /// A depth of 32768 is stored as-is; it fits a `u16`.
    pub const fn new(depth: u32, align: usize) -> Result<Self, LayoutError> {
        if depth == 0 || depth > MAX_DEPTH || !depth.is_power_of_two() {
            return Err(LayoutError::InvalidDepth(depth));
        }
        if align < MIN_ALIGN || !align.is_power_of_two() {
            return Err(LayoutError::InvalidAlignment(align));
        }

        Ok(Self {
            depth: depth as u16,
            align,
        })
    }

    /// Total bytes needed for a ring of `depth` entries at `align`.
    ///
    /// `align_up(16 * depth + 2 * (3 + depth), align) + 2 * 3 + 8 * depth`
    pub const fn query_size(depth: usize, align: usize) -> usize {
        let used = align_up(Self::avail_offset_for(depth) + AvailRing::size(depth), align);
        used + UsedRing::size(depth)
    }

    const fn avail_offset_for(depth: usize) -> usize {
        DescTable::size(depth)
    }

    pub const fn depth(&self) -> u16 {
        self.depth
    }

    pub const fn align(&self) -> usize {
        self.align
    }

    pub const fn size(&self) -> usize {
        Self::query_size(self.depth as usize, self.align)
    }

    /// Byte offset of the avail ring from the ring base.
    pub const fn avail_offset(&self) -> usize {
        Self::avail_offset_for(self.depth as usize)
    }

    /// Byte offset of the used ring from the ring base.
    pub const fn used_offset(&self) -> usize {
        align_up(
            self.avail_offset() + AvailRing::size(self.depth as usize),
            self.align,
        )
    }

    /// The same layout with half the depth, or None at depth 1.
    pub const fn halved(&self) -> Option<Self> {
        if self.depth <= 1 {
            return None;
        }
        Some(Self {
            depth: self.depth / 2,
            align: self.align,
        })
    }

    /// Place the three ring parts at `base`.
    pub fn place(&self, base: VirtAddr) -> Result<(DescTable, AvailRing, UsedRing), LayoutError> {
        if !base.is_aligned(Descriptor::ALIGN as u64) {
            return Err(LayoutError::Misaligned(base.as_u64()));
        }

        let desc = DescTable::new(base, self.depth);
        let avail = AvailRing::new(base.add(self.avail_offset() as u64), self.depth);
        let used = UsedRing::new(base.add(self.used_offset() as u64), self.depth);
        Ok((desc, avail, used))
    }
}

const _: () = assert!(core::mem::size_of::<UsedElem>() == 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_geometry() {
        assert_eq!(VringLayout::new(0, 4096), Err(LayoutError::InvalidDepth(0)));
        assert_eq!(VringLayout::new(6, 4096), Err(LayoutError::InvalidDepth(6)));
        assert_eq!(VringLayout::new(65536, 4096), Err(LayoutError::InvalidDepth(65536)));
        assert_eq!(VringLayout::new(8, 2), Err(LayoutError::InvalidAlignment(2)));
        assert_eq!(VringLayout::new(8, 24), Err(LayoutError::InvalidAlignment(24)));
        assert!(VringLayout::new(32768, 4).is_ok());
    }

    #[test]
    fn size_matches_legacy_formula() {
        for depth in [1usize, 2, 8, 256, 1024, 32768] {
            for align in [4usize, 64, 4096] {
                let expected = align_up(16 * depth + 2 * (3 + depth), align) + 2 * 3 + 8 * depth;
                assert_eq!(VringLayout::query_size(depth, align), expected);
            }
        }
    }

    #[test]
    fn depth_256_page_aligned() {
        // 4096 bytes of descriptors, 518 of avail, used at the next page.
        let layout = VringLayout::new(256, 4096).unwrap();
        assert_eq!(layout.avail_offset(), 4096);
        assert_eq!(layout.used_offset(), 8192);
        assert_eq!(layout.size(), 8192 + 6 + 8 * 256);
    }

    #[test]
    fn depth_8_small_alignment() {
        let layout = VringLayout::new(8, 4).unwrap();
        assert_eq!(layout.avail_offset(), 128);
        // 128 + 2 * (3 + 8) = 150, rounded up to 152.
        assert_eq!(layout.used_offset(), 152);
        assert_eq!(layout.size(), 152 + 6 + 64);
    }

    #[test]
    fn halving_stops_at_one() {
        let mut layout = VringLayout::new(4, 4096).unwrap();
        let mut depths = alloc::vec![layout.depth()];
        while let Some(next) = layout.halved() {
            depths.push(next.depth());
            layout = next;
        }
        assert_eq!(depths, [4, 2, 1]);
    }

    #[test]
    fn place_rejects_unaligned_base() {
        let layout = VringLayout::new(8, 4).unwrap();
        assert_eq!(
            layout.place(VirtAddr::new(0x1008)).unwrap_err(),
            LayoutError::Misaligned(0x1008)
        );
    }
}
