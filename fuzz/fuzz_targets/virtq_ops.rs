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

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use vring::{
    BouncePolicy, Direction, PAGE_SIZE, PoolBounce, QueueConfig, Segment, SgList, Virtqueue,
    VirtqError,
};
use vring_testing::{CountingNotifier, PageAllocator, SimDevice, TestMemory};

#[derive(Arbitrary, Debug)]
enum Op {
    Add(Vec<(u16, Direction)>),
    Kick,
    /// Serve the oldest pending request with this used length.
    Serve(u32),
    /// Publish a used entry with an arbitrary id.
    Forge(u32),
    Reap,
    NoNotify(bool),
    AvailEvent(u16),
}

#[derive(Arbitrary, Debug)]
struct Input {
    depth_log2: u8,
    event_idx: bool,
    bounce: bool,
    ops: Vec<Op>,
}

// Drives a queue against a simulated device with arbitrary operations. Only a
// forged used entry may break the queue, and the free count never exceeds
// the depth.
fuzz_target!(|input: Input| {
    let depth = 1u32 << (input.depth_log2 % 8);
    let mem = TestMemory::new(64 * PAGE_SIZE);
    let alloc = PageAllocator::new(mem.clone(), 0, 8);
    let policy = if input.bounce {
        BouncePolicy::Always
    } else {
        BouncePolicy::Above { limit: u64::MAX }
    };
    let bounce = PoolBounce::new(mem.clone(), mem.region(8 * PAGE_SIZE, 8), policy).unwrap();
    let cfg = QueueConfig::default()
        .with_depth(depth)
        .with_align(4)
        .with_event_idx(input.event_idx);
    let mut vq = Virtqueue::create(
        &cfg,
        mem.clone(),
        &alloc,
        Arc::new(CountingNotifier::default()),
        bounce,
    )
    .unwrap();
    let mut dev = SimDevice::attach(mem.clone(), &vq).unwrap();
    let buffers = mem.at(16 * PAGE_SIZE);
    let mut forged = false;

    for op in input.ops {
        match op {
            Op::Add(shape) => {
                let segs: Vec<_> = shape
                    .iter()
                    .take(16)
                    .enumerate()
                    .map(|(i, (len, dir))| {
                        let addr = buffers.add((i * PAGE_SIZE) as u64);
                        Segment::new(addr, (*len as u32).min(PAGE_SIZE as u32), *dir)
                    })
                    .collect();
                let Ok(sg) = SgList::from_segments(&segs) else {
                    continue;
                };
                match vq.add(&sg) {
                    Ok(_)
                    | Err(VirtqError::InsufficientDescriptors { .. })
                    | Err(VirtqError::BounceAllocation(_))
                    | Err(VirtqError::Broken) => {}
                    Err(e) => panic!("unexpected add error: {e}"),
                }
            }
            Op::Kick => {
                vq.kick().unwrap();
            }
            Op::Serve(len) => {
                if let Some(req) = dev.poll_avail().unwrap() {
                    dev.complete(req.head, len).unwrap();
                }
            }
            Op::Forge(id) => {
                dev.push_used_raw(id, 0).unwrap();
                forged = true;
            }
            Op::Reap => match vq.get_completed() {
                Ok(_) => {}
                Err(VirtqError::ProtocolDesync { .. }) | Err(VirtqError::Broken) => {
                    assert!(forged);
                    assert!(vq.is_broken());
                }
                Err(e) => panic!("unexpected reap error: {e}"),
            },
            Op::NoNotify(on) => dev.set_no_notify(on).unwrap(),
            Op::AvailEvent(idx) => dev.set_avail_event(idx).unwrap(),
        }

        assert!(vq.num_free() <= depth as usize);
        if !vq.is_broken() && vq.num_in_flight() == 0 {
            assert_eq!(dev.avail_idx().unwrap(), vq.dump().unwrap().avail_idx_shadow);
        }
    }
});
