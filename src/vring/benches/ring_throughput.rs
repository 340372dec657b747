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

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use vring::{
    BounceBuffers, BouncePolicy, BufferPool, NoBounce, PAGE_SIZE, PoolBounce, QueueConfig,
    SgListBuilder, VirtAddr, Virtqueue,
};
use vring_testing::{CountingNotifier, PageAllocator, SimDevice, TestMemory};

const BUFFERS: usize = 32 * PAGE_SIZE;

struct Bench<B> {
    vq: Virtqueue<Arc<TestMemory>, Arc<CountingNotifier>, B>,
    dev: SimDevice<Arc<TestMemory>>,
    buf: VirtAddr,
}

fn setup<B: BounceBuffers>(depth: u32, bounce: impl FnOnce(&Arc<TestMemory>) -> B) -> Bench<B> {
    let mem = TestMemory::new(64 * PAGE_SIZE);
    let alloc = PageAllocator::new(mem.clone(), 0, 16);
    let cfg = QueueConfig::default().with_depth(depth).with_align(4);
    let b = bounce(&mem);
    let vq = Virtqueue::create(
        &cfg,
        mem.clone(),
        &alloc,
        Arc::new(CountingNotifier::default()),
        b,
    )
    .unwrap();
    let dev = SimDevice::attach(mem.clone(), &vq).unwrap();
    Bench {
        vq,
        dev,
        buf: mem.at(BUFFERS),
    }
}

// One request/response round trip per iteration
fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    for depth in [8u32, 64, 256].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            let mut s = setup(depth, |_| NoBounce);
            let sg = SgListBuilder::new()
                .readable(s.buf, 64)
                .writable(s.buf.add(0x100), 64)
                .build()
                .unwrap();
            b.iter(|| {
                s.vq.add_and_kick(black_box(&sg)).unwrap();
                s.dev.process(|_, _| Ok(64)).unwrap();
                black_box(s.vq.get_completed().unwrap().unwrap());
            });
        });
    }
    group.finish();
}

// Fill the ring, then drain it
fn bench_fill_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_drain");

    for depth in [64u32, 256].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            let mut s = setup(depth, |_| NoBounce);
            let sg = SgListBuilder::new().readable(s.buf, 512).build().unwrap();
            b.iter(|| {
                for _ in 0..depth {
                    s.vq.add(&sg).unwrap();
                }
                s.vq.kick().unwrap();
                s.dev.process(|_, _| Ok(0)).unwrap();
                while let Some(done) = s.vq.get_completed().unwrap() {
                    black_box(done);
                }
            });
        });
    }
    group.finish();
}

// Round trip with every segment copied through scratch
fn bench_bounced_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounced_round_trip");

    for size in [64u32, 1500, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64 * 2));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut s = setup(64, |mem| {
                let region = mem.region(16 * PAGE_SIZE, 16);
                PoolBounce::new(mem.clone(), region, BouncePolicy::Always).unwrap()
            });
            let sg = SgListBuilder::new()
                .readable(s.buf, size)
                .writable(s.buf.add(2 * PAGE_SIZE as u64), size)
                .build()
                .unwrap();
            b.iter(|| {
                s.vq.add(&sg).unwrap();
                s.dev.process(|_, _| Ok(size)).unwrap();
                black_box(s.vq.get_completed().unwrap().unwrap());
            });
        });
    }
    group.finish();
}

// Scratch pool alloc/free on its own
fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounce_pool");

    for size in [64usize, 256, 1500, 4096].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let pool = BufferPool::<256, 4096>::new(VirtAddr::new(0x10000), 4 * 1024 * 1024).unwrap();
            b.iter(|| {
                let alloc = pool.alloc(black_box(size)).unwrap();
                pool.dealloc(alloc).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_round_trip,
    bench_fill_drain,
    bench_bounced_round_trip,
    bench_pool
);
criterion_main!(benches);
