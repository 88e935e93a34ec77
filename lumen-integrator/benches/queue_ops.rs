//! Queue machinery microbenchmarks: the gather sweep and the
//! compaction pass dominate the scheduler's non-kernel time.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::atomic::AtomicU32;

use lumen_core::sampler::{IndependentSampler, Sampler};
use lumen_core::spectrum::RgbSpectrum;
use lumen_integrator::queue::{compact_stage, free_slots_below, CompactionIo};
use lumen_integrator::{KernelState, LightSampleSoa, PathStateSoa, QueueSet};

const STATE_COUNT: usize = 1 << 18;

fn setup() -> (QueueSet, PathStateSoa, LightSampleSoa, IndependentSampler) {
    let states = PathStateSoa::new(&RgbSpectrum, STATE_COUNT, true);
    let lights = LightSampleSoa::new(3, STATE_COUNT, 0);
    let queues = QueueSet::new(STATE_COUNT, true);
    let mut sampler = IndependentSampler::default();
    sampler.reset(glam::UVec2::new(512, 512), STATE_COUNT, 1);
    for id in 0..STATE_COUNT as u32 {
        let stage = if id % 3 == 0 {
            KernelState::Intersect
        } else {
            KernelState::Invalid
        };
        states.write_kernel_index(id, stage);
        queues.push(stage, id);
    }
    queues.snapshot_counters();
    (queues, states, lights, sampler)
}

fn bench_gather(c: &mut Criterion) {
    let (queues, states, _, _) = setup();
    c.bench_function("gather_262144_states", |b| {
        b.iter(|| queues.gather(KernelState::Intersect, &states));
    });
}

fn bench_compact(c: &mut Criterion) {
    c.bench_function("compact_262144_states", |b| {
        b.iter_batched(
            setup,
            |(queues, states, lights, sampler)| {
                let watermark = queues.count(KernelState::Intersect);
                queues.gather(KernelState::Invalid, &states);
                let invalid = queues.entries(
                    KernelState::Invalid,
                    queues.live_count(KernelState::Invalid),
                );
                let free = free_slots_below(&invalid, watermark);
                queues.gather(KernelState::Intersect, &states);
                let io = CompactionIo {
                    states: &states,
                    lights: &lights,
                    sampler: &sampler,
                    use_tag_sort: false,
                };
                let cursor = AtomicU32::new(0);
                compact_stage(
                    &queues,
                    KernelState::Intersect,
                    watermark,
                    &free,
                    &cursor,
                    &io,
                );
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_gather, bench_compact);
criterion_main!(benches);
