//! Per-stage index queues.
//!
//! A queue is a pair of an index buffer and an atomic counter. Two
//! layouts exist:
//!
//! * *scattered*: one buffer per stage; kernels write the path id at
//!   the slot a `fetch_add` hands them. Dispatch snapshots the entries
//!   so the sweep never reads slots the current iteration's pushes are
//!   recycling.
//! * *gathered*: one shared buffer; kernels only bump the counter and
//!   flip the path's `kernel_index`, and a block-local gather pass
//!   rebuilds the per-stage lists before a dispatch. This trades an
//!   extra sweep for one atomic per block instead of one per push.

use std::sync::atomic::{AtomicU32, Ordering};

use lumen_core::sampler::Sampler;

use crate::cell::Column;
use crate::path_state::{KernelState, LightSampleSoa, PathStateSoa, KERNEL_COUNT};

/// Ids per gather block; one global atomic add per block.
const GATHER_BLOCK: usize = 256;

pub struct QueueSet {
    gathering: bool,
    state_count: usize,
    counters: [AtomicU32; KERNEL_COUNT],
    /// Host-visible sizes captured by [`QueueSet::snapshot_counters`].
    snapshot: [AtomicU32; KERNEL_COUNT],
    /// Shared-buffer partition for the gathered layout.
    offsets: [AtomicU32; KERNEL_COUNT],
    /// Gathered layout: one shared buffer partitioned by `offsets`.
    shared_index: Column<u32>,
    /// Scattered layout: one buffer per stage.
    stage_index: Vec<Column<u32>>,
}

impl QueueSet {
    pub fn new(state_count: usize, gathering: bool) -> Self {
        Self {
            gathering,
            state_count,
            counters: Default::default(),
            snapshot: Default::default(),
            offsets: Default::default(),
            shared_index: Column::new(if gathering { state_count } else { 0 }),
            stage_index: if gathering {
                Vec::new()
            } else {
                (0..KERNEL_COUNT).map(|_| Column::new(state_count)).collect()
            },
        }
    }

    #[inline]
    pub fn gathering(&self) -> bool {
        self.gathering
    }

    #[inline]
    pub fn state_count(&self) -> usize {
        self.state_count
    }

    /// Parks `id` in `stage`. In the gathered layout the caller also
    /// writes the path's `kernel_index`; the queue only counts.
    pub fn push(&self, stage: KernelState, id: u32) {
        let slot = self.counters[stage.index()].fetch_add(1, Ordering::Relaxed);
        if !self.gathering {
            self.stage_index[stage.index()].set(slot, id);
        }
    }

    /// Host-side read of all counters; the captured sizes stay valid
    /// until the next dispatch. Also lays out the shared-buffer
    /// partition for the gathered layout. Must only run between
    /// dispatches.
    pub fn snapshot_counters(&self) {
        let mut prev = 0u32;
        for i in 0..KERNEL_COUNT {
            let count = self.counters[i].load(Ordering::Relaxed);
            self.snapshot[i].store(count, Ordering::Relaxed);
            self.offsets[i].store(prev, Ordering::Relaxed);
            prev += count;
        }
    }

    /// Size of `stage` at the last snapshot.
    #[inline]
    pub fn count(&self, stage: KernelState) -> u32 {
        self.snapshot[stage.index()].load(Ordering::Relaxed)
    }

    #[inline]
    fn offset(&self, stage: KernelState) -> u32 {
        self.offsets[stage.index()].load(Ordering::Relaxed)
    }

    /// Live counter value (after gathers or pushes since the snapshot).
    #[inline]
    pub fn live_count(&self, stage: KernelState) -> u32 {
        self.counters[stage.index()].load(Ordering::Relaxed)
    }

    pub fn any_active(&self) -> bool {
        KernelState::ALL[1..].iter().any(|&s| self.count(s) > 0)
    }

    pub fn total_active(&self) -> u32 {
        KernelState::ALL[1..].iter().map(|&s| self.count(s)).sum()
    }

    pub fn clear(&self, stage: KernelState) {
        self.counters[stage.index()].store(0, Ordering::Relaxed);
    }

    pub fn clear_all(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Resets the queues so that every path id is parked in `Invalid`;
    /// the start-of-shutter state.
    pub fn reset_invalid(&self, states: &PathStateSoa) {
        self.clear_all();
        self.counters[KernelState::Invalid.index()]
            .store(self.state_count as u32, Ordering::Relaxed);
        if self.gathering {
            states.mark_all_invalid();
        } else {
            let column = &self.stage_index[KernelState::Invalid.index()];
            for id in 0..self.state_count as u32 {
                column.set(id, id);
            }
        }
    }

    /// Rebuilds the gathered list for `stage` from `kernel_index`.
    /// Block-local: each block of ids counts its matches and reserves a
    /// contiguous range with a single atomic add. Returns the rebuilt
    /// size.
    pub fn gather(&self, stage: KernelState, states: &PathStateSoa) -> u32 {
        assert!(self.gathering, "gather requires the gathered layout");
        use rayon::prelude::*;
        let counter = &self.counters[stage.index()];
        counter.store(0, Ordering::Relaxed);
        let base_offset = self.offset(stage);
        let block_count = self.state_count.div_ceil(GATHER_BLOCK);
        (0..block_count).into_par_iter().for_each(|block| {
            let start = (block * GATHER_BLOCK) as u32;
            let end = ((block + 1) * GATHER_BLOCK).min(self.state_count) as u32;
            let mut local = [0u32; GATHER_BLOCK];
            let mut local_count = 0usize;
            for id in start..end {
                if states.read_kernel_index(id) == stage {
                    local[local_count] = id;
                    local_count += 1;
                }
            }
            if local_count == 0 {
                return;
            }
            let slot = counter.fetch_add(local_count as u32, Ordering::Relaxed);
            for (k, &id) in local[..local_count].iter().enumerate() {
                self.shared_index.set(base_offset + slot + k as u32, id);
            }
        });
        counter.load(Ordering::Relaxed)
    }

    /// Rebuilds the Surface list ordered by material tag. The light
    /// store's tag counters must hold the per-tag population; they are
    /// consumed and reset.
    pub fn gather_sorted_by_tag(
        &self,
        states: &PathStateSoa,
        lights: &LightSampleSoa,
    ) -> u32 {
        assert!(self.gathering, "tag sort requires the gathered layout");
        use rayon::prelude::*;
        let stage = KernelState::Surface;
        let base_offset = self.offset(stage);
        // the counter already holds the parked membership count; the
        // scan below writes exactly that many slots
        let total = self.counters[stage.index()].load(Ordering::Relaxed);
        // turns the per-tag populations into write cursors
        lights.tag_offsets();
        (0..self.state_count as u32).into_par_iter().for_each(|id| {
            if states.read_kernel_index(id) != stage {
                return;
            }
            let tag = lights.read_surface_tag(id);
            let slot = lights.bump_tag_cursor(tag);
            debug_assert!(slot < total);
            self.shared_index.set(base_offset + slot, id);
        });
        lights.reset_tags();
        total
    }

    /// Entry `k` of `stage` under the current snapshot/gather.
    pub fn entry(&self, stage: KernelState, k: u32) -> u32 {
        if self.gathering {
            self.shared_index.get(self.offset(stage) + k)
        } else {
            self.stage_index[stage.index()].get(k)
        }
    }

    pub fn set_entry(&self, stage: KernelState, k: u32, id: u32) {
        if self.gathering {
            self.shared_index.set(self.offset(stage) + k, id);
        } else {
            self.stage_index[stage.index()].set(k, id);
        }
    }

    /// Snapshot copy of the first `n` entries of `stage`; the dispatch
    /// input. The copy is what keeps scattered-mode pushes from
    /// recycling slots a running sweep still reads.
    pub fn entries(&self, stage: KernelState, n: u32) -> Vec<u32> {
        (0..n).map(|k| self.entry(stage, k)).collect()
    }
}

/// Shared context for the relocation passes.
pub struct CompactionIo<'a> {
    pub states: &'a PathStateSoa,
    pub lights: &'a LightSampleSoa,
    pub sampler: &'a dyn Sampler,
    pub use_tag_sort: bool,
}

impl CompactionIo<'_> {
    fn relocate(&self, gathering: bool, from: u32, to: u32) {
        self.states.move_state(from, to);
        if gathering {
            if self.states.read_kernel_index(from) == KernelState::Surface {
                self.lights.move_state(from, to, self.use_tag_sort);
            }
        } else {
            self.lights.move_state(from, to, self.use_tag_sort);
        }
        self.sampler.save(to, self.sampler.load(from));
    }
}

/// Collects the invalid ids below the watermark: the free slots
/// compaction hands out to active paths above it.
pub fn free_slots_below(invalid_entries: &[u32], watermark: u32) -> Vec<u32> {
    invalid_entries
        .iter()
        .copied()
        .filter(|&id| id < watermark)
        .collect()
}

/// Moves every member of `stage` with id >= `watermark` into a free
/// slot below it, rewriting the queue entry in place. After the pass
/// over all stages, every active path occupies an id in
/// `[0, watermark)`.
pub fn compact_stage(
    queues: &QueueSet,
    stage: KernelState,
    watermark: u32,
    free: &[u32],
    cursor: &AtomicU32,
    io: &CompactionIo<'_>,
) {
    use rayon::prelude::*;
    let count = queues.count(stage);
    (0..count).into_par_iter().for_each(|k| {
        let id = queues.entry(stage, k);
        if id < watermark {
            return;
        }
        let slot = cursor.fetch_add(1, Ordering::Relaxed);
        debug_assert!((slot as usize) < free.len(), "free list exhausted");
        let new_id = free[slot as usize];
        io.relocate(queues.gathering(), id, new_id);
        queues.set_entry(stage, k, new_id);
        if queues.gathering() {
            io.states.write_kernel_index(id, KernelState::Invalid);
        }
    });
}

/// Packs the members of `stage` contiguously at `[dest_offset,
/// dest_offset + count)`. Ran per stage with descending offsets, this
/// leaves all active ids sorted by stage at the tail of the id range so
/// freshly generated paths take the low ids.
pub fn order_stage(
    queues: &QueueSet,
    stage: KernelState,
    dest_offset: u32,
    io: &CompactionIo<'_>,
) {
    use rayon::prelude::*;
    let count = queues.count(stage);
    (0..count).into_par_iter().for_each(|k| {
        let id = queues.entry(stage, k);
        let new_id = dest_offset + k;
        if id == new_id {
            return;
        }
        // Sources sit below the watermark after compaction and the
        // destination window starts past it, so the moves are disjoint.
        io.relocate(queues.gathering(), id, new_id);
        queues.set_entry(stage, k, new_id);
        if queues.gathering() {
            io.states.write_kernel_index(id, KernelState::Invalid);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::sampler::IndependentSampler;
    use lumen_core::spectrum::RgbSpectrum;

    fn gathered_fixture(state_count: usize) -> (QueueSet, PathStateSoa, LightSampleSoa) {
        let states = PathStateSoa::new(&RgbSpectrum, state_count, true);
        let lights = LightSampleSoa::new(3, state_count, 0);
        (QueueSet::new(state_count, true), states, lights)
    }

    #[test]
    fn push_and_snapshot_count() {
        let (queues, _, _) = gathered_fixture(64);
        for id in 0..10 {
            queues.push(KernelState::Intersect, id);
        }
        queues.snapshot_counters();
        assert_eq!(queues.count(KernelState::Intersect), 10);
        assert!(queues.any_active());
    }

    #[test]
    fn gather_rebuilds_the_stage_list() {
        let (queues, states, _) = gathered_fixture(1024);
        for id in 0..1024u32 {
            let stage = if id % 3 == 0 {
                KernelState::Surface
            } else {
                KernelState::Invalid
            };
            states.write_kernel_index(id, stage);
            queues.push(stage, id);
        }
        queues.snapshot_counters();
        let rebuilt = queues.gather(KernelState::Surface, &states);
        assert_eq!(rebuilt, 342);
        let mut entries = queues.entries(KernelState::Surface, rebuilt);
        entries.sort_unstable();
        let expected: Vec<u32> = (0..1024).filter(|id| id % 3 == 0).collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn no_path_id_lands_in_two_stage_lists() {
        // queue-snapshot ownership: after a gather of every stage, each
        // id appears in exactly the list its kernel_index names
        let (queues, states, _) = gathered_fixture(512);
        for id in 0..512u32 {
            let stage = KernelState::ALL[(id % 6) as usize];
            states.write_kernel_index(id, stage);
            queues.push(stage, id);
        }
        queues.snapshot_counters();
        let mut seen = vec![0u8; 512];
        for &stage in &KernelState::ALL[1..] {
            let n = queues.gather(stage, &states);
            for id in queues.entries(stage, n) {
                seen[id as usize] += 1;
                assert_eq!(states.read_kernel_index(id), stage);
            }
        }
        for (id, &count) in seen.iter().enumerate() {
            let expected = u8::from(id % 6 != 0);
            assert_eq!(count, expected, "path {id} owned {count} times");
        }
    }

    #[test]
    fn compaction_moves_actives_below_the_watermark() {
        // 1024 states, every other path terminated
        let state_count = 1024u32;
        let (queues, states, lights) = gathered_fixture(state_count as usize);
        let mut sampler = IndependentSampler::default();
        lumen_core::sampler::Sampler::reset(
            &mut sampler,
            glam::UVec2::new(32, 32),
            state_count as usize,
            1,
        );
        queues.reset_invalid(&states);
        queues.clear_all();
        for id in 0..state_count {
            let stage = if id % 2 == 0 {
                KernelState::Intersect
            } else {
                KernelState::Invalid
            };
            states.write_kernel_index(id, stage);
            states.write_pixel_index(id, id);
            queues.push(stage, id);
        }
        queues.snapshot_counters();
        let active = queues.count(KernelState::Intersect);
        assert_eq!(active, 512);
        let watermark = active;

        queues.gather(KernelState::Invalid, &states);
        let invalid_entries = queues.entries(KernelState::Invalid, 512);
        let free = free_slots_below(&invalid_entries, watermark);
        assert_eq!(free.len(), 256, "odd ids below 512");

        let io = CompactionIo {
            states: &states,
            lights: &lights,
            sampler: &sampler,
            use_tag_sort: false,
        };
        let cursor = AtomicU32::new(0);
        queues.gather(KernelState::Intersect, &states);
        compact_stage(&queues, KernelState::Intersect, watermark, &free, &cursor, &io);

        // all active ids now sit in [0, 512) and the ids above are free
        for k in 0..active {
            let id = queues.entry(KernelState::Intersect, k);
            assert!(id < watermark, "entry {k} still at {id}");
            assert_eq!(states.read_kernel_index(id), KernelState::Intersect);
        }
        for id in watermark..state_count {
            assert_eq!(states.read_kernel_index(id), KernelState::Invalid);
        }
        // the payload moved with the path
        let mut pixels: Vec<u32> = (0..active)
            .map(|k| states.read_pixel_index(queues.entry(KernelState::Intersect, k)))
            .collect();
        pixels.sort_unstable();
        let expected: Vec<u32> = (0..state_count).filter(|id| id % 2 == 0).collect();
        assert_eq!(pixels, expected);
    }

    #[test]
    fn compaction_survives_random_termination_patterns() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xC0FFEE);
        for _ in 0..8 {
            let state_count = 1024u32;
            let (queues, states, lights) = gathered_fixture(state_count as usize);
            let mut sampler = IndependentSampler::default();
            lumen_core::sampler::Sampler::reset(
                &mut sampler,
                glam::UVec2::new(32, 32),
                state_count as usize,
                1,
            );
            queues.reset_invalid(&states);
            queues.clear_all();
            let mut active = 0u32;
            for id in 0..state_count {
                let stage = if rng.random_bool(0.5) {
                    active += 1;
                    KernelState::Intersect
                } else {
                    KernelState::Invalid
                };
                states.write_kernel_index(id, stage);
                states.write_pixel_index(id, id);
                queues.push(stage, id);
            }
            queues.snapshot_counters();
            let watermark = active;
            queues.gather(KernelState::Invalid, &states);
            let invalid = queues.entries(
                KernelState::Invalid,
                queues.live_count(KernelState::Invalid),
            );
            let free = free_slots_below(&invalid, watermark);
            let io = CompactionIo {
                states: &states,
                lights: &lights,
                sampler: &sampler,
                use_tag_sort: false,
            };
            let cursor = AtomicU32::new(0);
            queues.gather(KernelState::Intersect, &states);
            compact_stage(&queues, KernelState::Intersect, watermark, &free, &cursor, &io);
            for id in 0..watermark {
                assert_eq!(states.read_kernel_index(id), KernelState::Intersect);
            }
            for id in watermark..state_count {
                assert_eq!(states.read_kernel_index(id), KernelState::Invalid);
            }
        }
    }

    #[test]
    fn ordering_packs_actives_at_the_tail_by_stage() {
        let state_count = 256u32;
        let (queues, states, lights) = gathered_fixture(state_count as usize);
        let mut sampler = IndependentSampler::default();
        lumen_core::sampler::Sampler::reset(
            &mut sampler,
            glam::UVec2::new(16, 16),
            state_count as usize,
            1,
        );
        queues.reset_invalid(&states);
        queues.clear_all();
        // a few actives spread over two stages, all below the watermark
        let intersect: Vec<u32> = vec![3, 10, 17];
        let surface: Vec<u32> = vec![5, 21];
        for &id in &intersect {
            states.write_kernel_index(id, KernelState::Intersect);
            queues.push(KernelState::Intersect, id);
        }
        for &id in &surface {
            states.write_kernel_index(id, KernelState::Surface);
            queues.push(KernelState::Surface, id);
        }
        queues.snapshot_counters();
        let io = CompactionIo {
            states: &states,
            lights: &lights,
            sampler: &sampler,
            use_tag_sort: false,
        };
        let mut offset = state_count;
        for &stage in KernelState::ALL[1..].iter() {
            let count = queues.count(stage);
            if count == 0 {
                continue;
            }
            offset -= count;
            queues.gather(stage, &states);
            order_stage(&queues, stage, offset, &io);
        }
        // tail layout: [.., surface x2, intersect x3] by descending
        // stage enumeration order
        assert_eq!(states.read_kernel_index(255), KernelState::Intersect);
        assert_eq!(states.read_kernel_index(254), KernelState::Intersect);
        assert_eq!(states.read_kernel_index(253), KernelState::Intersect);
        assert_eq!(states.read_kernel_index(252), KernelState::Surface);
        assert_eq!(states.read_kernel_index(251), KernelState::Surface);
        for id in 0..251 {
            assert_eq!(states.read_kernel_index(id), KernelState::Invalid);
        }
    }
}
