//! Per-path sample streams.
//!
//! Wavefront kernels suspend paths at every stage boundary, so the
//! sampler exposes an indexed save/load of its stream state: a kernel
//! loads the state for a path id, draws what it needs, and saves the
//! state back before the path parks in its next queue.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{UVec2, Vec2};

/// Opaque per-path stream state. Small enough to live in the path-state
/// store's save slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplerState(u64);

/// Sample source for path generation and transport decisions.
pub trait Sampler: Send + Sync {
    /// Sizes the save-slot table; must be called before rendering.
    fn reset(&mut self, resolution: UVec2, state_count: usize, spp: u32);

    /// Begins the stream for `(pixel, sample_index)`.
    fn start(&self, pixel: UVec2, sample_index: u32) -> SamplerState;

    /// Parks the stream state for `path_id`.
    fn save(&self, path_id: u32, state: SamplerState);

    /// Resumes the stream state parked for `path_id`.
    fn load(&self, path_id: u32) -> SamplerState;

    fn next_1d(&self, state: &mut SamplerState) -> f32;

    fn next_2d(&self, state: &mut SamplerState) -> Vec2 {
        let x = self.next_1d(state);
        let y = self.next_1d(state);
        Vec2::new(x, y)
    }
}

const PCG_MULT: u64 = 6364136223846793005;
const PCG_INC: u64 = 1442695040888963407;

#[inline]
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 33)).wrapping_mul(0xff51_afd7_ed55_8ccd);
    z = (z ^ (z >> 33)).wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    z ^ (z >> 33)
}

#[inline]
fn pcg_next(state: &mut u64) -> u32 {
    let old = *state;
    *state = old.wrapping_mul(PCG_MULT).wrapping_add(PCG_INC);
    let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
    let rot = (old >> 59) as u32;
    xorshifted.rotate_right(rot)
}

/// Independent per-pixel PCG streams.
///
/// Streams are a pure function of `(pixel, sample_index, seed)`, so an
/// image is reproducible regardless of how paths were scheduled across
/// kernels.
pub struct IndependentSampler {
    seed: u64,
    saved: Vec<AtomicU64>,
}

impl IndependentSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            saved: Vec::new(),
        }
    }
}

impl Default for IndependentSampler {
    fn default() -> Self {
        Self::new(0x9e37_79b9_7f4a_7c15)
    }
}

impl Sampler for IndependentSampler {
    fn reset(&mut self, _resolution: UVec2, state_count: usize, _spp: u32) {
        self.saved = (0..state_count).map(|_| AtomicU64::new(0)).collect();
    }

    fn start(&self, pixel: UVec2, sample_index: u32) -> SamplerState {
        let pixel_bits = ((pixel.y as u64) << 32) | pixel.x as u64;
        let state = mix64(self.seed ^ mix64(pixel_bits ^ mix64(sample_index as u64 ^ 0x5bf0_3635)));
        SamplerState(state)
    }

    fn save(&self, path_id: u32, state: SamplerState) {
        self.saved[path_id as usize].store(state.0, Ordering::Relaxed);
    }

    fn load(&self, path_id: u32) -> SamplerState {
        SamplerState(self.saved[path_id as usize].load(Ordering::Relaxed))
    }

    fn next_1d(&self, state: &mut SamplerState) -> f32 {
        // 24 mantissa bits keep the sample strictly below one.
        (pcg_next(&mut state.0) >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }
}
