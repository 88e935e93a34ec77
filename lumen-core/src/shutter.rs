//! Shutter model: motion blur is realized by distributing the source
//! samples over `(time, weight, spp)` entries; the scheduler updates the
//! scene to each entry's time before issuing its samples.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShutterSample {
    pub time: f32,
    pub weight: f32,
    pub spp: u32,
}

impl ShutterSample {
    pub fn new(time: f32, weight: f32, spp: u32) -> Self {
        Self { time, weight, spp }
    }
}

/// A single instantaneous exposure carrying all samples at weight one.
pub fn instantaneous(spp: u32) -> Vec<ShutterSample> {
    vec![ShutterSample::new(0.0, 1.0, spp)]
}

/// Evenly spread `spp` over `steps` times across `[open, close]`.
pub fn uniform_exposure(open: f32, close: f32, steps: u32, spp: u32) -> Vec<ShutterSample> {
    debug_assert!(steps >= 1);
    let base = spp / steps;
    let extra = spp % steps;
    (0..steps)
        .map(|i| {
            let t = if steps == 1 {
                0.5 * (open + close)
            } else {
                open + (close - open) * i as f32 / (steps - 1) as f32
            };
            ShutterSample::new(t, 1.0, base + u32::from(i < extra))
        })
        .filter(|s| s.spp > 0)
        .collect()
}

pub fn total_spp(samples: &[ShutterSample]) -> u32 {
    samples.iter().map(|s| s.spp).sum()
}
