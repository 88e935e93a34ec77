//! Film accumulation.
//!
//! Every stage kernel may add radiance to any pixel concurrently, so the
//! film is a flat `[r, g, b, weight]` grid of lock-free float adders.
//! The image is deterministic only up to floating-point associativity of
//! the add order.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::{UVec2, Vec3};

/// A float accumulator implemented as a CAS loop over the bit pattern;
/// the CPU stand-in for the device's atomic float add.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn fetch_add(&self, delta: f32) -> f32 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return f32::from_bits(current),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Per-camera radiance accumulator.
pub struct Film {
    resolution: UVec2,
    /// `[r, g, b, weight]` per pixel.
    pixels: Vec<[AtomicF32; 4]>,
    clamp: f32,
}

impl Film {
    pub fn new(resolution: UVec2) -> Self {
        Self::with_clamp(resolution, 1e3)
    }

    /// `clamp` bounds each accumulated channel to `[-clamp, clamp]`;
    /// negative radiance is kept as a gradient carrier.
    pub fn with_clamp(resolution: UVec2, clamp: f32) -> Self {
        let count = (resolution.x * resolution.y) as usize;
        let pixels = (0..count).map(|_| Default::default()).collect();
        Self {
            resolution,
            pixels,
            clamp,
        }
    }

    #[inline]
    pub fn resolution(&self) -> UVec2 {
        self.resolution
    }

    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    #[inline]
    pub fn clamp(&self) -> f32 {
        self.clamp
    }

    /// Clears the accumulator before a render.
    pub fn prepare(&self) {
        for px in &self.pixels {
            for channel in px {
                channel.store(0.0);
            }
        }
    }

    /// Adds `rgb` and `weight` into the pixel. Radiance-only splats pass
    /// a zero weight; the generation kernel passes radiance zero and
    /// weight one so the per-pixel weight ends up equal to the spp it
    /// was actually served.
    pub fn accumulate(&self, pixel: UVec2, rgb: Vec3, weight: f32) {
        debug_assert!(pixel.x < self.resolution.x && pixel.y < self.resolution.y);
        let index = (pixel.y * self.resolution.x + pixel.x) as usize;
        let px = &self.pixels[index];
        let rgb = rgb.clamp(Vec3::splat(-self.clamp), Vec3::splat(self.clamp));
        // NaNs never enter the film; beta is scrubbed upstream, this is
        // the last line of defense for degenerate pdfs.
        if rgb.is_finite() {
            px[0].fetch_add(rgb.x);
            px[1].fetch_add(rgb.y);
            px[2].fetch_add(rgb.z);
        }
        if weight != 0.0 {
            px[3].fetch_add(weight);
        }
    }

    /// Raw `[r, g, b, weight]` of a pixel.
    pub fn pixel(&self, pixel: UVec2) -> [f32; 4] {
        let index = (pixel.y * self.resolution.x + pixel.x) as usize;
        let px = &self.pixels[index];
        [px[0].load(), px[1].load(), px[2].load(), px[3].load()]
    }

    /// Weight-normalized image in scanline order.
    pub fn develop(&self) -> Vec<Vec3> {
        self.pixels
            .iter()
            .map(|px| {
                let w = px[3].load();
                let rgb = Vec3::new(px[0].load(), px[1].load(), px[2].load());
                if w > 0.0 {
                    rgb / w
                } else {
                    Vec3::ZERO
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_float_adds_accumulate() {
        let a = AtomicF32::new(1.0);
        a.fetch_add(2.5);
        a.fetch_add(-0.5);
        assert_eq!(a.load(), 3.0);
    }

    #[test]
    fn develop_normalizes_by_weight() {
        let film = Film::new(UVec2::new(2, 1));
        film.accumulate(UVec2::new(0, 0), Vec3::ZERO, 1.0);
        film.accumulate(UVec2::new(0, 0), Vec3::ZERO, 1.0);
        film.accumulate(UVec2::new(0, 0), Vec3::splat(4.0), 0.0);
        let image = film.develop();
        assert_eq!(image[0], Vec3::splat(2.0));
        assert_eq!(image[1], Vec3::ZERO);
    }

    #[test]
    fn accumulate_clamps_but_keeps_negatives() {
        let film = Film::with_clamp(UVec2::new(1, 1), 10.0);
        film.accumulate(UVec2::new(0, 0), Vec3::new(100.0, -100.0, 1.0), 1.0);
        let px = film.pixel(UVec2::new(0, 0));
        assert_eq!(px[0], 10.0);
        assert_eq!(px[1], -10.0);
        assert_eq!(px[2], 1.0);
    }

    #[test]
    fn concurrent_accumulation_is_lossless() {
        use std::sync::Arc;
        let film = Arc::new(Film::new(UVec2::new(1, 1)));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let film = film.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        film.accumulate(UVec2::new(0, 0), Vec3::ONE, 1.0);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let px = film.pixel(UVec2::new(0, 0));
        assert_eq!(px[3], 4000.0);
        assert_eq!(px[0], 4000.0);
    }
}
