//! Megakernel path tracer.
//!
//! One fused kernel replaces the queue machinery with a per-block
//! mini-scheduler: every block owns a fixed set of path slots, counts
//! them per stage each iteration, sorts the slot ids by stage so
//! neighbouring lanes run the same stage, and lets invalid slots pull
//! fresh source samples from a global workload counter. Preferable when
//! the surface closures are cheap relative to queue traffic.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{UVec2, Vec2, Vec3};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use lumen_core::camera::Camera;
use lumen_core::error::{RenderError, RenderResult};
use lumen_core::film::Film;
use lumen_core::math::{balance_heuristic, DELTA_PDF};
use lumen_core::ray::{Hit, Ray};
use lumen_core::sampler::{IndependentSampler, Sampler};
use lumen_core::shutter::{total_spp, ShutterSample};
use lumen_core::spectrum::{RgbSpectrum, SampledSpectrum, SampledWavelengths, Spectrum};
use lumen_scene::geometry::Geometry;
use lumen_scene::light::LightSampler;
use lumen_scene::surface::SurfaceDesc;
use lumen_scene::RenderScene;

use crate::path_state::{KernelState, KERNEL_COUNT};
use crate::transport::{shade_surface, StoredLightSample, TransportParams};
use crate::{Integrator, RenderStats};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegakernelConfig {
    pub max_depth: u32,
    pub rr_depth: u32,
    pub rr_threshold: f32,
    /// Number of independent blocks (worker tasks).
    pub block_count: usize,
    /// Concurrent path slots per block.
    pub block_size: usize,
    /// Source samples fetched per slot per workload window.
    pub fetch_size: usize,
}

impl Default for MegakernelConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            rr_depth: 0,
            rr_threshold: 0.95,
            block_count: 256,
            block_size: 64,
            fetch_size: 128,
        }
    }
}

impl MegakernelConfig {
    pub fn validate(&self) -> RenderResult<()> {
        if self.max_depth < 1 {
            return Err(RenderError::InvalidConfig("max_depth must be >= 1".into()));
        }
        if !(0.05..=1.0).contains(&self.rr_threshold) {
            return Err(RenderError::InvalidConfig(
                "rr_threshold must lie in [0.05, 1]".into(),
            ));
        }
        if self.block_count == 0 || self.block_size == 0 || self.fetch_size == 0 {
            return Err(RenderError::InvalidConfig(
                "block_count, block_size and fetch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    fn params(&self) -> TransportParams {
        TransportParams {
            max_depth: self.max_depth,
            rr_depth: self.rr_depth,
            rr_threshold: self.rr_threshold,
        }
    }
}

/// Block-local path slot; what a fused GPU kernel would keep in shared
/// memory.
#[derive(Clone)]
struct Slot {
    stage: KernelState,
    ray: Ray,
    hit: Hit,
    beta: SampledSpectrum,
    wl_sample: f32,
    pdf_bsdf: f32,
    eta_scale: f32,
    depth: u32,
    pixel_index: u32,
    light: StoredLightSample,
}

impl Slot {
    fn invalid(dim: u32) -> Self {
        Self {
            stage: KernelState::Invalid,
            ray: Ray::default(),
            hit: Hit::miss(),
            beta: SampledSpectrum::zero(dim),
            wl_sample: 0.0,
            pdf_bsdf: DELTA_PDF,
            eta_scale: 1.0,
            depth: 0,
            pixel_index: 0,
            light: StoredLightSample {
                wi: Vec3::Z,
                pdf: 0.0,
                emission: SampledSpectrum::zero(dim),
            },
        }
    }

    fn swl(&self, spectrum: &dyn Spectrum) -> SampledWavelengths {
        if spectrum.is_fixed() {
            return spectrum.sample(0.0);
        }
        let mut swl = spectrum.sample(self.wl_sample.abs());
        if self.wl_sample < 0.0 {
            swl.terminate_secondary();
        }
        swl
    }
}

pub struct MegakernelPathTracer {
    config: MegakernelConfig,
    spectrum: Box<dyn Spectrum>,
    sampler: Box<dyn Sampler>,
}

impl MegakernelPathTracer {
    pub fn new(config: MegakernelConfig) -> Self {
        Self {
            config,
            spectrum: Box::new(RgbSpectrum),
            sampler: Box::new(IndependentSampler::default()),
        }
    }

    pub fn with_spectrum(mut self, spectrum: Box<dyn Spectrum>) -> Self {
        self.spectrum = spectrum;
        self
    }

    pub fn with_sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn config(&self) -> &MegakernelConfig {
        &self.config
    }
}

/// Per-shutter-sample context shared by all blocks.
struct MegaCtx<'a> {
    geometry: &'a dyn Geometry,
    light_sampler: &'a dyn LightSampler,
    surfaces: &'a [SurfaceDesc],
    has_environment: bool,
    light_count: usize,
    spectrum: &'a dyn Spectrum,
    sampler: &'a dyn Sampler,
    camera: &'a dyn Camera,
    film: &'a Film,
    resolution: UVec2,
    pixel_count: u32,
    params: TransportParams,
    config: &'a MegakernelConfig,
    /// Next unconsumed source sample.
    workload: &'a AtomicU64,
    total_samples: u64,
    base_spp: u32,
    time: f32,
    shutter_weight: f32,
}

impl MegaCtx<'_> {
    #[inline]
    fn pixel_coord(&self, pixel_id: u32) -> UVec2 {
        UVec2::new(pixel_id % self.resolution.x, pixel_id / self.resolution.x)
    }

    fn generate(&self, slot: &mut Slot, sampler_id: u32, work_id: u64) {
        let pixel_id = (work_id % self.pixel_count as u64) as u32;
        let sample_id = self.base_spp + (work_id / self.pixel_count as u64) as u32;
        let pixel = self.pixel_coord(pixel_id);
        self.film.accumulate(pixel, Vec3::ZERO, 1.0);

        let mut stream = self.sampler.start(pixel, sample_id);
        let u_filter = self.sampler.next_2d(&mut stream);
        let u_lens = if self.camera.requires_lens_sampling() {
            self.sampler.next_2d(&mut stream)
        } else {
            Vec2::splat(0.5)
        };
        let u_wavelength = if self.spectrum.is_fixed() {
            0.0
        } else {
            self.sampler.next_1d(&mut stream).max(1e-6)
        };
        self.sampler.save(sampler_id, stream);

        let camera_sample = self
            .camera
            .generate_ray(pixel, self.time, u_filter, u_lens);
        slot.ray = camera_sample.ray;
        slot.wl_sample = u_wavelength;
        slot.beta = SampledSpectrum::splat(
            self.spectrum.dimension(),
            self.shutter_weight * camera_sample.weight,
        );
        slot.pdf_bsdf = DELTA_PDF;
        slot.eta_scale = 1.0;
        slot.pixel_index = pixel_id;
        slot.depth = 0;
        slot.stage = KernelState::Intersect;
    }

    fn intersect(&self, slot: &mut Slot) {
        let hit = self.geometry.trace_closest(&slot.ray);
        slot.hit = hit;
        if hit.is_miss() {
            slot.stage = if self.has_environment {
                KernelState::Miss
            } else {
                KernelState::Invalid
            };
            return;
        }
        let info = self.geometry.instance(hit.inst);
        slot.stage = if info.has_light() {
            KernelState::Light
        } else if info.has_surface() {
            KernelState::Sample
        } else {
            KernelState::Invalid
        };
    }

    fn miss(&self, slot: &mut Slot) {
        if self.has_environment {
            let swl = slot.swl(self.spectrum);
            let eval = self
                .light_sampler
                .evaluate_miss(slot.ray.direction(), &swl, self.time);
            let mis_weight = balance_heuristic(slot.pdf_bsdf, eval.pdf);
            let li = slot.beta * eval.l * mis_weight;
            let pixel = self.pixel_coord(slot.pixel_index);
            self.film
                .accumulate(pixel, self.spectrum.srgb(&swl, &li), 0.0);
        }
        slot.stage = KernelState::Invalid;
    }

    fn light(&self, slot: &mut Slot) {
        if self.light_count == 0 {
            slot.stage = KernelState::Invalid;
            return;
        }
        let swl = slot.swl(self.spectrum);
        let it = self.geometry.interaction(&slot.ray, &slot.hit);
        let eval = self
            .light_sampler
            .evaluate_hit(&it, slot.ray.origin(), &swl, self.time);
        let mis_weight = balance_heuristic(slot.pdf_bsdf, eval.pdf);
        let li = slot.beta * eval.l * mis_weight;
        let pixel = self.pixel_coord(slot.pixel_index);
        self.film
            .accumulate(pixel, self.spectrum.srgb(&swl, &li), 0.0);
        slot.stage = if it.has_surface() {
            KernelState::Sample
        } else {
            KernelState::Invalid
        };
    }

    fn sample_light(&self, slot: &mut Slot, sampler_id: u32) {
        let mut stream = self.sampler.load(sampler_id);
        let u_sel = self.sampler.next_1d(&mut stream);
        let u_surf = self.sampler.next_2d(&mut stream);
        self.sampler.save(sampler_id, stream);

        let it = self.geometry.interaction(&slot.ray, &slot.hit);
        let swl = slot.swl(self.spectrum);
        let light_sample = self
            .light_sampler
            .sample(&it, u_sel, u_surf, &swl, self.time);
        let occluded = self.geometry.trace_any(&light_sample.shadow_ray);
        let visibility = if occluded { 0.0 } else { 1.0 };
        slot.light = StoredLightSample {
            wi: light_sample.shadow_ray.direction(),
            pdf: visibility * light_sample.eval.pdf,
            emission: light_sample.eval.l * visibility,
        };
        slot.stage = KernelState::Surface;
    }

    fn surface(&self, slot: &mut Slot, sampler_id: u32) {
        let mut stream = self.sampler.load(sampler_id);
        let u_lobe = self.sampler.next_1d(&mut stream);
        let u_bsdf = self.sampler.next_2d(&mut stream);
        let u_rr = if slot.depth + 1 >= self.params.rr_depth {
            self.sampler.next_1d(&mut stream)
        } else {
            0.0
        };
        self.sampler.save(sampler_id, stream);

        let it = self.geometry.interaction(&slot.ray, &slot.hit);
        let mut swl = slot.swl(self.spectrum);
        let pixel = self.pixel_coord(slot.pixel_index);
        let outcome = shade_surface(
            self.surfaces,
            self.spectrum,
            self.film,
            &self.params,
            &it,
            &slot.ray,
            &mut swl,
            slot.beta,
            slot.depth,
            slot.eta_scale,
            pixel,
            &slot.light,
            u_lobe,
            u_bsdf,
            u_rr,
        );
        if outcome.terminated_secondary {
            slot.wl_sample = -slot.wl_sample.abs();
        }
        if outcome.terminated {
            slot.stage = KernelState::Invalid;
            return;
        }
        if outcome.advance_depth {
            slot.depth += 1;
        }
        slot.beta = outcome.beta;
        slot.ray = outcome.ray;
        slot.pdf_bsdf = outcome.pdf_bsdf;
        slot.eta_scale = outcome.eta_scale;
        slot.stage = KernelState::Intersect;
    }

    /// Runs one block until the global workload and its local slots are
    /// both exhausted. Returns the number of scheduler iterations.
    fn run_block(&self, block: usize) -> u64 {
        let block_size = self.config.block_size;
        let mut slots = vec![Slot::invalid(self.spectrum.dimension()); block_size];
        let chunk = (block_size * self.config.fetch_size) as u64;
        let mut lo = 0u64;
        let mut hi = 0u64;
        let mut rem_global = true;
        let mut iterations = 0u64;

        loop {
            iterations += 1;
            // count the stages
            let mut counts = [0u32; KERNEL_COUNT];
            for slot in &slots {
                counts[slot.stage.index()] += 1;
            }
            let rem_local = counts[1..].iter().any(|&c| c > 0);
            if lo >= hi && rem_global {
                lo = self.workload.fetch_add(chunk, Ordering::Relaxed);
                hi = (lo + chunk).min(self.total_samples);
                if lo >= self.total_samples {
                    rem_global = false;
                }
            }
            if !rem_global && lo >= hi && !rem_local {
                break;
            }

            // sort slot ids by stage so a warp-shaped sweep sees one
            // stage at a time
            let mut offsets = [0u32; KERNEL_COUNT];
            let mut prev = 0;
            for i in 0..KERNEL_COUNT {
                offsets[i] = prev;
                prev += counts[i];
            }
            let mut order = vec![0u32; block_size];
            let mut cursors = offsets;
            for (slot_id, slot) in slots.iter().enumerate() {
                let stage = slot.stage.index();
                order[cursors[stage] as usize] = slot_id as u32;
                cursors[stage] += 1;
            }

            let invalid_count = counts[KernelState::Invalid.index()] as u64;
            for (rank, &slot_id) in order.iter().enumerate() {
                let sampler_id = (block * block_size + slot_id as usize) as u32;
                let slot = &mut slots[slot_id as usize];
                match slot.stage {
                    KernelState::Invalid => {
                        let work_id = lo + rank as u64;
                        if work_id < hi {
                            self.generate(slot, sampler_id, work_id);
                        }
                    }
                    KernelState::Intersect => self.intersect(slot),
                    KernelState::Miss => self.miss(slot),
                    KernelState::Light => self.light(slot),
                    KernelState::Sample => self.sample_light(slot, sampler_id),
                    KernelState::Surface => self.surface(slot, sampler_id),
                }
            }
            lo += invalid_count;
        }
        iterations
    }
}

impl Integrator for MegakernelPathTracer {
    fn render(
        &mut self,
        scene: &mut dyn RenderScene,
        camera: &dyn Camera,
        shutter: &[ShutterSample],
    ) -> RenderResult<RenderStats> {
        self.config.validate()?;
        if !scene.has_lighting() {
            warn!("No lights in scene. Rendering aborted.");
            return Ok(RenderStats::default());
        }

        let resolution = camera.film().resolution();
        let pixel_count = resolution.x * resolution.y;
        let spp = total_spp(shutter);
        let launch_size = self.config.block_count * self.config.block_size;
        info!(
            "Megakernel path tracing configurations: resolution = {}x{}, spp = {}, {} blocks x {} slots.",
            resolution.x, resolution.y, spp, self.config.block_count, self.config.block_size
        );

        self.sampler.reset(resolution, launch_size, spp);
        camera.film().prepare();

        let mut stats = RenderStats {
            spp,
            ..Default::default()
        };
        let mut shutter_spp = 0u32;
        for s in shutter {
            scene.update(s.time);
            let workload = AtomicU64::new(0);
            let ctx = MegaCtx {
                geometry: scene.geometry(),
                light_sampler: scene.light_sampler(),
                surfaces: scene.surfaces(),
                has_environment: scene.has_environment(),
                light_count: scene.light_count(),
                spectrum: self.spectrum.as_ref(),
                sampler: self.sampler.as_ref(),
                camera,
                film: camera.film(),
                resolution,
                pixel_count,
                params: self.config.params(),
                config: &self.config,
                workload: &workload,
                total_samples: s.spp as u64 * pixel_count as u64,
                base_spp: shutter_spp,
                time: s.time,
                shutter_weight: s.weight,
            };
            let iterations: u64 = (0..self.config.block_count)
                .into_par_iter()
                .map(|block| ctx.run_block(block))
                .sum();
            stats.iterations += iterations;
            shutter_spp += s.spp;
        }
        info!("Megakernel rendering finished after {} block iterations.", stats.iterations);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        MegakernelConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let config = MegakernelConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
