//! Wavefront path tracer.
//!
//! The path loop is decomposed into six stage kernels connected by
//! per-stage queues; the host scheduler inspects queue sizes each
//! iteration and either refills the pool with freshly generated camera
//! paths or dispatches the non-empty stages. A kernel dispatch is a
//! parallel sweep over a snapshot of its input queue; the sweep
//! boundary is the dispatch barrier of the device model.

use std::sync::atomic::AtomicU32;

use glam::{UVec2, Vec2, Vec3};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use lumen_core::camera::Camera;
use lumen_core::error::{RenderError, RenderResult};
use lumen_core::film::Film;
use lumen_core::math::{balance_heuristic, DELTA_PDF};
use lumen_core::sampler::{IndependentSampler, Sampler};
use lumen_core::shutter::{total_spp, ShutterSample};
use lumen_core::spectrum::{RgbSpectrum, SampledSpectrum, Spectrum};
use lumen_scene::geometry::Geometry;
use lumen_scene::light::LightSampler;
use lumen_scene::surface::SurfaceDesc;
use lumen_scene::RenderScene;

use crate::path_state::{KernelState, LightSampleSoa, PathStateSoa};
use crate::queue::{compact_stage, free_slots_below, order_stage, CompactionIo, QueueSet};
use crate::transport::{shade_surface, StoredLightSample, TransportParams};
use crate::{Integrator, RenderStats};

/// Scheduler commits a progress line every this many generation batches
/// worth of pixels.
const LAUNCHES_PER_COMMIT: u64 = 16;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WavefrontConfig {
    pub max_depth: u32,
    pub rr_depth: u32,
    pub rr_threshold: f32,
    /// In-flight path capacity.
    pub state_count: usize,
    /// Gathered queue layout: kernels write only `kernel_index` and a
    /// gather pass rebuilds the lists.
    pub gathering: bool,
    /// Compact active paths to low ids before generating new ones.
    pub compact: bool,
    /// After compaction, pack actives at the tail sorted by stage.
    pub ordering: bool,
    /// Sort the Surface queue by material tag.
    pub use_tag_sort: bool,
}

impl Default for WavefrontConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            rr_depth: 0,
            rr_threshold: 0.95,
            state_count: 1 << 16,
            gathering: true,
            compact: true,
            ordering: true,
            use_tag_sort: true,
        }
    }
}

impl WavefrontConfig {
    pub fn validate(&self) -> RenderResult<()> {
        if self.max_depth < 1 {
            return Err(RenderError::InvalidConfig("max_depth must be >= 1".into()));
        }
        if !(0.05..=1.0).contains(&self.rr_threshold) {
            return Err(RenderError::InvalidConfig(
                "rr_threshold must lie in [0.05, 1]".into(),
            ));
        }
        if self.state_count == 0 {
            return Err(RenderError::StateAllocation { requested: 0 });
        }
        if self.compact && !self.gathering {
            return Err(RenderError::InvalidConfig(
                "compaction requires the gathered queue layout".into(),
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

pub struct WavefrontPathTracer {
    config: WavefrontConfig,
    spectrum: Box<dyn Spectrum>,
    sampler: Box<dyn Sampler>,
}

impl WavefrontPathTracer {
    pub fn new(config: WavefrontConfig) -> Self {
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

    pub fn config(&self) -> &WavefrontConfig {
        &self.config
    }
}

/// How the generation kernel maps dispatch ids to path ids.
#[derive(Clone, Copy)]
enum GenerateIds<'a> {
    /// Ordering left the low ids free.
    Sequential,
    /// Compaction (without ordering) left `[offset, ..)` free.
    Offset(u32),
    /// Free ids come straight from the invalid queue.
    List(&'a [u32]),
}

/// Borrowed per-dispatch context shared by all stage kernels.
struct WaveCtx<'a> {
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
    states: &'a PathStateSoa,
    light_samples: &'a LightSampleSoa,
    queues: &'a QueueSet,
    params: TransportParams,
    use_tag_sort: bool,
}

impl WaveCtx<'_> {
    #[inline]
    fn pixel_coord(&self, pixel_id: u32) -> UVec2 {
        UVec2::new(pixel_id % self.resolution.x, pixel_id / self.resolution.x)
    }

    /// Parks a path in its next stage.
    #[inline]
    fn transition(&self, id: u32, stage: KernelState) {
        if self.queues.gathering() {
            self.states.write_kernel_index(id, stage);
        }
        self.queues.push(stage, id);
    }

    /// GENERATE: turn source samples into camera paths.
    #[allow(clippy::too_many_arguments)]
    fn generate(
        &self,
        ids: GenerateIds<'_>,
        base_spp: u32,
        extra_sample_id: u64,
        time: f32,
        shutter_weight: f32,
        n: u32,
    ) {
        (0..n).into_par_iter().for_each(|k| {
            let source = extra_sample_id + k as u64;
            let pixel_id = (source % self.pixel_count as u64) as u32;
            let sample_id = base_spp + (source / self.pixel_count as u64) as u32;
            let pixel = self.pixel_coord(pixel_id);
            // weight-only splat so the pixel records the spp it was
            // actually served
            self.film.accumulate(pixel, Vec3::ZERO, 1.0);

            let path_id = match ids {
                GenerateIds::Sequential => k,
                GenerateIds::Offset(offset) => offset + k,
                GenerateIds::List(list) => list[k as usize],
            };

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
                // keep strictly positive so the termination sign bit
                // stays readable
                self.sampler.next_1d(&mut stream).max(1e-6)
            };
            self.sampler.save(path_id, stream);

            let camera_sample = self.camera.generate_ray(pixel, time, u_filter, u_lens);
            self.states.write_ray(path_id, &camera_sample.ray);
            self.states.write_wavelength_sample(path_id, u_wavelength);
            self.states.write_beta(
                path_id,
                &SampledSpectrum::splat(
                    self.spectrum.dimension(),
                    shutter_weight * camera_sample.weight,
                ),
            );
            self.states.write_pdf_bsdf(path_id, DELTA_PDF);
            self.states.write_eta_scale(path_id, 1.0);
            self.states.write_pixel_index(path_id, pixel_id);
            self.states.write_depth(path_id, 0);
            self.transition(path_id, KernelState::Intersect);
        });
    }

    /// INTERSECT: trace and classify.
    fn intersect(&self, entries: &[u32]) {
        entries.par_iter().for_each(|&id| {
            let ray = self.states.read_ray(id);
            let hit = self.geometry.trace_closest(&ray);
            self.states.write_hit(id, &hit);
            if hit.is_miss() {
                if self.has_environment {
                    self.transition(id, KernelState::Miss);
                } else {
                    self.transition(id, KernelState::Invalid);
                }
                return;
            }
            let info = self.geometry.instance(hit.inst);
            if info.has_light() {
                self.transition(id, KernelState::Light);
            } else if info.has_surface() {
                self.transition(id, KernelState::Sample);
            } else {
                self.transition(id, KernelState::Invalid);
            }
        });
    }

    /// MISS: environment radiance with MIS against the last BSDF pdf.
    fn miss(&self, entries: &[u32], time: f32) {
        entries.par_iter().for_each(|&id| {
            if self.has_environment {
                let wi = self.states.read_ray(id).direction();
                let (_, swl) = self.states.read_swl(id, self.spectrum);
                let pdf_bsdf = self.states.read_pdf_bsdf(id);
                let beta = self.states.read_beta(id);
                let eval = self.light_sampler.evaluate_miss(wi, &swl, time);
                let mis_weight = balance_heuristic(pdf_bsdf, eval.pdf);
                let li = beta * eval.l * mis_weight;
                let pixel = self.pixel_coord(self.states.read_pixel_index(id));
                self.film.accumulate(pixel, self.spectrum.srgb(&swl, &li), 0.0);
            }
            self.transition(id, KernelState::Invalid);
        });
    }

    /// LIGHT: emitter hit by a BSDF-sampled ray.
    fn light(&self, entries: &[u32], time: f32) {
        entries.par_iter().for_each(|&id| {
            if self.light_count == 0 {
                self.transition(id, KernelState::Invalid);
                return;
            }
            let ray = self.states.read_ray(id);
            let hit = self.states.read_hit(id);
            let (_, swl) = self.states.read_swl(id, self.spectrum);
            let pdf_bsdf = self.states.read_pdf_bsdf(id);
            let beta = self.states.read_beta(id);
            let it = self.geometry.interaction(&ray, &hit);
            let eval = self
                .light_sampler
                .evaluate_hit(&it, ray.origin(), &swl, time);
            let mis_weight = balance_heuristic(pdf_bsdf, eval.pdf);
            let li = beta * eval.l * mis_weight;
            let pixel = self.pixel_coord(self.states.read_pixel_index(id));
            self.film.accumulate(pixel, self.spectrum.srgb(&swl, &li), 0.0);
            if it.has_surface() {
                self.transition(id, KernelState::Sample);
            } else {
                self.transition(id, KernelState::Invalid);
            }
        });
    }

    /// SAMPLE: next-event estimation; parks the light record for the
    /// Surface stage.
    fn sample_light(&self, entries: &[u32], time: f32) {
        entries.par_iter().for_each(|&id| {
            let mut stream = self.sampler.load(id);
            let u_sel = self.sampler.next_1d(&mut stream);
            let u_surf = self.sampler.next_2d(&mut stream);
            self.sampler.save(id, stream);

            let ray = self.states.read_ray(id);
            let hit = self.states.read_hit(id);
            let it = self.geometry.interaction(&ray, &hit);
            let (_, swl) = self.states.read_swl(id, self.spectrum);
            let light_sample = self.light_sampler.sample(&it, u_sel, u_surf, &swl, time);
            let occluded = self.geometry.trace_any(&light_sample.shadow_ray);
            let visibility = if occluded { 0.0 } else { 1.0 };
            self.light_samples
                .write_emission(id, &(light_sample.eval.l * visibility));
            self.light_samples.write_wi_and_pdf(
                id,
                light_sample.shadow_ray.direction(),
                visibility * light_sample.eval.pdf,
            );
            if self.use_tag_sort {
                let tag = it.surface_tag();
                self.light_samples.write_surface_tag(id, tag);
                self.light_samples.increase_tag(tag);
            }
            self.transition(id, KernelState::Surface);
        });
    }

    /// SURFACE: closure evaluation, NEE resolve, BSDF sampling,
    /// termination.
    fn surface(&self, entries: &[u32], _time: f32) {
        entries.par_iter().for_each(|&id| {
            let mut stream = self.sampler.load(id);
            let depth = self.states.read_depth(id);
            let u_lobe = self.sampler.next_1d(&mut stream);
            let u_bsdf = self.sampler.next_2d(&mut stream);
            let u_rr = if depth + 1 >= self.params.rr_depth {
                self.sampler.next_1d(&mut stream)
            } else {
                0.0
            };
            self.sampler.save(id, stream);

            let ray = self.states.read_ray(id);
            let hit = self.states.read_hit(id);
            let it = self.geometry.interaction(&ray, &hit);
            let (u_wl, mut swl) = self.states.read_swl(id, self.spectrum);
            let beta = self.states.read_beta(id);
            let eta_scale = self.states.read_eta_scale(id);
            let (light_wi, light_pdf) = self.light_samples.read_wi_and_pdf(id);
            let stored = StoredLightSample {
                wi: light_wi,
                pdf: light_pdf,
                emission: self.light_samples.read_emission(id),
            };
            let pixel = self.pixel_coord(self.states.read_pixel_index(id));

            let outcome = shade_surface(
                self.surfaces,
                self.spectrum,
                self.film,
                &self.params,
                &it,
                &ray,
                &mut swl,
                beta,
                depth,
                eta_scale,
                pixel,
                &stored,
                u_lobe,
                u_bsdf,
                u_rr,
            );
            if outcome.terminated_secondary {
                self.states.terminate_secondary_wavelengths(id, u_wl);
            }
            if outcome.terminated {
                self.transition(id, KernelState::Invalid);
                return;
            }
            if outcome.advance_depth {
                self.states.write_depth(id, depth + 1);
            }
            self.states.write_beta(id, &outcome.beta);
            self.states.write_ray(id, &outcome.ray);
            self.states.write_pdf_bsdf(id, outcome.pdf_bsdf);
            self.states.write_eta_scale(id, outcome.eta_scale);
            self.transition(id, KernelState::Intersect);
        });
    }

    fn launch(&self, stage: KernelState, entries: &[u32], time: f32) {
        match stage {
            KernelState::Intersect => self.intersect(entries),
            KernelState::Miss => self.miss(entries, time),
            KernelState::Light => self.light(entries, time),
            KernelState::Sample => self.sample_light(entries, time),
            KernelState::Surface => self.surface(entries, time),
            KernelState::Invalid => unreachable!("invalid stage is never dispatched"),
        }
    }
}

impl Integrator for WavefrontPathTracer {
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
        let state_count = self.config.state_count;
        let spp = total_spp(shutter);
        info!(
            "Wavefront path tracing configurations: resolution = {}x{}, spp = {}, state_count = {}.",
            resolution.x, resolution.y, spp, state_count
        );

        self.sampler.reset(resolution, state_count, spp);
        camera.film().prepare();

        let spectrum = self.spectrum.as_ref();
        let states = PathStateSoa::new(spectrum, state_count, self.config.gathering);
        let tag_count = if self.config.use_tag_sort {
            scene.surfaces().len()
        } else {
            0
        };
        let light_samples = LightSampleSoa::new(spectrum.dimension(), state_count, tag_count);
        let queues = QueueSet::new(state_count, self.config.gathering);
        let use_tag_sort = self.config.use_tag_sort && tag_count > 0 && self.config.gathering;

        let mut stats = RenderStats {
            spp,
            ..Default::default()
        };
        let mut shutter_spp = 0u32;

        for s in shutter {
            scene.update(s.time);
            let ctx = WaveCtx {
                geometry: scene.geometry(),
                light_sampler: scene.light_sampler(),
                surfaces: scene.surfaces(),
                has_environment: scene.has_environment(),
                light_count: scene.light_count(),
                spectrum,
                sampler: self.sampler.as_ref(),
                camera,
                film: camera.film(),
                resolution,
                pixel_count,
                states: &states,
                light_samples: &light_samples,
                queues: &queues,
                params: self.config.params(),
                use_tag_sort,
            };

            queues.reset_invalid(&states);
            let total_launch = s.spp as u64 * pixel_count as u64;
            let mut remaining = total_launch;
            let mut last_committed = remaining;

            loop {
                stats.iterations += 1;
                queues.snapshot_counters();
                if remaining == 0 && !queues.any_active() {
                    break;
                }

                let invalid = queues.count(KernelState::Invalid) as u64;
                if invalid > (state_count as u64) / 2 && remaining > 0 {
                    // refill: compact, order, generate
                    stats.generation_batches += 1;
                    let generate_count = remaining.min(invalid) as u32;
                    let valid_count = state_count as u32 - invalid as u32;

                    if queues.gathering() {
                        queues.gather(KernelState::Invalid, &states);
                    }
                    let invalid_live = queues.live_count(KernelState::Invalid);
                    let invalid_entries = queues.entries(KernelState::Invalid, invalid_live);
                    queues.clear(KernelState::Invalid);

                    if self.config.compact {
                        let free = free_slots_below(&invalid_entries, valid_count);
                        let io = CompactionIo {
                            states: &states,
                            lights: &light_samples,
                            sampler: self.sampler.as_ref(),
                            use_tag_sort,
                        };
                        let cursor = AtomicU32::new(0);
                        for &stage in &KernelState::ALL[1..] {
                            if queues.count(stage) == 0 {
                                continue;
                            }
                            if queues.gathering() {
                                queues.gather(stage, &states);
                            }
                            compact_stage(&queues, stage, valid_count, &free, &cursor, &io);
                        }
                        if self.config.ordering {
                            let mut offset = state_count as u32;
                            for &stage in &KernelState::ALL[1..] {
                                let count = queues.count(stage);
                                if count == 0 {
                                    continue;
                                }
                                offset -= count;
                                order_stage(&queues, stage, offset, &io);
                            }
                        }
                    }

                    let ids = if self.config.compact {
                        if self.config.ordering {
                            GenerateIds::Sequential
                        } else {
                            GenerateIds::Offset(valid_count)
                        }
                    } else {
                        GenerateIds::List(&invalid_entries)
                    };
                    ctx.generate(
                        ids,
                        shutter_spp,
                        total_launch - remaining,
                        s.time,
                        s.weight,
                        generate_count,
                    );
                    if !queues.gathering() {
                        // keep the scattered invalid queue's accounting
                        // exact: hand back the slots generation skipped
                        for &id in &invalid_entries[generate_count as usize..] {
                            queues.push(KernelState::Invalid, id);
                        }
                    }
                    remaining -= generate_count as u64;

                    if last_committed - remaining >= LAUNCHES_PER_COMMIT * pixel_count as u64 {
                        last_committed = remaining;
                        let progress = (total_launch - remaining) as f64 / total_launch as f64;
                        debug!("progress {:.1}%", progress * 100.0);
                    }
                    continue;
                }

                // setup phase: rebuild/sort lists and clear counters
                let mut launches: Vec<(KernelState, Vec<u32>)> = Vec::new();
                for &stage in &KernelState::ALL[1..] {
                    let count = queues.count(stage);
                    if count == 0 {
                        continue;
                    }
                    if queues.gathering() {
                        if stage == KernelState::Surface && use_tag_sort {
                            queues.gather_sorted_by_tag(&states, &light_samples);
                        } else {
                            queues.gather(stage, &states);
                        }
                    }
                    let entries = queues.entries(stage, count);
                    queues.clear(stage);
                    launches.push((stage, entries));
                }
                // launch phase
                for (stage, entries) in &launches {
                    ctx.launch(*stage, entries, s.time);
                }
            }
            shutter_spp += s.spp;
        }

        info!(
            "Total iteration {}, where {} of them are generation.",
            stats.iterations, stats.generation_batches
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        WavefrontConfig::default().validate().unwrap();
    }

    #[test]
    fn compact_without_gathering_is_rejected() {
        let config = WavefrontConfig {
            gathering: false,
            compact: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn threshold_bounds_are_enforced() {
        let config = WavefrontConfig {
            rr_threshold: 0.01,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
