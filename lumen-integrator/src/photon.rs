//! Stochastic progressive photon mapping.
//!
//! Each progressive iteration emits a photon wave from the lights,
//! links the photons into a spatial hash grid, then walks restricted
//! camera paths that score direct lighting with MIS and gather photon
//! flux at the first rough vertex. Pixel statistics follow the SPPM
//! radius-shrinkage rule; the shared-radius mode keeps one global
//! statistic triple and re-derives the grid cell length from it.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::{IVec3, UVec2, Vec2, Vec3};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use lumen_core::camera::Camera;
use lumen_core::error::{RenderError, RenderResult};
use lumen_core::film::{AtomicF32, Film};
use lumen_core::math::{balance_heuristic, sqr, DELTA_PDF};
use lumen_core::sampler::{IndependentSampler, Sampler};
use lumen_core::shutter::{total_spp, ShutterSample};
use lumen_core::spectrum::{
    RgbSpectrum, SampledSpectrum, SampledWavelengths, Spectrum, SPECTRUM_LANES,
};
use lumen_scene::geometry::Geometry;
use lumen_scene::light::LightSampler;
use lumen_scene::surface::{ScatterEvent, SurfaceDesc, TransportMode};
use lumen_scene::RenderScene;

use crate::cell::Column;
use crate::transport::TransportParams;
use crate::{Integrator, RenderStats};

const NIL: u32 = u32::MAX;

/// SPPM photon-count growth factor.
const GAMMA: f32 = 2.0 / 3.0;

/// Roughness product past which a camera vertex is "rough enough" to
/// gather photons instead of continuing the direct walk.
const GATHER_ROUGHNESS: f32 = 0.16;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhotonMapperConfig {
    pub max_depth: u32,
    pub rr_depth: u32,
    pub rr_threshold: f32,
    /// Photons emitted per progressive iteration.
    pub photon_per_iter: u32,
    /// Positive: world-space initial radius. Negative: the world extent
    /// divided by `-initial_radius` (a grid-count form).
    pub initial_radius: f32,
    /// One global (N, r) statistic instead of per-pixel triples.
    pub shared_radius: bool,
}

impl Default for PhotonMapperConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            rr_depth: 2,
            rr_threshold: 0.95,
            photon_per_iter: 200_000,
            initial_radius: -200.0,
            shared_radius: true,
        }
    }
}

impl PhotonMapperConfig {
    pub fn validate(&self) -> RenderResult<()> {
        if self.max_depth < 1 {
            return Err(RenderError::InvalidConfig("max_depth must be >= 1".into()));
        }
        if !(0.05..=1.0).contains(&self.rr_threshold) {
            return Err(RenderError::InvalidConfig(
                "rr_threshold must lie in [0.05, 1]".into(),
            ));
        }
        if self.photon_per_iter == 0 {
            return Err(RenderError::InvalidConfig(
                "photon_per_iter must be positive".into(),
            ));
        }
        if self.initial_radius == 0.0 {
            return Err(RenderError::InvalidConfig(
                "initial_radius must be non-zero".into(),
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

/// Photon storage plus the cell-to-list spatial hash.
struct PhotonMap {
    grid_head: Vec<AtomicU32>,
    nxt: Column<u32>,
    position: Column<[f32; 3]>,
    wi: Column<[f32; 3]>,
    power: Column<[f32; SPECTRUM_LANES]>,
    swl_lambda: Option<Column<[f32; SPECTRUM_LANES]>>,
    swl_pdf: Option<Column<[f32; SPECTRUM_LANES]>>,
    total: AtomicU32,
    capacity: u32,
    grid_min: Vec3,
    grid_len: f32,
    dim: u32,
}

impl PhotonMap {
    fn new(capacity: u32, spectrum: &dyn Spectrum) -> Self {
        let n = capacity as usize;
        let spectral = !spectrum.is_fixed();
        Self {
            grid_head: (0..n).map(|_| AtomicU32::new(NIL)).collect(),
            nxt: Column::new(n),
            position: Column::new(n),
            wi: Column::new(n),
            power: Column::new(n),
            swl_lambda: spectral.then(|| Column::new(n)),
            swl_pdf: spectral.then(|| Column::new(n)),
            total: AtomicU32::new(0),
            capacity,
            grid_min: Vec3::ZERO,
            grid_len: 1.0,
            dim: spectrum.dimension(),
        }
    }

    fn set_grid(&mut self, grid_min: Vec3, grid_len: f32) {
        self.grid_min = grid_min;
        self.grid_len = grid_len;
    }

    /// Shared-radius mode shrinks the cell length with the radius.
    fn set_grid_len(&mut self, grid_len: f32) {
        self.grid_len = grid_len;
    }

    fn reset(&self) {
        for head in &self.grid_head {
            head.store(NIL, Ordering::Relaxed);
        }
        self.total.store(0, Ordering::Relaxed);
    }

    fn count(&self) -> u32 {
        self.total.load(Ordering::Relaxed).min(self.capacity)
    }

    fn push(&self, position: Vec3, swl: &SampledWavelengths, power: &SampledSpectrum, wi: Vec3) {
        let index = self.total.fetch_add(1, Ordering::Relaxed);
        if index >= self.capacity {
            return;
        }
        self.position.set(index, position.to_array());
        self.wi.set(index, wi.to_array());
        self.power.set(index, *power.lanes());
        if let (Some(lambda), Some(pdf)) = (&self.swl_lambda, &self.swl_pdf) {
            let mut l = [0.0; SPECTRUM_LANES];
            let mut p = [0.0; SPECTRUM_LANES];
            for i in 0..self.dim as usize {
                l[i] = swl.lambda(i);
                p[i] = swl.pdf(i);
            }
            lambda.set(index, l);
            pdf.set(index, p);
        }
        self.nxt.set(index, NIL);
    }

    fn point_to_grid(&self, p: Vec3) -> IVec3 {
        ((p - self.grid_min) / self.grid_len).floor().as_ivec3() + IVec3::splat(2)
    }

    fn grid_to_index(&self, cell: IVec3) -> usize {
        let hash = (cell.x as i64 * 73_856_093)
            ^ (cell.y as i64 * 19_349_663)
            ^ (cell.z as i64 * 83_492_791);
        hash.rem_euclid(self.grid_head.len() as i64) as usize
    }

    /// Linked-list insertion by atomic exchange of the cell head.
    fn link(&self, index: u32) {
        let p = Vec3::from_array(self.position.get(index));
        let cell = self.grid_to_index(self.point_to_grid(p));
        let head = self.grid_head[cell].swap(index, Ordering::Relaxed);
        self.nxt.set(index, head);
    }

    fn position_of(&self, index: u32) -> Vec3 {
        Vec3::from_array(self.position.get(index))
    }

    fn wi_of(&self, index: u32) -> Vec3 {
        Vec3::from_array(self.wi.get(index))
    }

    fn power_of(&self, index: u32) -> SampledSpectrum {
        SampledSpectrum::from_lanes(self.dim, self.power.get(index))
    }

    fn swl_of(&self, index: u32) -> SampledWavelengths {
        match (&self.swl_lambda, &self.swl_pdf) {
            (Some(lambda), Some(pdf)) => {
                SampledWavelengths::new(self.dim, lambda.get(index), pdf.get(index))
            }
            _ => SampledWavelengths::rgb(),
        }
    }

    /// Visits every photon in the 3x3x3 cell neighbourhood of `p`.
    fn for_each_neighbor(&self, p: Vec3, mut visit: impl FnMut(u32)) {
        let grid = self.point_to_grid(p);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let cell = grid + IVec3::new(dx, dy, dz);
                    let mut index = self.grid_head[self.grid_to_index(cell)].load(Ordering::Relaxed);
                    while index != NIL {
                        visit(index);
                        index = self.nxt.get(index);
                    }
                }
            }
        }
    }
}

/// Progressive per-pixel statistics: radius, photon count, accumulated
/// flux τ and the per-iteration accumulator φ.
struct PixelStats {
    shared: bool,
    pixel_count: usize,
    radius: Vec<AtomicF32>,
    n_photon: Vec<AtomicF32>,
    cur_n: Vec<AtomicU32>,
    phi: Vec<AtomicF32>,
    tau: Vec<AtomicF32>,
    clamp: f32,
}

impl PixelStats {
    fn new(pixel_count: usize, shared: bool, initial_radius: f32, clamp: f32) -> Self {
        let stat_count = if shared { 1 } else { pixel_count };
        Self {
            shared,
            pixel_count,
            radius: (0..stat_count)
                .map(|_| AtomicF32::new(initial_radius))
                .collect(),
            n_photon: (0..stat_count).map(|_| AtomicF32::new(0.0)).collect(),
            cur_n: (0..stat_count).map(|_| AtomicU32::new(0)).collect(),
            phi: (0..pixel_count * 3).map(|_| AtomicF32::new(0.0)).collect(),
            tau: (0..pixel_count * 3).map(|_| AtomicF32::new(0.0)).collect(),
            clamp,
        }
    }

    #[inline]
    fn stat_index(&self, pixel: usize) -> usize {
        if self.shared {
            0
        } else {
            pixel
        }
    }

    fn radius(&self, pixel: usize) -> f32 {
        self.radius[self.stat_index(pixel)].load()
    }

    fn add_phi(&self, pixel: usize, phi: Vec3) {
        if !phi.is_finite() {
            return;
        }
        self.phi[pixel * 3].fetch_add(phi.x);
        self.phi[pixel * 3 + 1].fetch_add(phi.y);
        self.phi[pixel * 3 + 2].fetch_add(phi.z);
    }

    fn add_cur_n(&self, pixel: usize, count: u32) {
        self.cur_n[self.stat_index(pixel)].fetch_add(count, Ordering::Relaxed);
    }

    /// Per-pixel statistics update:
    /// N' = N + γM, r' = r √((N+γM)/(N+M)), τ' = (τ+φ)(r'/r)².
    fn update_pixel(&self, pixel: usize) {
        let stat = self.stat_index(pixel);
        let m = self.cur_n[stat].load(Ordering::Relaxed) as f32;
        if m <= 0.0 {
            return;
        }
        let n = self.n_photon[stat].load();
        let r = self.radius[stat].load();
        let n_new = n + GAMMA * m;
        let r_new = r * (n_new / (n + m)).sqrt();
        let ratio = sqr(r_new / r);
        for c in 0..3 {
            let tau = self.tau[pixel * 3 + c].load();
            let phi = self.phi[pixel * 3 + c]
                .load()
                .clamp(-self.clamp, self.clamp);
            self.tau[pixel * 3 + c].store((tau + phi) * ratio);
            self.phi[pixel * 3 + c].store(0.0);
        }
        if !self.shared {
            self.n_photon[stat].store(n_new);
            self.radius[stat].store(r_new);
            self.cur_n[stat].store(0, Ordering::Relaxed);
        }
    }

    /// Shared-radius mode: one global statistic update per iteration,
    /// after every pixel folded its φ into τ. Returns the new radius.
    fn shared_update(&self) -> f32 {
        let m = self.cur_n[0].load(Ordering::Relaxed) as f32;
        let r = self.radius[0].load();
        if m <= 0.0 {
            return r;
        }
        let n = self.n_photon[0].load();
        let n_new = n + GAMMA * m;
        let r_new = r * (n_new / (n + m)).sqrt();
        self.n_photon[0].store(n_new);
        self.radius[0].store(r_new);
        self.cur_n[0].store(0, Ordering::Relaxed);
        r_new
    }

    fn tau(&self, pixel: usize) -> Vec3 {
        Vec3::new(
            self.tau[pixel * 3].load(),
            self.tau[pixel * 3 + 1].load(),
            self.tau[pixel * 3 + 2].load(),
        )
    }

    fn mean_radius(&self) -> f32 {
        let sum: f32 = self.radius.iter().map(|r| r.load()).sum();
        sum / self.radius.len() as f32
    }

    fn pixel_count(&self) -> usize {
        self.pixel_count
    }
}

pub struct PhotonMapper {
    config: PhotonMapperConfig,
    spectrum: Box<dyn Spectrum>,
    sampler: Box<dyn Sampler>,
    radius_history: Vec<f32>,
}

impl PhotonMapper {
    pub fn new(config: PhotonMapperConfig) -> Self {
        Self {
            config,
            spectrum: Box::new(RgbSpectrum),
            sampler: Box::new(IndependentSampler::default()),
            radius_history: Vec::new(),
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

    pub fn config(&self) -> &PhotonMapperConfig {
        &self.config
    }

    /// Gather radius after each progressive iteration of the last
    /// render; shrinks monotonically by the SPPM rule.
    pub fn radius_history(&self) -> &[f32] {
        &self.radius_history
    }
}

struct PhotonCtx<'a> {
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
    params: TransportParams,
    time: f32,
}

impl PhotonCtx<'_> {
    fn closure_at(
        &self,
        it: &lumen_scene::geometry::Interaction,
        swl: &SampledWavelengths,
    ) -> Option<lumen_scene::surface::SurfaceClosure> {
        self.surfaces
            .get(it.surface_tag() as usize)
            .map(|desc| desc.closure(it, swl))
    }

    /// Emits one photon and bounces it in adjoint mode, recording a
    /// photon at every indirect surface vertex.
    fn trace_photon(&self, map: &PhotonMap, photon_index: u32, frame_index: u32) {
        // seed off the pixel grid so photon streams never collide with
        // camera streams
        let seed_pixel = UVec2::new(photon_index, u32::MAX - frame_index);
        let mut stream = self.sampler.start(seed_pixel, frame_index);
        let u_sel = self.sampler.next_1d(&mut stream);
        let u_surf = self.sampler.next_2d(&mut stream);
        let u_dir = self.sampler.next_2d(&mut stream);
        let mut swl = self.spectrum.sample(if self.spectrum.is_fixed() {
            0.0
        } else {
            self.sampler.next_1d(&mut stream)
        });
        let le = self
            .light_sampler
            .sample_le(u_sel, u_surf, u_dir, &swl, self.time);
        if le.eval.pdf <= 0.0 {
            return;
        }
        let mut beta = le.eval.l * (1.0 / le.eval.pdf);
        let mut ray = le.ray;
        let mut eta_scale = 1.0f32;
        let mut depth = 0u32;

        while depth < self.params.max_depth {
            let wi = -ray.direction();
            let hit = self.geometry.trace_closest(&ray);
            if hit.is_miss() {
                break;
            }
            let it = self.geometry.interaction(&ray, &hit);
            if !it.has_surface() {
                break;
            }

            let u_lobe = self.sampler.next_1d(&mut stream);
            let u_bsdf = self.sampler.next_2d(&mut stream);
            let u_rr = if depth + 1 >= self.params.rr_depth {
                self.sampler.next_1d(&mut stream)
            } else {
                0.0
            };

            // direct lighting is estimated by the camera walk; photons
            // only carry indirect flux
            if depth > 0 {
                map.push(it.position, &swl, &beta, wi);
            }

            let Some(closure) = self.closure_at(&it, &swl) else {
                break;
            };

            let mut u_lobe = u_lobe;
            let mut alpha_skip = false;
            if let Some(opacity) = closure.opacity() {
                let opacity = opacity.clamp(0.0, 1.0);
                alpha_skip = u_lobe >= opacity;
                u_lobe = if alpha_skip {
                    (u_lobe - opacity) / (1.0 - opacity)
                } else {
                    u_lobe / opacity
                };
            }
            if alpha_skip {
                ray = it.spawn_ray(ray.direction());
                continue;
            }

            if closure.is_dispersive() == Some(true) {
                swl.terminate_secondary();
            }

            let s = closure.sample(wi, u_lobe, u_bsdf, TransportMode::Importance);
            let w = if s.eval.pdf > 0.0 { 1.0 / s.eval.pdf } else { 0.0 };
            let bnew = beta * s.eval.f * w;
            if let Some(eta) = closure.eta() {
                match s.event {
                    ScatterEvent::Enter => eta_scale *= sqr(eta),
                    ScatterEvent::Exit => eta_scale /= sqr(eta),
                    _ => {}
                }
            }
            // track total throughput compression so roulette keeps the
            // photon power stable
            let old_max = beta.max_component();
            let new_max = bnew.max_component();
            if old_max > 0.0 && new_max < old_max {
                eta_scale *= new_max / old_max;
            }
            beta = bnew.zero_if_any_nan();
            if beta.all(|b| b <= 0.0) {
                break;
            }
            if depth + 1 >= self.params.rr_depth {
                let q = eta_scale.max(0.05);
                if q < self.params.rr_threshold {
                    if u_rr >= q {
                        break;
                    }
                    beta = beta * (1.0 / q);
                }
            }
            ray = it.spawn_ray(s.wi);
            depth += 1;
        }
    }

    /// Camera walk for one pixel: scores direct lighting with MIS up to
    /// the first rough vertex, gathers photon flux there, then scores
    /// one final direct hit. Returns the direct-light estimate.
    #[allow(clippy::too_many_arguments)]
    fn camera_walk(
        &self,
        map: &PhotonMap,
        stats: &PixelStats,
        pixel: UVec2,
        frame_index: u32,
        shutter_weight: f32,
    ) -> Vec3 {
        let mut stream = self.sampler.start(pixel, frame_index);
        let u_filter = self.sampler.next_2d(&mut stream);
        let u_lens = if self.camera.requires_lens_sampling() {
            self.sampler.next_2d(&mut stream)
        } else {
            Vec2::splat(0.5)
        };
        let camera_sample = self.camera.generate_ray(pixel, self.time, u_filter, u_lens);
        let mut swl = self.spectrum.sample(if self.spectrum.is_fixed() {
            0.0
        } else {
            self.sampler.next_1d(&mut stream)
        });
        let dim = self.spectrum.dimension();
        let mut beta =
            SampledSpectrum::splat(dim, shutter_weight * camera_sample.weight);
        let mut li = SampledSpectrum::zero(dim);
        let mut ray = camera_sample.ray;
        let mut pdf_bsdf = DELTA_PDF;
        let mut eta_scale = 1.0f32;
        let pixel_index = (pixel.y * self.resolution.x + pixel.x) as usize;
        let mut depth = 0u32;

        while depth < self.params.max_depth {
            let wo = -ray.direction();
            let hit = self.geometry.trace_closest(&ray);

            if hit.is_miss() {
                if self.has_environment {
                    let eval = self
                        .light_sampler
                        .evaluate_miss(ray.direction(), &swl, self.time);
                    li += beta * eval.l * balance_heuristic(pdf_bsdf, eval.pdf);
                }
                break;
            }
            let it = self.geometry.interaction(&ray, &hit);
            if self.light_count > 0 && it.has_light() {
                let eval = self
                    .light_sampler
                    .evaluate_hit(&it, ray.origin(), &swl, self.time);
                li += beta * eval.l * balance_heuristic(pdf_bsdf, eval.pdf);
            }
            if !it.has_surface() {
                break;
            }

            let u_sel = self.sampler.next_1d(&mut stream);
            let u_surf = self.sampler.next_2d(&mut stream);
            let u_lobe = self.sampler.next_1d(&mut stream);
            let u_bsdf = self.sampler.next_2d(&mut stream);
            let u_rr = if depth + 1 >= self.params.rr_depth {
                self.sampler.next_1d(&mut stream)
            } else {
                0.0
            };

            let light_sample = self
                .light_sampler
                .sample(&it, u_sel, u_surf, &swl, self.time);
            let occluded = self.geometry.trace_any(&light_sample.shadow_ray);

            let Some(closure) = self.closure_at(&it, &swl) else {
                break;
            };

            // roulette verdict first: a killed path still gathers at
            // this vertex so its flux is not lost
            let q = (beta.max_component() * eta_scale).max(0.05);
            let rr_active = depth + 1 >= self.params.rr_depth && q < self.params.rr_threshold;
            let mut stop_direct = rr_active && u_rr >= q;

            let mut u_lobe = u_lobe;
            let mut alpha_skip = false;
            if let Some(opacity) = closure.opacity() {
                let opacity = opacity.clamp(0.0, 1.0);
                alpha_skip = u_lobe >= opacity;
                u_lobe = if alpha_skip {
                    (u_lobe - opacity) / (1.0 - opacity)
                } else {
                    u_lobe / opacity
                };
            }
            if alpha_skip {
                ray = it.spawn_ray(ray.direction());
                pdf_bsdf = DELTA_PDF;
                continue;
            }

            if closure.is_dispersive() == Some(true) {
                swl.terminate_secondary();
            }

            // next-event estimation for the direct component
            if light_sample.eval.pdf > 0.0 && !occluded {
                let wi = light_sample.shadow_ray.direction();
                let eval = closure.evaluate(wo, wi, TransportMode::Radiance);
                let w = balance_heuristic(light_sample.eval.pdf, eval.pdf)
                    / light_sample.eval.pdf;
                li += beta * eval.f * light_sample.eval.l * w;
            }

            let roughness = closure.roughness();
            let gather_here = roughness.x * roughness.y > GATHER_ROUGHNESS || stop_direct;
            if gather_here {
                stop_direct = true;
                let radius = stats.radius(pixel_index);
                let mut gathered = 0u32;
                map.for_each_neighbor(it.position, |photon| {
                    let position = map.position_of(photon);
                    if position.distance(it.position) > radius {
                        return;
                    }
                    let photon_wi = map.wi_of(photon);
                    let photon_power = map.power_of(photon);
                    let eval = closure.evaluate(wo, photon_wi, TransportMode::Radiance);
                    let wi_local = it.shading.to_local(photon_wi);
                    let cos = wi_local.z.abs().max(1e-4);
                    let phi = if self.spectrum.is_fixed() {
                        self.spectrum
                            .srgb(&swl, &(beta * photon_power * eval.f * (1.0 / cos)))
                    } else {
                        let photon_swl = map.swl_of(photon);
                        self.spectrum.srgb_cross(
                            &swl,
                            &(beta * eval.f * (1.0 / cos)),
                            &photon_swl,
                            &photon_power,
                        )
                    };
                    stats.add_phi(pixel_index, phi);
                    gathered += 1;
                });
                if gathered > 0 {
                    stats.add_cur_n(pixel_index, gathered);
                }
            }

            // continue the walk with a BSDF sample
            let s = closure.sample(wo, u_lobe, u_bsdf, TransportMode::Radiance);
            pdf_bsdf = s.eval.pdf;
            let w = if s.eval.pdf > 0.0 { 1.0 / s.eval.pdf } else { 0.0 };
            beta = (beta * s.eval.f * w).zero_if_any_nan();
            if let Some(eta) = closure.eta() {
                match s.event {
                    ScatterEvent::Enter => eta_scale *= sqr(eta),
                    ScatterEvent::Exit => eta_scale /= sqr(eta),
                    _ => {}
                }
            }
            ray = it.spawn_ray(s.wi);
            if beta.all(|b| b <= 0.0) {
                break;
            }

            if stop_direct {
                // one final direct bounce so specular chains behind the
                // gather vertex still reach their emitter
                let hit_next = self.geometry.trace_closest(&ray);
                if hit_next.is_miss() {
                    if self.has_environment {
                        let eval = self
                            .light_sampler
                            .evaluate_miss(ray.direction(), &swl, self.time);
                        li += beta * eval.l * balance_heuristic(pdf_bsdf, eval.pdf);
                    }
                } else if self.light_count > 0 {
                    let it_next = self.geometry.interaction(&ray, &hit_next);
                    if it_next.has_light() {
                        let eval = self.light_sampler.evaluate_hit(
                            &it_next,
                            ray.origin(),
                            &swl,
                            self.time,
                        );
                        li += beta * eval.l * balance_heuristic(pdf_bsdf, eval.pdf);
                    }
                }
                break;
            }
            if rr_active {
                beta = beta * (1.0 / q);
            }
            depth += 1;
        }
        self.spectrum.srgb(&swl, &li)
    }
}

impl Integrator for PhotonMapper {
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
        if scene.light_count() == 0 {
            warn!("Photon mapping needs area lights or an environment to emit from.");
        }

        let resolution = camera.film().resolution();
        let pixel_count = (resolution.x * resolution.y) as usize;
        let spp = total_spp(shutter);
        let capacity = self
            .config
            .photon_per_iter
            .checked_mul(self.config.max_depth)
            .ok_or(RenderError::StateAllocation {
                requested: usize::MAX,
            })?;
        info!(
            "Photon mapping configurations: resolution = {}x{}, spp = {}, photons/iter = {}.",
            resolution.x, resolution.y, spp, self.config.photon_per_iter
        );

        self.sampler.reset(
            resolution,
            pixel_count.max(self.config.photon_per_iter as usize),
            spp,
        );
        camera.film().prepare();
        self.radius_history.clear();

        let bounds = scene.geometry().world_bounds();
        let extent = bounds.extent().max(Vec3::splat(1e-3));
        let initial_radius = if self.config.initial_radius < 0.0 {
            let grid_count = -self.config.initial_radius;
            (extent.x / grid_count)
                .min(extent.y / grid_count)
                .min(extent.z / grid_count)
        } else {
            self.config.initial_radius
        };
        // the grid origin comes from the world bounds rather than the
        // photon population; atomic float min/max is not relied upon
        let mut map = PhotonMap::new(capacity, self.spectrum.as_ref());
        map.set_grid(bounds.min, initial_radius);
        let clamp =
            camera.film().clamp() * self.config.photon_per_iter as f32 * std::f32::consts::PI
                * initial_radius
                * initial_radius;
        let stats = PixelStats::new(pixel_count, self.config.shared_radius, initial_radius, clamp);

        let mut render_stats = RenderStats {
            spp,
            ..Default::default()
        };
        let mut frame_index = 0u32;

        for s in shutter {
            scene.update(s.time);
            let ctx = PhotonCtx {
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
                params: self.config.params(),
                time: s.time,
            };

            for _ in 0..s.spp {
                render_stats.iterations += 1;
                map.reset();

                // 1. emit
                (0..self.config.photon_per_iter)
                    .into_par_iter()
                    .for_each(|photon| ctx.trace_photon(&map, photon, frame_index));

                // 2. build the grid
                (0..map.count())
                    .into_par_iter()
                    .for_each(|index| map.link(index));

                // 3. gather
                (0..pixel_count as u32).into_par_iter().for_each(|p| {
                    let pixel = UVec2::new(p % resolution.x, p / resolution.x);
                    let direct = ctx.camera_walk(&map, &stats, pixel, frame_index, s.weight);
                    ctx.film.accumulate(pixel, direct, 0.5);
                });

                // 4. statistics
                (0..pixel_count)
                    .into_par_iter()
                    .for_each(|p| stats.update_pixel(p));
                if self.config.shared_radius {
                    let radius = stats.shared_update();
                    map.set_grid_len(radius);
                }
                self.radius_history.push(stats.mean_radius());
                frame_index += 1;
                debug!(
                    "photon iteration {} done, mean radius {:.5}",
                    frame_index,
                    stats.mean_radius()
                );
            }
        }

        // 5. resolve the indirect estimate into the film
        let m = self.config.photon_per_iter as f32;
        (0..stats.pixel_count() as u32).into_par_iter().for_each(|p| {
            let pixel = UVec2::new(p % resolution.x, p / resolution.x);
            let r = stats.radius(p as usize);
            let l = stats.tau(p as usize) / (m * std::f32::consts::PI * r * r);
            camera
                .film()
                .accumulate(pixel, l, 0.5 * spp as f32);
        });

        info!(
            "Photon mapping finished after {} iterations, final mean radius {:.5}.",
            render_stats.iterations,
            stats.mean_radius()
        );
        Ok(render_stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sppm_radius_follows_the_closed_form() {
        // K iterations with a constant M photons per iteration must
        // match r0 · Π √((N_i + γM_i)/(N_i + M_i))
        let stats = PixelStats::new(1, true, 1.0, f32::MAX);
        let m = 1000u32;
        let iterations = 8;
        for _ in 0..iterations {
            stats.add_cur_n(0, m);
            stats.update_pixel(0);
            stats.shared_update();
        }
        let mut expected = 1.0f64;
        let mut n = 0.0f64;
        let mf = m as f64;
        for _ in 0..iterations {
            let gamma = 2.0 / 3.0;
            expected *= ((n + gamma * mf) / (n + mf)).sqrt();
            n += gamma * mf;
        }
        assert_relative_eq!(
            stats.radius(0) as f64,
            expected,
            max_relative = 1e-5
        );
    }

    #[test]
    fn tau_rescales_with_the_shrinking_radius() {
        let stats = PixelStats::new(1, false, 2.0, f32::MAX);
        stats.add_phi(0, Vec3::splat(10.0));
        stats.add_cur_n(0, 100);
        let r0 = stats.radius(0);
        stats.update_pixel(0);
        let r1 = stats.radius(0);
        assert!(r1 < r0);
        let expected = 10.0 * (r1 / r0) * (r1 / r0);
        assert_relative_eq!(stats.tau(0).x, expected, max_relative = 1e-5);
        // φ is reset for the next iteration
        stats.add_cur_n(0, 1);
        stats.update_pixel(0);
        assert!(stats.tau(0).x < expected * 1.01);
    }

    #[test]
    fn photon_clamp_bounds_phi() {
        let stats = PixelStats::new(1, true, 1.0, 5.0);
        stats.add_phi(0, Vec3::splat(1e9));
        stats.add_cur_n(0, 1);
        stats.update_pixel(0);
        assert!(stats.tau(0).x <= 5.0 + 1e-3);
    }

    #[test]
    fn hash_grid_links_and_visits_neighbours() {
        let spectrum = RgbSpectrum;
        let mut map = PhotonMap::new(64, &spectrum);
        map.set_grid(Vec3::splat(-1.0), 0.5);
        let swl = SampledWavelengths::rgb();
        let power = SampledSpectrum::splat(3, 1.0);
        map.push(Vec3::ZERO, &swl, &power, Vec3::Z);
        map.push(Vec3::splat(0.1), &swl, &power, Vec3::Z);
        map.push(Vec3::splat(10.0), &swl, &power, Vec3::Z); // far away
        for index in 0..map.count() {
            map.link(index);
        }
        let mut near = 0;
        map.for_each_neighbor(Vec3::ZERO, |index| {
            if map.position_of(index).distance(Vec3::ZERO) < 0.5 {
                near += 1;
            }
        });
        assert_eq!(near, 2);
    }

    #[test]
    fn capacity_overflow_drops_photons() {
        let map = PhotonMap::new(2, &RgbSpectrum);
        let swl = SampledWavelengths::rgb();
        let power = SampledSpectrum::splat(3, 1.0);
        for _ in 0..5 {
            map.push(Vec3::ZERO, &swl, &power, Vec3::Z);
        }
        assert_eq!(map.count(), 2);
    }
}
