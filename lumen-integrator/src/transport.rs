//! The per-vertex surface step shared by the wavefront and megakernel
//! integrators: alpha testing, dispersion handling, next-event
//! contribution, BSDF sampling, and the termination rules.

use glam::{UVec2, Vec2, Vec3};

use lumen_core::film::Film;
use lumen_core::math::{balance_heuristic, sqr, DELTA_PDF};
use lumen_core::ray::Ray;
use lumen_core::spectrum::{SampledSpectrum, SampledWavelengths, Spectrum};
use lumen_scene::geometry::Interaction;
use lumen_scene::surface::{ScatterEvent, SurfaceDesc, TransportMode};

/// Termination parameters every integrator carries.
#[derive(Clone, Copy, Debug)]
pub struct TransportParams {
    pub max_depth: u32,
    pub rr_depth: u32,
    pub rr_threshold: f32,
}

/// The stored next-event record a path carries from Sample to Surface.
#[derive(Clone, Copy, Debug)]
pub struct StoredLightSample {
    pub wi: Vec3,
    pub pdf: f32,
    pub emission: SampledSpectrum,
}

/// What the surface step decided for the path.
pub struct SurfaceOutcome {
    pub terminated: bool,
    /// False for alpha passthrough, which keeps the depth.
    pub advance_depth: bool,
    pub ray: Ray,
    pub beta: SampledSpectrum,
    pub pdf_bsdf: f32,
    pub eta_scale: f32,
    /// The caller re-encodes the wavelength sample sign when set.
    pub terminated_secondary: bool,
}

/// Runs the Surface-stage state machine for one path vertex.
///
/// Accumulates the MIS-weighted next-event contribution into the film
/// and returns the updated path state. An unknown surface tag absorbs
/// the path.
#[allow(clippy::too_many_arguments)]
pub fn shade_surface(
    surfaces: &[SurfaceDesc],
    spectrum: &dyn Spectrum,
    film: &Film,
    params: &TransportParams,
    it: &Interaction,
    ray: &Ray,
    swl: &mut SampledWavelengths,
    beta_in: SampledSpectrum,
    depth: u32,
    eta_scale_in: f32,
    pixel: UVec2,
    light: &StoredLightSample,
    u_lobe: f32,
    u_bsdf: Vec2,
    u_rr: f32,
) -> SurfaceOutcome {
    let mut beta = beta_in;
    let mut eta_scale = eta_scale_in;

    let Some(desc) = surfaces.get(it.surface_tag() as usize) else {
        // unknown surface tag: treated as absorption
        return SurfaceOutcome {
            terminated: true,
            advance_depth: true,
            ray: *ray,
            beta,
            pdf_bsdf: 0.0,
            eta_scale,
            terminated_secondary: false,
        };
    };
    let closure = desc.closure(it, swl);
    let wo = -ray.direction();

    // stochastic alpha: remap u_lobe into the surviving interval so the
    // lobe sample stays uniform
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
        // pass through unchanged; depth and throughput are kept
        return SurfaceOutcome {
            terminated: false,
            advance_depth: false,
            ray: it.spawn_ray(ray.direction()),
            beta,
            pdf_bsdf: DELTA_PDF,
            eta_scale,
            terminated_secondary: false,
        };
    }

    let mut terminated_secondary = false;
    if closure.is_dispersive() == Some(true) && !swl.secondary_terminated() {
        swl.terminate_secondary();
        terminated_secondary = true;
    }

    // next-event estimation against the stored light sample
    if light.pdf > 0.0 {
        let eval = closure.evaluate(wo, light.wi, TransportMode::Radiance);
        let mis_weight = balance_heuristic(light.pdf, eval.pdf);
        let li = beta * eval.f * light.emission * (mis_weight / light.pdf);
        film.accumulate(pixel, spectrum.srgb(swl, &li), 0.0);
    }

    // BSDF sampling drives the continuation ray
    let surface_sample = closure.sample(wo, u_lobe, u_bsdf, TransportMode::Radiance);
    let pdf_bsdf = surface_sample.eval.pdf;
    let out_ray = it.spawn_ray(surface_sample.wi);
    let w = if surface_sample.eval.pdf > 0.0 {
        1.0 / surface_sample.eval.pdf
    } else {
        0.0
    };
    beta = beta * surface_sample.eval.f * w;
    if let Some(eta) = closure.eta() {
        match surface_sample.event {
            ScatterEvent::Enter => eta_scale *= sqr(eta),
            ScatterEvent::Exit => eta_scale /= sqr(eta),
            _ => {}
        }
    }

    // termination rules
    beta = beta.zero_if_any_nan();
    let mut terminated = false;
    if beta.all(|b| b <= 0.0) {
        terminated = true;
    } else if depth + 1 >= params.rr_depth {
        let q = (beta.max_component() * eta_scale).max(0.05);
        if q < params.rr_threshold {
            if u_rr >= q {
                terminated = true;
            }
            beta = beta * (1.0 / q);
        }
    }
    if depth + 1 >= params.max_depth {
        terminated = true;
    }

    SurfaceOutcome {
        terminated,
        advance_depth: true,
        ray: out_ray,
        beta,
        pdf_bsdf,
        eta_scale,
        terminated_secondary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;
    use lumen_core::math::Frame;
    use lumen_scene::geometry::{InstanceFlags, InstanceInfo};
    use lumen_scene::surface::SurfaceModel;

    fn harness() -> (Vec<SurfaceDesc>, Film, Interaction) {
        let surfaces = vec![SurfaceDesc::new(SurfaceModel::Matte {
            albedo: Vec3::splat(0.8),
        })];
        let film = Film::new(UVec2::new(4, 4));
        let it = Interaction {
            position: Vec3::ZERO,
            geometric_normal: Vec3::Z,
            shading: Frame::from_normal(Vec3::Z),
            uv: Vec2::ZERO,
            inst: 0,
            prim: 0,
            info: InstanceInfo {
                flags: InstanceFlags::HAS_SURFACE,
                surface_tag: 0,
                light_tag: 0,
            },
        };
        (surfaces, film, it)
    }

    fn no_light(dim: u32) -> StoredLightSample {
        StoredLightSample {
            wi: Vec3::Z,
            pdf: 0.0,
            emission: SampledSpectrum::zero(dim),
        }
    }

    #[test]
    fn diffuse_bounce_multiplies_beta_by_albedo() {
        let (surfaces, film, it) = harness();
        let params = TransportParams {
            max_depth: 8,
            rr_depth: 8,
            rr_threshold: 0.95,
        };
        let ray = Ray::spanning(Vec3::new(0.0, 0.0, 1.0), Vec3::NEG_Z);
        let mut swl = SampledWavelengths::rgb();
        let out = shade_surface(
            &surfaces,
            &lumen_core::spectrum::RgbSpectrum,
            &film,
            &params,
            &it,
            &ray,
            &mut swl,
            SampledSpectrum::splat(3, 1.0),
            0,
            1.0,
            UVec2::ZERO,
            &no_light(3),
            0.5,
            Vec2::new(0.3, 0.7),
            0.0,
        );
        assert!(!out.terminated);
        assert!(out.advance_depth);
        for i in 0..3 {
            approx::assert_relative_eq!(out.beta.at(i), 0.8, epsilon = 1e-5);
        }
        assert!(out.pdf_bsdf > 0.0 && out.pdf_bsdf < DELTA_PDF);
        // continuation leaves the upper hemisphere
        assert!(out.ray.direction().z > 0.0);
    }

    #[test]
    fn unknown_tag_absorbs_the_path() {
        let (_, film, mut it) = harness();
        it.info.surface_tag = 7;
        let params = TransportParams {
            max_depth: 8,
            rr_depth: 0,
            rr_threshold: 0.95,
        };
        let ray = Ray::spanning(Vec3::new(0.0, 0.0, 1.0), Vec3::NEG_Z);
        let mut swl = SampledWavelengths::rgb();
        let out = shade_surface(
            &[],
            &lumen_core::spectrum::RgbSpectrum,
            &film,
            &params,
            &it,
            &ray,
            &mut swl,
            SampledSpectrum::splat(3, 1.0),
            0,
            1.0,
            UVec2::ZERO,
            &no_light(3),
            0.5,
            Vec2::ZERO,
            0.0,
        );
        assert!(out.terminated);
    }

    #[test]
    fn depth_cap_terminates() {
        let (surfaces, film, it) = harness();
        let params = TransportParams {
            max_depth: 3,
            rr_depth: 16,
            rr_threshold: 0.95,
        };
        let ray = Ray::spanning(Vec3::new(0.0, 0.0, 1.0), Vec3::NEG_Z);
        let mut swl = SampledWavelengths::rgb();
        let out = shade_surface(
            &surfaces,
            &lumen_core::spectrum::RgbSpectrum,
            &film,
            &params,
            &it,
            &ray,
            &mut swl,
            SampledSpectrum::splat(3, 1.0),
            2,
            1.0,
            UVec2::ZERO,
            &no_light(3),
            0.5,
            Vec2::new(0.2, 0.4),
            0.0,
        );
        assert!(out.terminated);
    }

    #[test]
    fn alpha_passthrough_keeps_depth_and_sets_the_sentinel() {
        let (_, film, it) = harness();
        let surfaces = vec![SurfaceDesc::with_opacity(
            SurfaceModel::Matte {
                albedo: Vec3::splat(0.8),
            },
            0.25,
        )];
        let params = TransportParams {
            max_depth: 8,
            rr_depth: 0,
            rr_threshold: 0.95,
        };
        let ray = Ray::spanning(Vec3::new(0.0, 0.0, 1.0), Vec3::NEG_Z);
        let mut swl = SampledWavelengths::rgb();
        // u_lobe = 0.9 >= opacity: pass through
        let out = shade_surface(
            &surfaces,
            &lumen_core::spectrum::RgbSpectrum,
            &film,
            &params,
            &it,
            &ray,
            &mut swl,
            SampledSpectrum::splat(3, 1.0),
            0,
            1.0,
            UVec2::ZERO,
            &no_light(3),
            0.9,
            Vec2::ZERO,
            0.0,
        );
        assert!(!out.terminated);
        assert!(!out.advance_depth);
        assert_eq!(out.pdf_bsdf, DELTA_PDF);
        // unchanged direction, unchanged throughput
        assert_eq!(out.ray.direction(), ray.direction());
        assert_eq!(out.beta.at(0), 1.0);
    }

    #[test]
    fn russian_roulette_rescales_survivors() {
        let (surfaces, film, it) = harness();
        let params = TransportParams {
            max_depth: 16,
            rr_depth: 0,
            rr_threshold: 0.95,
        };
        let ray = Ray::spanning(Vec3::new(0.0, 0.0, 1.0), Vec3::NEG_Z);
        let mut swl = SampledWavelengths::rgb();
        // u_rr = 0: always survives, beta rescaled by 1/q
        let out = shade_surface(
            &surfaces,
            &lumen_core::spectrum::RgbSpectrum,
            &film,
            &params,
            &it,
            &ray,
            &mut swl,
            SampledSpectrum::splat(3, 0.5),
            0,
            1.0,
            UVec2::ZERO,
            &no_light(3),
            0.5,
            Vec2::new(0.3, 0.7),
            0.0,
        );
        assert!(!out.terminated);
        // beta before rr is 0.5 * 0.8 = 0.4 = q, so rescale puts the
        // survivor back at 1.0
        approx::assert_relative_eq!(out.beta.at(0), 1.0, epsilon = 1e-4);
    }
}
