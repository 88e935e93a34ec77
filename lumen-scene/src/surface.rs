//! Surface closures.
//!
//! The renderer dispatches on a runtime surface tag; the closure itself
//! is a tagged sum so a sorted Surface queue presents one `match` arm to
//! neighbouring lanes. The three reference models (matte, mirror,
//! glass) cover the contract the integrators rely on: diffuse lobes,
//! delta lobes with the `1e16` pdf sentinel, refraction events and
//! dispersion. Production BSDF stacks plug in by extending the enum.
//!
//! Convention: `evaluate`/`sample` return f already multiplied by
//! |cos θ_i|, so `f / pdf` is the throughput factor directly.

use glam::{Vec2, Vec3};

use lumen_core::math::{cosine_hemisphere_pdf, sample_cosine_hemisphere, Frame, DELTA_PDF};
use lumen_core::spectrum::{SampledSpectrum, SampledWavelengths};

use crate::geometry::Interaction;

/// Radiance (camera paths) vs. importance (photon paths) transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Radiance,
    Importance,
}

/// How a sampled direction left the surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScatterEvent {
    Reflect,
    /// Passed straight through (alpha or thin surfaces).
    Through,
    /// Refracted into the medium.
    Enter,
    /// Refracted out of the medium.
    Exit,
}

#[derive(Clone, Copy, Debug)]
pub struct ClosureEval {
    pub f: SampledSpectrum,
    pub pdf: f32,
}

impl ClosureEval {
    pub fn zero(dim: u32) -> Self {
        Self {
            f: SampledSpectrum::zero(dim),
            pdf: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SurfaceSample {
    pub wi: Vec3,
    pub eval: ClosureEval,
    pub event: ScatterEvent,
}

/// Authored description of a surface; the scene keeps these in a flat
/// table indexed by surface tag.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceDesc {
    pub model: SurfaceModel,
    /// Stochastic alpha: fraction of paths the surface actually
    /// scatters; the rest pass through unchanged.
    pub opacity: Option<f32>,
}

impl SurfaceDesc {
    pub fn new(model: SurfaceModel) -> Self {
        Self {
            model,
            opacity: None,
        }
    }

    pub fn with_opacity(model: SurfaceModel, opacity: f32) -> Self {
        Self {
            model,
            opacity: Some(opacity),
        }
    }

    /// Instantiates the closure at a shading point under the given
    /// wavelength bundle.
    pub fn closure(&self, it: &Interaction, swl: &SampledWavelengths) -> SurfaceClosure {
        let dim = swl.dimension();
        let kind = match self.model {
            SurfaceModel::Matte { albedo } => ClosureKind::Matte {
                albedo: uplift(albedo, swl),
            },
            SurfaceModel::Mirror { reflectance } => ClosureKind::Mirror {
                reflectance: uplift(reflectance, swl),
            },
            SurfaceModel::Glass {
                eta,
                dispersion,
                reflectance,
                transmittance,
            } => {
                let lambda = if swl.is_fixed_basis() {
                    589.0
                } else {
                    swl.lambda(0)
                };
                ClosureKind::Glass {
                    eta: cauchy_eta(eta, dispersion, lambda),
                    dispersive: dispersion != 0.0 && !swl.is_fixed_basis(),
                    reflectance: uplift(reflectance, swl),
                    transmittance: uplift(transmittance, swl),
                }
            }
        };
        SurfaceClosure {
            shading: it.shading,
            dim,
            kind,
            opacity: self.opacity,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum SurfaceModel {
    /// Lambertian reflector.
    Matte { albedo: Vec3 },
    /// Perfect specular reflector.
    Mirror { reflectance: Vec3 },
    /// Smooth dielectric. `dispersion` is the Cauchy B coefficient in
    /// µm²; non-zero makes the surface dispersive under a spectral
    /// basis.
    Glass {
        eta: f32,
        dispersion: f32,
        reflectance: Vec3,
        transmittance: Vec3,
    },
}

enum ClosureKind {
    Matte {
        albedo: SampledSpectrum,
    },
    Mirror {
        reflectance: SampledSpectrum,
    },
    Glass {
        eta: f32,
        dispersive: bool,
        reflectance: SampledSpectrum,
        transmittance: SampledSpectrum,
    },
}

/// A surface evaluated at one shading point.
pub struct SurfaceClosure {
    shading: Frame,
    dim: u32,
    kind: ClosureKind,
    opacity: Option<f32>,
}

impl SurfaceClosure {
    pub fn opacity(&self) -> Option<f32> {
        self.opacity
    }

    pub fn is_dispersive(&self) -> Option<bool> {
        match self.kind {
            ClosureKind::Glass { dispersive, .. } => Some(dispersive),
            _ => None,
        }
    }

    /// Relative index of refraction, when the surface has one; feeds the
    /// Russian-roulette η² rescale.
    pub fn eta(&self) -> Option<f32> {
        match self.kind {
            ClosureKind::Glass { eta, .. } => Some(eta),
            _ => None,
        }
    }

    /// (u, v) GGX-style roughness proxy; delta lobes report zero. The
    /// photon gather uses this to decide where to stop the camera walk.
    pub fn roughness(&self) -> Vec2 {
        match self.kind {
            ClosureKind::Matte { .. } => Vec2::ONE,
            ClosureKind::Mirror { .. } | ClosureKind::Glass { .. } => Vec2::ZERO,
        }
    }

    pub fn evaluate(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> ClosureEval {
        let wo_local = self.shading.to_local(wo);
        let wi_local = self.shading.to_local(wi);
        match &self.kind {
            ClosureKind::Matte { albedo } => {
                if wo_local.z * wi_local.z <= 0.0 {
                    return ClosureEval::zero(self.dim);
                }
                let cos_i = wi_local.z.abs();
                ClosureEval {
                    f: *albedo * (std::f32::consts::FRAC_1_PI * cos_i),
                    pdf: cosine_hemisphere_pdf(cos_i),
                }
            }
            // Delta lobes never match a sampled direction.
            ClosureKind::Mirror { .. } | ClosureKind::Glass { .. } => ClosureEval::zero(self.dim),
        }
    }

    pub fn sample(
        &self,
        wo: Vec3,
        u_lobe: f32,
        u_dir: Vec2,
        mode: TransportMode,
    ) -> SurfaceSample {
        let wo_local = self.shading.to_local(wo);
        match &self.kind {
            ClosureKind::Matte { albedo } => {
                let mut wi_local = sample_cosine_hemisphere(u_dir);
                if wo_local.z < 0.0 {
                    wi_local.z = -wi_local.z;
                }
                let cos_i = wi_local.z.abs();
                SurfaceSample {
                    wi: self.shading.to_world(wi_local),
                    eval: ClosureEval {
                        f: *albedo * (std::f32::consts::FRAC_1_PI * cos_i),
                        pdf: cosine_hemisphere_pdf(cos_i),
                    },
                    event: ScatterEvent::Reflect,
                }
            }
            ClosureKind::Mirror { reflectance } => {
                let wi_local = Vec3::new(-wo_local.x, -wo_local.y, wo_local.z);
                SurfaceSample {
                    wi: self.shading.to_world(wi_local),
                    eval: ClosureEval {
                        f: *reflectance * DELTA_PDF,
                        pdf: DELTA_PDF,
                    },
                    event: ScatterEvent::Reflect,
                }
            }
            ClosureKind::Glass {
                eta,
                reflectance,
                transmittance,
                ..
            } => self.sample_glass(
                wo_local,
                *eta,
                reflectance,
                transmittance,
                u_lobe,
                mode,
            ),
        }
    }

    fn sample_glass(
        &self,
        wo_local: Vec3,
        eta: f32,
        reflectance: &SampledSpectrum,
        transmittance: &SampledSpectrum,
        u_lobe: f32,
        mode: TransportMode,
    ) -> SurfaceSample {
        let cos_i = wo_local.z;
        let entering = cos_i > 0.0;
        // Ratio of transmitted-side over incident-side index; vacuum
        // outside.
        let eta_rel = if entering { eta } else { 1.0 / eta };
        let fresnel = fresnel_dielectric(cos_i.abs(), eta_rel);

        if u_lobe < fresnel {
            let wi_local = Vec3::new(-wo_local.x, -wo_local.y, wo_local.z);
            return SurfaceSample {
                wi: self.shading.to_world(wi_local),
                eval: ClosureEval {
                    f: *reflectance * (fresnel * DELTA_PDF),
                    pdf: fresnel * DELTA_PDF,
                },
                event: ScatterEvent::Reflect,
            };
        }

        let sin2_t = (1.0 - cos_i * cos_i) / (eta_rel * eta_rel);
        debug_assert!(sin2_t < 1.0, "total internal reflection has fresnel 1");
        let cos_t = (1.0 - sin2_t).max(0.0).sqrt();
        let wi_local = Vec3::new(
            -wo_local.x / eta_rel,
            -wo_local.y / eta_rel,
            -cos_i.signum() * cos_t,
        )
        .normalize();
        // Radiance compresses by η² crossing into the denser medium;
        // importance transport carries no such factor.
        let scale = match mode {
            TransportMode::Radiance => 1.0 / (eta_rel * eta_rel),
            TransportMode::Importance => 1.0,
        };
        SurfaceSample {
            wi: self.shading.to_world(wi_local),
            eval: ClosureEval {
                f: *transmittance * ((1.0 - fresnel) * scale * DELTA_PDF),
                pdf: (1.0 - fresnel) * DELTA_PDF,
            },
            event: if entering {
                ScatterEvent::Enter
            } else {
                ScatterEvent::Exit
            },
        }
    }
}

/// Unpolarized Fresnel reflectance for a smooth dielectric.
/// `cos_i` is the absolute incident cosine, `eta` the transmitted-over-
/// incident index ratio.
pub fn fresnel_dielectric(cos_i: f32, eta: f32) -> f32 {
    let sin2_t = (1.0 - cos_i * cos_i) / (eta * eta);
    if sin2_t >= 1.0 {
        return 1.0;
    }
    let cos_t = (1.0 - sin2_t).sqrt();
    let r_parl = (eta * cos_i - cos_t) / (eta * cos_i + cos_t);
    let r_perp = (cos_i - eta * cos_t) / (cos_i + eta * cos_t);
    0.5 * (r_parl * r_parl + r_perp * r_perp)
}

/// Cauchy dispersion: η(λ) = η₀ + B (1/λ² − 1/λ_d²) with λ in µm and
/// the sodium d-line as the anchor.
fn cauchy_eta(eta: f32, dispersion: f32, lambda_nm: f32) -> f32 {
    if dispersion == 0.0 {
        return eta;
    }
    let lambda_um = lambda_nm * 1e-3;
    let anchor = 0.5893f32;
    eta + dispersion * (1.0 / (lambda_um * lambda_um) - 1.0 / (anchor * anchor))
}

/// Evaluates an RGB reflectance at a wavelength bundle. A smooth
/// partition-of-unity over the visible range keeps grey inputs exactly
/// flat and bounded by the largest channel.
pub(crate) fn uplift(rgb: Vec3, swl: &SampledWavelengths) -> SampledSpectrum {
    if swl.is_fixed_basis() {
        return SampledSpectrum::from_lanes(3, [rgb.x, rgb.y, rgb.z, 0.0]);
    }
    let mut out = SampledSpectrum::zero(swl.dimension());
    for i in 0..swl.dimension() as usize {
        let lambda = swl.lambda(i);
        let blue = 1.0 - sigmoid((lambda - 490.0) / 25.0);
        let red = sigmoid((lambda - 580.0) / 25.0);
        let green = (1.0 - blue - red).max(0.0);
        out.set(i, rgb.x * red + rgb.y * green + rgb.z * blue);
    }
    out
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    0.5 + 0.5 * x / (1.0 + x * x).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{InstanceFlags, InstanceInfo};
    use approx::assert_relative_eq;
    use lumen_core::spectrum::{HeroWavelengthSpectrum, Spectrum};

    fn test_interaction() -> Interaction {
        Interaction {
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
        }
    }

    #[test]
    fn matte_sample_throughput_equals_albedo() {
        let desc = SurfaceDesc::new(SurfaceModel::Matte {
            albedo: Vec3::splat(0.7),
        });
        let closure = desc.closure(&test_interaction(), &SampledWavelengths::rgb());
        let wo = Vec3::new(0.2, -0.1, 0.9).normalize();
        let s = closure.sample(wo, 0.3, Vec2::new(0.6, 0.1), TransportMode::Radiance);
        assert!(s.eval.pdf > 0.0);
        let throughput = s.eval.f * (1.0 / s.eval.pdf);
        for i in 0..3 {
            assert_relative_eq!(throughput.at(i), 0.7, epsilon = 1e-5);
        }
        assert_eq!(s.event, ScatterEvent::Reflect);
    }

    #[test]
    fn matte_evaluate_rejects_transmission() {
        let desc = SurfaceDesc::new(SurfaceModel::Matte { albedo: Vec3::ONE });
        let closure = desc.closure(&test_interaction(), &SampledWavelengths::rgb());
        let eval = closure.evaluate(Vec3::Z, Vec3::NEG_Z, TransportMode::Radiance);
        assert_eq!(eval.pdf, 0.0);
        assert!(eval.f.all(|v| v == 0.0));
    }

    #[test]
    fn mirror_uses_the_delta_sentinel() {
        let desc = SurfaceDesc::new(SurfaceModel::Mirror {
            reflectance: Vec3::splat(0.9),
        });
        let closure = desc.closure(&test_interaction(), &SampledWavelengths::rgb());
        let wo = Vec3::new(0.3, 0.0, 0.95).normalize();
        let s = closure.sample(wo, 0.0, Vec2::ZERO, TransportMode::Radiance);
        assert_eq!(s.eval.pdf, DELTA_PDF);
        assert_relative_eq!(s.wi.z, wo.z, epsilon = 1e-6);
        assert_relative_eq!(s.wi.x, -wo.x, epsilon = 1e-6);
        // evaluate() never matches a delta lobe
        let eval = closure.evaluate(wo, s.wi, TransportMode::Radiance);
        assert_eq!(eval.pdf, 0.0);
    }

    #[test]
    fn glass_refraction_reports_enter_and_exit() {
        let desc = SurfaceDesc::new(SurfaceModel::Glass {
            eta: 1.5,
            dispersion: 0.0,
            reflectance: Vec3::ONE,
            transmittance: Vec3::ONE,
        });
        let closure = desc.closure(&test_interaction(), &SampledWavelengths::rgb());
        let wo = Vec3::new(0.1, 0.0, 0.995).normalize();
        // u_lobe = 1.0 forces transmission past any fresnel value
        let s = closure.sample(wo, 0.999, Vec2::ZERO, TransportMode::Radiance);
        assert_eq!(s.event, ScatterEvent::Enter);
        assert!(s.wi.z < 0.0);

        // same interface approached from inside the medium
        let wo_inside = Vec3::new(0.1, 0.0, -0.995).normalize();
        let s_back = closure.sample(wo_inside, 0.999, Vec2::ZERO, TransportMode::Radiance);
        assert_eq!(s_back.event, ScatterEvent::Exit);
        assert!(s_back.wi.z > 0.0);
    }

    #[test]
    fn glass_is_dispersive_only_under_a_spectral_basis() {
        let desc = SurfaceDesc::new(SurfaceModel::Glass {
            eta: 1.5,
            dispersion: 0.01,
            reflectance: Vec3::ONE,
            transmittance: Vec3::ONE,
        });
        let rgb = desc.closure(&test_interaction(), &SampledWavelengths::rgb());
        assert_eq!(rgb.is_dispersive(), Some(false));

        let spectrum = HeroWavelengthSpectrum::new(4);
        let swl = spectrum.sample(0.5);
        let spectral = desc.closure(&test_interaction(), &swl);
        assert_eq!(spectral.is_dispersive(), Some(true));
    }

    #[test]
    fn fresnel_is_one_past_critical_angle() {
        // grazing from the dense side
        assert_eq!(fresnel_dielectric(0.1, 1.0 / 1.5), 1.0);
        // normal incidence on glass: ((1.5-1)/(1.5+1))^2 = 0.04
        assert_relative_eq!(fresnel_dielectric(1.0, 1.5), 0.04, epsilon = 1e-4);
    }

    #[test]
    fn grey_uplift_is_flat() {
        let spectrum = HeroWavelengthSpectrum::new(4);
        let swl = spectrum.sample(0.25);
        let s = uplift(Vec3::splat(0.5), &swl);
        for i in 0..4 {
            assert_relative_eq!(s.at(i), 0.5, epsilon = 1e-5);
        }
    }
}
