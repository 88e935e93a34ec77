//! A linear-traversal scene of analytic primitives.
//!
//! This is the reference implementation of the geometry oracle and
//! light-sampler contracts used by the test suites and demos. Traversal
//! is a plain loop over the primitive list; a production scene swaps in
//! an accelerated oracle behind the same traits.

use glam::{Vec2, Vec3};

use lumen_core::math::{
    sample_cosine_hemisphere, sample_concentric_disk, sample_uniform_sphere, uniform_sphere_pdf,
    Aabb, Frame,
};
use lumen_core::ray::{Hit, Ray};
use lumen_core::spectrum::SampledWavelengths;

use crate::geometry::{Geometry, InstanceFlags, InstanceInfo, Interaction};
use crate::light::{LightEval, LightLeSample, LightSample, LightSampler};
use crate::surface::{uplift, SurfaceDesc};
use crate::RenderScene;

#[derive(Clone, Copy, Debug)]
pub enum Shape {
    Sphere {
        center: Vec3,
        radius: f32,
    },
    /// Parallelogram spanned by two edges; the normal follows
    /// `edge_u × edge_v`.
    Quad {
        origin: Vec3,
        edge_u: Vec3,
        edge_v: Vec3,
    },
}

impl Shape {
    fn intersect(&self, ray: &Ray) -> Option<(f32, Vec2)> {
        match *self {
            Shape::Sphere { center, radius } => {
                let oc = ray.origin() - center;
                let b = oc.dot(ray.direction());
                let c = oc.length_squared() - radius * radius;
                let disc = b * b - c;
                if disc < 0.0 {
                    return None;
                }
                let sqrt_disc = disc.sqrt();
                let mut t = -b - sqrt_disc;
                if t < ray.t_min {
                    t = -b + sqrt_disc;
                }
                if t < ray.t_min || t > ray.t_max {
                    return None;
                }
                let p = (ray.at(t) - center) / radius;
                let uv = Vec2::new(
                    0.5 + p.z.atan2(p.x) * 0.5 * std::f32::consts::FRAC_1_PI,
                    p.y.clamp(-1.0, 1.0).acos() * std::f32::consts::FRAC_1_PI,
                );
                Some((t, uv))
            }
            Shape::Quad {
                origin,
                edge_u,
                edge_v,
            } => {
                let normal = edge_u.cross(edge_v);
                let denom = normal.dot(ray.direction());
                if denom.abs() < 1e-9 {
                    return None;
                }
                let t = normal.dot(origin - ray.origin()) / denom;
                if t < ray.t_min || t > ray.t_max {
                    return None;
                }
                let q = ray.at(t) - origin;
                let (a, b, c) = (
                    edge_u.length_squared(),
                    edge_u.dot(edge_v),
                    edge_v.length_squared(),
                );
                let det = a * c - b * b;
                if det.abs() < 1e-12 {
                    return None;
                }
                let (qu, qv) = (q.dot(edge_u), q.dot(edge_v));
                let u = (c * qu - b * qv) / det;
                let v = (a * qv - b * qu) / det;
                if !(0.0..=1.0).contains(&u) || !(0.0..=1.0).contains(&v) {
                    return None;
                }
                Some((t, Vec2::new(u, v)))
            }
        }
    }

    fn normal_at(&self, p: Vec3) -> Vec3 {
        match *self {
            Shape::Sphere { center, radius } => (p - center) / radius,
            Shape::Quad {
                edge_u, edge_v, ..
            } => edge_u.cross(edge_v).normalize(),
        }
    }

    fn area(&self) -> f32 {
        match *self {
            Shape::Sphere { radius, .. } => 4.0 * std::f32::consts::PI * radius * radius,
            Shape::Quad {
                edge_u, edge_v, ..
            } => edge_u.cross(edge_v).length(),
        }
    }

    /// Uniform point on the shape with its outward normal.
    fn sample_point(&self, u: Vec2) -> (Vec3, Vec3) {
        match *self {
            Shape::Sphere { center, radius } => {
                let n = sample_uniform_sphere(u);
                (center + n * radius, n)
            }
            Shape::Quad {
                origin,
                edge_u,
                edge_v,
            } => (
                origin + edge_u * u.x + edge_v * u.y,
                edge_u.cross(edge_v).normalize(),
            ),
        }
    }

    fn bounds(&self) -> Aabb {
        match *self {
            Shape::Sphere { center, radius } => Aabb {
                min: center - Vec3::splat(radius),
                max: center + Vec3::splat(radius),
            },
            Shape::Quad {
                origin,
                edge_u,
                edge_v,
            } => {
                let mut bounds = Aabb::EMPTY;
                for p in [
                    origin,
                    origin + edge_u,
                    origin + edge_v,
                    origin + edge_u + edge_v,
                ] {
                    bounds.extend(p);
                }
                bounds
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Primitive {
    pub shape: Shape,
    /// Surface tag into the scene's surface table.
    pub surface: Option<u32>,
    /// One-sided emitted radiance along the shape normal.
    pub emission: Option<Vec3>,
}

impl Primitive {
    pub fn surface(shape: Shape, surface_tag: u32) -> Self {
        Self {
            shape,
            surface: Some(surface_tag),
            emission: None,
        }
    }

    pub fn emitter(shape: Shape, emission: Vec3) -> Self {
        Self {
            shape,
            surface: None,
            emission: Some(emission),
        }
    }

    pub fn emissive_surface(shape: Shape, surface_tag: u32, emission: Vec3) -> Self {
        Self {
            shape,
            surface: Some(surface_tag),
            emission: Some(emission),
        }
    }
}

pub struct PrimitiveScene {
    primitives: Vec<Primitive>,
    surfaces: Vec<SurfaceDesc>,
    /// Uniform environment radiance, if any.
    environment: Option<Vec3>,
    /// Primitive indices with emission, in primitive order.
    emitters: Vec<u32>,
    bounds: Aabb,
}

impl PrimitiveScene {
    pub fn new(
        primitives: Vec<Primitive>,
        surfaces: Vec<SurfaceDesc>,
        environment: Option<Vec3>,
    ) -> Self {
        let emitters = primitives
            .iter()
            .enumerate()
            .filter(|(_, p)| p.emission.is_some())
            .map(|(i, _)| i as u32)
            .collect();
        let bounds = primitives
            .iter()
            .map(|p| p.shape.bounds())
            .fold(Aabb::EMPTY, |acc, b| acc.union(&b));
        Self {
            primitives,
            surfaces,
            environment,
            emitters,
            bounds,
        }
    }

    pub fn primitives(&self) -> &[Primitive] {
        &self.primitives
    }

    /// Number of strategies light sampling chooses among: every area
    /// emitter plus the environment when present.
    fn strategy_count(&self) -> usize {
        self.emitters.len() + usize::from(self.environment.is_some())
    }

    fn info_for(&self, prim: &Primitive) -> InstanceInfo {
        let mut flags = InstanceFlags::empty();
        if prim.surface.is_some() {
            flags |= InstanceFlags::HAS_SURFACE;
        }
        if prim.emission.is_some() {
            flags |= InstanceFlags::HAS_LIGHT;
        }
        InstanceInfo {
            flags,
            surface_tag: prim.surface.unwrap_or(0),
            light_tag: prim.emission.map(|_| 0).unwrap_or(0),
        }
    }
}

impl Geometry for PrimitiveScene {
    fn trace_closest(&self, ray: &Ray) -> Hit {
        let mut best = Hit::miss();
        let mut clipped = *ray;
        for (index, prim) in self.primitives.iter().enumerate() {
            if let Some((t, uv)) = prim.shape.intersect(&clipped) {
                best = Hit::surface(index as u32, index as u32, uv, t);
                clipped.t_max = t;
            }
        }
        best
    }

    fn trace_any(&self, ray: &Ray) -> bool {
        self.primitives
            .iter()
            .any(|prim| prim.shape.intersect(ray).is_some())
    }

    fn interaction(&self, ray: &Ray, hit: &Hit) -> Interaction {
        debug_assert!(!hit.is_miss());
        let prim = &self.primitives[hit.prim as usize];
        let position = ray.at(hit.distance);
        let geometric_normal = prim.shape.normal_at(position);
        // No shading-normal authoring here; the fallback rule makes the
        // shading frame the geometric frame.
        Interaction {
            position,
            geometric_normal,
            shading: Frame::from_normal(geometric_normal),
            uv: hit.bary(),
            inst: hit.inst,
            prim: hit.prim,
            info: self.info_for(prim),
        }
    }

    fn instance(&self, inst: u32) -> InstanceInfo {
        self.info_for(&self.primitives[inst as usize])
    }

    fn world_bounds(&self) -> Aabb {
        self.bounds
    }
}

impl LightSampler for PrimitiveScene {
    fn sample(
        &self,
        it: &Interaction,
        u_sel: f32,
        u_surf: Vec2,
        swl: &SampledWavelengths,
        _time: f32,
    ) -> LightSample {
        let n = self.strategy_count();
        if n == 0 {
            return LightSample {
                eval: LightEval::zero(swl.dimension()),
                shadow_ray: it.spawn_ray(it.geometric_normal),
            };
        }
        let sel_pdf = 1.0 / n as f32;
        let index = ((u_sel * n as f32) as usize).min(n - 1);

        if index == self.emitters.len() {
            // environment strategy
            let env = self.environment.expect("strategy index implies env");
            let wi = sample_uniform_sphere(u_surf);
            return LightSample {
                eval: LightEval {
                    l: uplift(env, swl),
                    pdf: sel_pdf * uniform_sphere_pdf(),
                },
                shadow_ray: it.spawn_ray(wi),
            };
        }

        let prim_index = self.emitters[index];
        let prim = &self.primitives[prim_index as usize];
        let emission = prim.emission.expect("emitter table entry");
        let (p, normal) = prim.shape.sample_point(u_surf);
        let delta = p - it.position;
        let dist2 = delta.length_squared();
        if dist2 < 1e-12 {
            return LightSample {
                eval: LightEval::zero(swl.dimension()),
                shadow_ray: it.spawn_ray(it.geometric_normal),
            };
        }
        let wi = delta / dist2.sqrt();
        let cos_light = normal.dot(-wi);
        if cos_light <= 0.0 {
            // back side of a one-sided emitter
            return LightSample {
                eval: LightEval::zero(swl.dimension()),
                shadow_ray: it.spawn_ray(wi),
            };
        }
        let pdf_area = 1.0 / prim.shape.area();
        let pdf_omega = pdf_area * dist2 / cos_light;
        LightSample {
            eval: LightEval {
                l: uplift(emission, swl),
                pdf: sel_pdf * pdf_omega,
            },
            shadow_ray: it.spawn_ray_to(p),
        }
    }

    fn evaluate_hit(
        &self,
        it: &Interaction,
        p_from: Vec3,
        swl: &SampledWavelengths,
        _time: f32,
    ) -> LightEval {
        let n = self.strategy_count();
        let prim = &self.primitives[it.prim as usize];
        let Some(emission) = prim.emission else {
            return LightEval::zero(swl.dimension());
        };
        let delta = it.position - p_from;
        let dist2 = delta.length_squared();
        let wi = delta / dist2.sqrt().max(1e-6);
        let cos_light = it.geometric_normal.dot(-wi);
        if cos_light <= 0.0 || n == 0 {
            return LightEval::zero(swl.dimension());
        }
        let pdf_area = 1.0 / prim.shape.area();
        LightEval {
            l: uplift(emission, swl),
            pdf: pdf_area * dist2 / cos_light / n as f32,
        }
    }

    fn evaluate_miss(&self, _wi: Vec3, swl: &SampledWavelengths, _time: f32) -> LightEval {
        match self.environment {
            Some(env) => LightEval {
                l: uplift(env, swl),
                pdf: uniform_sphere_pdf() / self.strategy_count() as f32,
            },
            None => LightEval::zero(swl.dimension()),
        }
    }

    fn sample_le(
        &self,
        u_sel: f32,
        u_surf: Vec2,
        u_dir: Vec2,
        swl: &SampledWavelengths,
        _time: f32,
    ) -> LightLeSample {
        let n = self.strategy_count();
        if n == 0 {
            return LightLeSample {
                eval: LightEval::zero(swl.dimension()),
                ray: Ray::default(),
            };
        }
        let sel_pdf = 1.0 / n as f32;
        let index = ((u_sel * n as f32) as usize).min(n - 1);

        if index == self.emitters.len() {
            // environment photons launch inward from the bounding sphere
            let env = self.environment.expect("strategy index implies env");
            let direction = -sample_uniform_sphere(u_dir);
            let radius = self.bounds.radius().max(1.0) * 1.5;
            let frame = Frame::from_normal(direction);
            let disk = sample_concentric_disk(u_surf) * radius;
            let origin = self.bounds.center() - direction * radius
                + frame.tangent * disk.x
                + frame.bitangent * disk.y;
            let pdf_pos = 1.0 / (std::f32::consts::PI * radius * radius);
            return LightLeSample {
                eval: LightEval {
                    l: uplift(env, swl),
                    pdf: sel_pdf * uniform_sphere_pdf() * pdf_pos,
                },
                ray: Ray::spanning(origin, direction),
            };
        }

        let prim = &self.primitives[self.emitters[index] as usize];
        let emission = prim.emission.expect("emitter table entry");
        let (p, normal) = prim.shape.sample_point(u_surf);
        let local = sample_cosine_hemisphere(u_dir);
        let frame = Frame::from_normal(normal);
        let direction = frame.to_world(local);
        let pdf_area = 1.0 / prim.shape.area();
        // cosine direction pdf over the emitted cosine cancel; the flux
        // estimator only keeps the area and selection terms.
        LightLeSample {
            eval: LightEval {
                l: uplift(emission, swl),
                pdf: sel_pdf * pdf_area * std::f32::consts::FRAC_1_PI,
            },
            ray: Ray::spanning(p + normal * 1e-4, direction),
        }
    }
}

impl RenderScene for PrimitiveScene {
    fn geometry(&self) -> &dyn Geometry {
        self
    }

    fn light_sampler(&self) -> &dyn LightSampler {
        self
    }

    fn surfaces(&self) -> &[SurfaceDesc] {
        &self.surfaces
    }

    fn has_environment(&self) -> bool {
        self.environment.is_some()
    }

    fn light_count(&self) -> usize {
        self.emitters.len()
    }
}
