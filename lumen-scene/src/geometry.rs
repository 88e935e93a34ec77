//! The geometry oracle consumed by the integrators.
//!
//! Acceleration-structure construction lives outside this workspace;
//! the integrators only ever see the three ray queries below plus the
//! per-instance flags needed to classify a hit.

use bitflags::bitflags;
use glam::{Vec2, Vec3};

use lumen_core::math::{Aabb, Frame};
use lumen_core::ray::{Hit, Ray};

bitflags! {
    /// What a hit instance participates in.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InstanceFlags: u32 {
        const HAS_SURFACE = 1 << 0;
        const HAS_LIGHT = 1 << 1;
    }
}

/// Flags and dispatch tags of one instance.
#[derive(Clone, Copy, Debug)]
pub struct InstanceInfo {
    pub flags: InstanceFlags,
    /// Index into the scene's surface table; only meaningful with
    /// `HAS_SURFACE`.
    pub surface_tag: u32,
    /// Index into the scene's emitter table; only meaningful with
    /// `HAS_LIGHT`.
    pub light_tag: u32,
}

impl InstanceInfo {
    pub fn has_surface(&self) -> bool {
        self.flags.contains(InstanceFlags::HAS_SURFACE)
    }

    pub fn has_light(&self) -> bool {
        self.flags.contains(InstanceFlags::HAS_LIGHT)
    }
}

/// A hit promoted to a full shading point.
#[derive(Clone, Copy, Debug)]
pub struct Interaction {
    pub position: Vec3,
    pub geometric_normal: Vec3,
    /// Shading frame; falls back to the geometric normal when the
    /// shading normal is degenerate.
    pub shading: Frame,
    pub uv: Vec2,
    pub inst: u32,
    pub prim: u32,
    pub info: InstanceInfo,
}

impl Interaction {
    pub fn has_surface(&self) -> bool {
        self.info.has_surface()
    }

    pub fn has_light(&self) -> bool {
        self.info.has_light()
    }

    pub fn surface_tag(&self) -> u32 {
        self.info.surface_tag
    }

    pub fn light_tag(&self) -> u32 {
        self.info.light_tag
    }

    /// Continuation ray with the origin nudged off the surface on the
    /// side `direction` leaves through.
    pub fn spawn_ray(&self, direction: Vec3) -> Ray {
        let side = self.geometric_normal * self.geometric_normal.dot(direction).signum();
        Ray::spanning(self.position + side * 1e-4, direction)
    }

    /// Shadow ray toward `target`, clipped short of both endpoints.
    pub fn spawn_ray_to(&self, target: Vec3) -> Ray {
        let delta = target - self.position;
        let distance = delta.length();
        let direction = delta / distance;
        let side = self.geometric_normal * self.geometric_normal.dot(direction).signum();
        Ray::new(
            self.position + side * 1e-4,
            direction,
            1e-3,
            distance * (1.0 - 1e-3),
        )
    }
}

/// Ray queries against the scene. Implementations must be safe to call
/// from any number of in-flight paths concurrently.
pub trait Geometry: Send + Sync {
    /// Nearest hit within `[t_min, t_max]`, or the miss sentinel.
    fn trace_closest(&self, ray: &Ray) -> Hit;

    /// Whether any hit exists; used for shadow rays.
    fn trace_any(&self, ray: &Ray) -> bool;

    /// Promotes a hit to a full interaction.
    fn interaction(&self, ray: &Ray, hit: &Hit) -> Interaction;

    fn instance(&self, inst: u32) -> InstanceInfo;

    fn world_bounds(&self) -> Aabb;

    /// Advances dynamic geometry to `time`; static scenes ignore it.
    fn update(&mut self, time: f32) {
        let _ = time;
    }
}
