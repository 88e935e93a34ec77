//! Rays and intersection records, laid out as plain data so the
//! path-state store can keep them in flat columns.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Instance id marking a missed ray.
pub const INVALID_INSTANCE: u32 = u32::MAX;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Ray {
    pub origin: [f32; 3],
    pub t_min: f32,
    pub direction: [f32; 3],
    pub t_max: f32,
}

impl Ray {
    /// A ray with a small origin offset already applied by the caller;
    /// `direction` must be normalized.
    pub fn new(origin: Vec3, direction: Vec3, t_min: f32, t_max: f32) -> Self {
        debug_assert!(t_min > 0.0, "t_min must stay off the surface");
        Self {
            origin: origin.to_array(),
            t_min,
            direction: direction.to_array(),
            t_max,
        }
    }

    pub fn spanning(origin: Vec3, direction: Vec3) -> Self {
        Self::new(origin, direction, 1e-3, f32::MAX)
    }

    #[inline]
    pub fn origin(&self) -> Vec3 {
        Vec3::from_array(self.origin)
    }

    #[inline]
    pub fn direction(&self) -> Vec3 {
        Vec3::from_array(self.direction)
    }

    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin() + self.direction() * t
    }
}

impl Default for Ray {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::Z, 1e-3, f32::MAX)
    }
}

/// Result of a closest-hit query. A miss is encoded by the all-bits-one
/// instance sentinel rather than an `Option` so the record stays `Pod`
/// inside the state store.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Hit {
    pub inst: u32,
    pub prim: u32,
    pub bary: [f32; 2],
    pub distance: f32,
    pub _pad: u32,
}

impl Hit {
    pub fn miss() -> Self {
        Self {
            inst: INVALID_INSTANCE,
            prim: 0,
            bary: [0.0; 2],
            distance: f32::MAX,
            _pad: 0,
        }
    }

    pub fn surface(inst: u32, prim: u32, bary: Vec2, distance: f32) -> Self {
        Self {
            inst,
            prim,
            bary: bary.to_array(),
            distance,
            _pad: 0,
        }
    }

    #[inline]
    pub fn is_miss(&self) -> bool {
        self.inst == INVALID_INSTANCE
    }

    #[inline]
    pub fn bary(&self) -> Vec2 {
        Vec2::from_array(self.bary)
    }
}

impl Default for Hit {
    fn default() -> Self {
        Self::miss()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_sentinel_is_all_bits_one() {
        assert_eq!(Hit::miss().inst, u32::MAX);
        assert!(Hit::miss().is_miss());
        assert!(!Hit::surface(0, 3, Vec2::ZERO, 1.0).is_miss());
    }

    #[test]
    fn ray_evaluates_points_along_direction() {
        let ray = Ray::spanning(Vec3::ZERO, Vec3::X);
        assert_eq!(ray.at(2.5), Vec3::new(2.5, 0.0, 0.0));
    }
}
