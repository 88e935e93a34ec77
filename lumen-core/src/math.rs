//! Shared sampling math: orthonormal frames, bounds, warps, MIS.

use glam::{Vec2, Vec3};

/// Orthonormal shading/geometric frame.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub tangent: Vec3,
    pub bitangent: Vec3,
    pub normal: Vec3,
}

impl Frame {
    /// Builds a frame around `normal` (Duff et al. branchless basis).
    pub fn from_normal(normal: Vec3) -> Self {
        let sign = 1.0f32.copysign(normal.z);
        let a = -1.0 / (sign + normal.z);
        let b = normal.x * normal.y * a;
        Self {
            tangent: Vec3::new(1.0 + sign * normal.x * normal.x * a, sign * b, -sign * normal.x),
            bitangent: Vec3::new(b, sign + normal.y * normal.y * a, -normal.y),
            normal,
        }
    }

    pub fn to_world(&self, v: Vec3) -> Vec3 {
        self.tangent * v.x + self.bitangent * v.y + self.normal * v.z
    }

    pub fn to_local(&self, v: Vec3) -> Vec3 {
        Vec3::new(v.dot(self.tangent), v.dot(self.bitangent), v.dot(self.normal))
    }
}

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    pub fn extend(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn extent(&self) -> Vec3 {
        (self.max - self.min).max(Vec3::ZERO)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Radius of the bounding sphere.
    pub fn radius(&self) -> f32 {
        self.extent().length() * 0.5
    }
}

#[inline]
pub fn sqr(x: f32) -> f32 {
    x * x
}

/// Balance-heuristic MIS weight `a / (a + b)`.
///
/// A `pdf_bsdf` sentinel of [`DELTA_PDF`] drives the weight to one for
/// delta-like directions that light sampling cannot hit.
#[inline]
pub fn balance_heuristic(pdf_a: f32, pdf_b: f32) -> f32 {
    pdf_a / (pdf_a + pdf_b)
}

/// Pdf sentinel for directions not produced by a density (camera rays,
/// alpha passthrough, specular lobes).
pub const DELTA_PDF: f32 = 1e16;

pub fn sample_uniform_sphere(u: Vec2) -> Vec3 {
    let z = 1.0 - 2.0 * u.x;
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = 2.0 * std::f32::consts::PI * u.y;
    Vec3::new(r * phi.cos(), r * phi.sin(), z)
}

#[inline]
pub fn uniform_sphere_pdf() -> f32 {
    1.0 / (4.0 * std::f32::consts::PI)
}

/// Concentric disk warp (Shirley–Chiu).
pub fn sample_concentric_disk(u: Vec2) -> Vec2 {
    let offset = 2.0 * u - Vec2::ONE;
    if offset == Vec2::ZERO {
        return Vec2::ZERO;
    }
    let (r, theta) = if offset.x.abs() > offset.y.abs() {
        (
            offset.x,
            std::f32::consts::FRAC_PI_4 * (offset.y / offset.x),
        )
    } else {
        (
            offset.y,
            std::f32::consts::FRAC_PI_2 - std::f32::consts::FRAC_PI_4 * (offset.x / offset.y),
        )
    };
    r * Vec2::new(theta.cos(), theta.sin())
}

pub fn sample_cosine_hemisphere(u: Vec2) -> Vec3 {
    let d = sample_concentric_disk(u);
    let z = (1.0 - d.length_squared()).max(0.0).sqrt();
    Vec3::new(d.x, d.y, z)
}

#[inline]
pub fn cosine_hemisphere_pdf(cos_theta: f32) -> f32 {
    cos_theta.max(0.0) * std::f32::consts::FRAC_1_PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn frame_round_trips() {
        for n in [Vec3::Z, Vec3::NEG_Z, Vec3::new(0.3, -0.8, 0.52).normalize()] {
            let frame = Frame::from_normal(n);
            let v = Vec3::new(0.1, 0.7, -0.2);
            let back = frame.to_local(frame.to_world(v));
            assert_relative_eq!(back.x, v.x, epsilon = 1e-5);
            assert_relative_eq!(back.y, v.y, epsilon = 1e-5);
            assert_relative_eq!(back.z, v.z, epsilon = 1e-5);
        }
    }

    #[test]
    fn balance_heuristic_saturates_for_delta_pdfs() {
        assert!(balance_heuristic(DELTA_PDF, 3.0) > 0.999_999);
        assert_relative_eq!(balance_heuristic(1.0, 1.0), 0.5);
    }

    #[test]
    fn sphere_samples_are_unit_length() {
        for k in 0..64 {
            let u = Vec2::new((k % 8) as f32 / 8.0, (k / 8) as f32 / 8.0);
            let d = sample_uniform_sphere(u);
            assert_relative_eq!(d.length(), 1.0, epsilon = 1e-4);
        }
    }
}
