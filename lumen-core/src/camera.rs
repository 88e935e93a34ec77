//! Camera interface and the two reference camera models.

use glam::{Mat3, UVec2, Vec2, Vec3};

use crate::film::Film;
use crate::math::sample_concentric_disk;
use crate::ray::Ray;

/// A primary ray plus the pixel it belongs to and its filter weight.
#[derive(Clone, Copy, Debug)]
pub struct CameraSample {
    pub ray: Ray,
    pub pixel: UVec2,
    pub weight: f32,
}

pub trait Camera: Send + Sync {
    /// Generates the primary ray for `pixel` at `time`. `u_filter`
    /// jitters inside the pixel; `u_lens` is only consumed when
    /// [`Camera::requires_lens_sampling`] returns true.
    fn generate_ray(&self, pixel: UVec2, time: f32, u_filter: Vec2, u_lens: Vec2) -> CameraSample;

    fn requires_lens_sampling(&self) -> bool {
        false
    }

    fn film(&self) -> &Film;
}

/// Shared look-at basis for the reference cameras.
#[derive(Clone, Copy, Debug)]
struct ViewBasis {
    position: Vec3,
    basis: Mat3,
    tan_half_fov: f32,
}

impl ViewBasis {
    fn new(position: Vec3, look_at: Vec3, up: Vec3, fov_y_degrees: f32) -> Self {
        let forward = (look_at - position).normalize();
        let right = forward.cross(up).normalize();
        let true_up = right.cross(forward);
        Self {
            position,
            basis: Mat3::from_cols(right, true_up, forward),
            tan_half_fov: (fov_y_degrees.to_radians() * 0.5).tan(),
        }
    }

    /// Direction through the (jittered) pixel in world space.
    fn pixel_direction(&self, resolution: UVec2, pixel: UVec2, u_filter: Vec2) -> Vec3 {
        let res = resolution.as_vec2();
        let p = pixel.as_vec2() + u_filter;
        let ndc = Vec2::new(
            (2.0 * p.x / res.x - 1.0) * (res.x / res.y),
            1.0 - 2.0 * p.y / res.y,
        ) * self.tan_half_fov;
        (self.basis * Vec3::new(ndc.x, ndc.y, 1.0)).normalize()
    }
}

pub struct PinholeCamera {
    view: ViewBasis,
    film: Film,
}

impl PinholeCamera {
    pub fn new(position: Vec3, look_at: Vec3, up: Vec3, fov_y_degrees: f32, film: Film) -> Self {
        Self {
            view: ViewBasis::new(position, look_at, up, fov_y_degrees),
            film,
        }
    }
}

impl Camera for PinholeCamera {
    fn generate_ray(&self, pixel: UVec2, _time: f32, u_filter: Vec2, _u_lens: Vec2) -> CameraSample {
        let direction = self
            .view
            .pixel_direction(self.film.resolution(), pixel, u_filter);
        CameraSample {
            ray: Ray::spanning(self.view.position, direction),
            pixel,
            weight: 1.0,
        }
    }

    fn film(&self) -> &Film {
        &self.film
    }
}

/// Thin-lens model with a finite aperture; exercises the scheduler's
/// lens-sample plumbing.
pub struct ThinLensCamera {
    view: ViewBasis,
    aperture_radius: f32,
    focal_distance: f32,
    film: Film,
}

impl ThinLensCamera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position: Vec3,
        look_at: Vec3,
        up: Vec3,
        fov_y_degrees: f32,
        aperture_radius: f32,
        focal_distance: f32,
        film: Film,
    ) -> Self {
        Self {
            view: ViewBasis::new(position, look_at, up, fov_y_degrees),
            aperture_radius,
            focal_distance,
            film,
        }
    }
}

impl Camera for ThinLensCamera {
    fn generate_ray(&self, pixel: UVec2, _time: f32, u_filter: Vec2, u_lens: Vec2) -> CameraSample {
        let direction = self
            .view
            .pixel_direction(self.film.resolution(), pixel, u_filter);
        // Intersect the focal plane along the pinhole direction, then
        // re-aim from a point on the lens disk.
        let forward = self.view.basis.z_axis;
        let t_focus = self.focal_distance / direction.dot(forward).max(1e-4);
        let focus = self.view.position + direction * t_focus;
        let lens = sample_concentric_disk(u_lens) * self.aperture_radius;
        let origin =
            self.view.position + self.view.basis.x_axis * lens.x + self.view.basis.y_axis * lens.y;
        CameraSample {
            ray: Ray::spanning(origin, (focus - origin).normalize()),
            pixel,
            weight: 1.0,
        }
    }

    fn requires_lens_sampling(&self) -> bool {
        true
    }

    fn film(&self) -> &Film {
        &self.film
    }
}
