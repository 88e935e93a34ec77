//! Shared scene fixtures for the integrator test suites.
#![allow(dead_code)]

use glam::{UVec2, Vec3};

use lumen_core::camera::PinholeCamera;
use lumen_core::film::Film;
use lumen_scene::primitive::{Primitive, PrimitiveScene, Shape};
use lumen_scene::surface::{SurfaceDesc, SurfaceModel};

/// RUST_LOG-controlled logging for test debugging.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn quad(origin: Vec3, edge_u: Vec3, edge_v: Vec3) -> Shape {
    Shape::Quad {
        origin,
        edge_u,
        edge_v,
    }
}

/// A 2x2x2 box open toward the camera, diffuse walls, one ceiling
/// light. Surface 0 is white matte; extra surfaces may be appended.
pub fn cornell_box(extra: Vec<(Primitive, SurfaceDesc)>) -> PrimitiveScene {
    let white = SurfaceDesc::new(SurfaceModel::Matte {
        albedo: Vec3::splat(0.73),
    });
    let red = SurfaceDesc::new(SurfaceModel::Matte {
        albedo: Vec3::new(0.65, 0.05, 0.05),
    });
    let green = SurfaceDesc::new(SurfaceModel::Matte {
        albedo: Vec3::new(0.12, 0.45, 0.15),
    });
    let mut surfaces = vec![white, red, green];
    let mut primitives = vec![
        // floor (normal up)
        Primitive::surface(
            quad(Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0), Vec3::new(2.0, 0.0, 0.0)),
            0,
        ),
        // ceiling (normal down)
        Primitive::surface(
            quad(
                Vec3::new(0.0, 2.0, 0.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 2.0),
            ),
            0,
        ),
        // back wall (normal -z)
        Primitive::surface(
            quad(
                Vec3::new(0.0, 0.0, 2.0),
                Vec3::new(0.0, 2.0, 0.0),
                Vec3::new(2.0, 0.0, 0.0),
            ),
            0,
        ),
        // left wall (normal +x)
        Primitive::surface(
            quad(Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 0.0, 2.0)),
            1,
        ),
        // right wall (normal -x)
        Primitive::surface(
            quad(
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 2.0),
                Vec3::new(0.0, 2.0, 0.0),
            ),
            2,
        ),
        // ceiling light (normal down)
        Primitive::emitter(
            quad(
                Vec3::new(0.7, 1.99, 0.7),
                Vec3::new(0.6, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 0.6),
            ),
            Vec3::splat(12.0),
        ),
    ];
    for (primitive, desc) in extra {
        let mut primitive = primitive;
        if let Some(tag) = primitive.surface.as_mut() {
            *tag = surfaces.len() as u32;
            surfaces.push(desc);
        }
        primitives.push(primitive);
    }
    PrimitiveScene::new(primitives, surfaces, None)
}

pub fn cornell_camera(resolution: u32) -> PinholeCamera {
    PinholeCamera::new(
        Vec3::new(1.0, 1.0, -2.0),
        Vec3::new(1.0, 1.0, 1.0),
        Vec3::Y,
        50.0,
        Film::new(UVec2::splat(resolution)),
    )
}

/// Matte sphere under a uniform unit environment; every camera ray hits
/// the sphere.
pub fn furnace_scene(albedo: f32) -> PrimitiveScene {
    PrimitiveScene::new(
        vec![Primitive::surface(
            Shape::Sphere {
                center: Vec3::new(0.0, 0.0, 3.0),
                radius: 1.0,
            },
            0,
        )],
        vec![SurfaceDesc::new(SurfaceModel::Matte {
            albedo: Vec3::splat(albedo),
        })],
        Some(Vec3::ONE),
    )
}

pub fn furnace_camera(resolution: u32) -> PinholeCamera {
    PinholeCamera::new(
        Vec3::ZERO,
        Vec3::new(0.0, 0.0, 3.0),
        Vec3::Y,
        20.0,
        Film::new(UVec2::splat(resolution)),
    )
}

pub fn mean_luminance(image: &[Vec3]) -> f32 {
    let sum: f32 = image
        .iter()
        .map(|rgb| 0.2126 * rgb.x + 0.7152 * rgb.y + 0.0722 * rgb.z)
        .sum();
    sum / image.len() as f32
}

pub fn assert_all_finite(image: &[Vec3]) {
    for (i, rgb) in image.iter().enumerate() {
        assert!(rgb.is_finite(), "pixel {i} is not finite: {rgb:?}");
    }
}
