//! Photon-mapping integrator tests.

mod common;

use common::*;
use lumen_core::camera::Camera;
use lumen_core::shutter;
use lumen_integrator::{Integrator, PhotonMapper, PhotonMapperConfig};

fn smoke_config() -> PhotonMapperConfig {
    PhotonMapperConfig {
        max_depth: 6,
        photon_per_iter: 20_000,
        initial_radius: -64.0,
        ..Default::default()
    }
}

#[test]
fn photon_mapping_smoke_test() {
    init_logging();
    let mut scene = cornell_box(vec![]);
    let camera = cornell_camera(16);
    let mut integrator = PhotonMapper::new(smoke_config());
    let stats = integrator
        .render(&mut scene, &camera, &shutter::instantaneous(8))
        .unwrap();
    assert_eq!(stats.iterations, 8);

    let image = camera.film().develop();
    assert_all_finite(&image);
    assert!(
        mean_luminance(&image) > 0.0,
        "photon-mapped box renders black"
    );

    // SPPM radius shrinks monotonically while photons keep arriving
    let history = integrator.radius_history();
    assert_eq!(history.len(), 8);
    for pair in history.windows(2) {
        assert!(
            pair[1] <= pair[0] + 1e-7,
            "radius grew: {} -> {}",
            pair[0],
            pair[1]
        );
    }
    assert!(history[7] < history[0], "radius never shrank: {history:?}");
}

#[test]
fn shared_and_per_pixel_radii_both_converge() {
    init_logging();
    let render = |shared: bool| {
        let mut scene = cornell_box(vec![]);
        let camera = cornell_camera(12);
        let mut integrator = PhotonMapper::new(PhotonMapperConfig {
            shared_radius: shared,
            ..smoke_config()
        });
        integrator
            .render(&mut scene, &camera, &shutter::instantaneous(4))
            .unwrap();
        mean_luminance(&camera.film().develop())
    };
    let shared = render(true);
    let per_pixel = render(false);
    assert!(shared > 0.0 && per_pixel > 0.0);
    // the two modes estimate the same image
    assert!(
        (shared - per_pixel).abs() / shared < 0.5,
        "shared {shared} vs per-pixel {per_pixel}"
    );
}

#[test]
fn positive_initial_radius_is_taken_verbatim() -> anyhow::Result<()> {
    init_logging();
    let mut scene = cornell_box(vec![]);
    let camera = cornell_camera(8);
    let mut integrator = PhotonMapper::new(PhotonMapperConfig {
        initial_radius: 0.05,
        photon_per_iter: 5_000,
        max_depth: 4,
        ..Default::default()
    });
    integrator.render(&mut scene, &camera, &shutter::instantaneous(2))?;
    let history = integrator.radius_history();
    assert!(history[0] <= 0.05 + 1e-6);
    Ok(())
}
