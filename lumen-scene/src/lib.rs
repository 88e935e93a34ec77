//! Scene interface consumed by the Lumen integrators: the geometry
//! oracle, surface closures, light sampling, and a linear-traversal
//! reference scene for tests and demos.

pub mod geometry;
pub mod light;
pub mod primitive;
pub mod surface;

pub use geometry::{Geometry, InstanceFlags, InstanceInfo, Interaction};
pub use light::{LightEval, LightLeSample, LightSample, LightSampler};
pub use primitive::{Primitive, PrimitiveScene, Shape};
pub use surface::{
    ClosureEval, ScatterEvent, SurfaceClosure, SurfaceDesc, SurfaceModel, SurfaceSample,
    TransportMode,
};

/// Everything an integrator needs from a scene.
pub trait RenderScene: Send + Sync {
    fn geometry(&self) -> &dyn Geometry;

    fn light_sampler(&self) -> &dyn LightSampler;

    /// Surface table indexed by surface tag; its length is the tag
    /// domain for the material sort.
    fn surfaces(&self) -> &[SurfaceDesc];

    fn surface(&self, tag: u32) -> Option<&SurfaceDesc> {
        self.surfaces().get(tag as usize)
    }

    fn has_environment(&self) -> bool;

    /// Number of area emitters (the environment is counted separately).
    fn light_count(&self) -> usize;

    fn has_lighting(&self) -> bool {
        self.light_count() > 0 || self.has_environment()
    }

    /// Advances dynamic scene state to a shutter time.
    fn update(&mut self, time: f32) {
        let _ = time;
    }
}
