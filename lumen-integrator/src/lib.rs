//! Lumen's light-transport engines: the wavefront path tracer, the
//! megakernel variant, and stochastic progressive photon mapping, plus
//! the path-state/queue machinery they schedule work with.

pub mod cell;
pub mod megakernel;
pub mod path_state;
pub mod photon;
pub mod queue;
pub mod transport;
pub mod wavefront;

use lumen_core::camera::Camera;
use lumen_core::error::RenderResult;
use lumen_core::shutter::ShutterSample;
use lumen_scene::RenderScene;

pub use megakernel::{MegakernelConfig, MegakernelPathTracer};
pub use path_state::{KernelState, LightSampleSoa, PathStateSoa, KERNEL_COUNT};
pub use photon::{PhotonMapper, PhotonMapperConfig};
pub use queue::QueueSet;
pub use wavefront::{WavefrontConfig, WavefrontPathTracer};

/// Counters reported by a finished render.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Scheduler iterations (wavefront) or block iterations
    /// (megakernel) or progressive iterations (photon mapping).
    pub iterations: u64,
    /// How many of those were path-generation batches.
    pub generation_batches: u64,
    /// Total samples per pixel delivered.
    pub spp: u32,
}

/// A rendering algorithm driving one camera's film.
///
/// Degenerate conditions (no lights, zero pdfs, NaN throughput) are
/// absorbed during rendering; errors are reserved for configurations
/// that cannot start at all.
pub trait Integrator {
    fn render(
        &mut self,
        scene: &mut dyn RenderScene,
        camera: &dyn Camera,
        shutter: &[ShutterSample],
    ) -> RenderResult<RenderStats>;
}
