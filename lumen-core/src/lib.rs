//! Shared primitives of the Lumen render core: sampled spectra, the
//! per-path sampler, rays and hits, film accumulation, cameras and the
//! shutter model.

pub mod camera;
pub mod error;
pub mod film;
pub mod math;
pub mod ray;
pub mod sampler;
pub mod shutter;
pub mod spectrum;

pub use camera::{Camera, CameraSample, PinholeCamera, ThinLensCamera};
pub use error::{RenderError, RenderResult};
pub use film::{AtomicF32, Film};
pub use math::{balance_heuristic, Aabb, Frame, DELTA_PDF};
pub use ray::{Hit, Ray, INVALID_INSTANCE};
pub use sampler::{IndependentSampler, Sampler, SamplerState};
pub use shutter::{total_spp, ShutterSample};
pub use spectrum::{
    HeroWavelengthSpectrum, RgbSpectrum, SampledSpectrum, SampledWavelengths, Spectrum,
    SPECTRUM_LANES,
};
