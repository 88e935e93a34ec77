//! The path-state store: every field of an in-flight path lives in a
//! flat column indexed by path id, so stage kernels touch exactly the
//! fields they use and nothing crosses a kernel boundary in registers.

use glam::{Vec3, Vec4};

use lumen_core::ray::{Hit, Ray};
use lumen_core::spectrum::{
    SampledSpectrum, SampledWavelengths, Spectrum, SPECTRUM_LANES,
};

use crate::cell::Column;

/// Stage a path is parked in. `Invalid` slots are free for regeneration.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KernelState {
    Invalid = 0,
    Intersect = 1,
    Miss = 2,
    Light = 3,
    Sample = 4,
    Surface = 5,
}

pub const KERNEL_COUNT: usize = 6;

impl KernelState {
    pub const ALL: [KernelState; KERNEL_COUNT] = [
        KernelState::Invalid,
        KernelState::Intersect,
        KernelState::Miss,
        KernelState::Light,
        KernelState::Sample,
        KernelState::Surface,
    ];

    #[inline]
    pub fn from_u32(value: u32) -> KernelState {
        Self::ALL[value as usize]
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// SoA store for `state_count` in-flight paths.
pub struct PathStateSoa {
    wl_sample: Option<Column<f32>>,
    beta: Column<[f32; SPECTRUM_LANES]>,
    pdf_bsdf: Column<f32>,
    eta_scale: Column<f32>,
    kernel_index: Column<u32>,
    depth: Column<u32>,
    pixel_index: Column<u32>,
    ray: Column<Ray>,
    hit: Column<Hit>,
    dim: u32,
    gathering: bool,
}

impl PathStateSoa {
    pub fn new(spectrum: &dyn Spectrum, state_count: usize, gathering: bool) -> Self {
        Self {
            wl_sample: (!spectrum.is_fixed()).then(|| Column::new(state_count)),
            beta: Column::new(state_count),
            pdf_bsdf: Column::new(state_count),
            eta_scale: Column::new(state_count),
            kernel_index: Column::new(state_count),
            depth: Column::new(state_count),
            pixel_index: Column::new(state_count),
            ray: Column::new(state_count),
            hit: Column::new(state_count),
            dim: spectrum.dimension(),
            gathering,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.beta.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.beta.is_empty()
    }

    #[inline]
    pub fn dimension(&self) -> u32 {
        self.dim
    }

    pub fn read_beta(&self, id: u32) -> SampledSpectrum {
        SampledSpectrum::from_lanes(self.dim, self.beta.get(id))
    }

    pub fn write_beta(&self, id: u32, beta: &SampledSpectrum) {
        self.beta.set(id, *beta.lanes());
    }

    pub fn read_ray(&self, id: u32) -> Ray {
        self.ray.get(id)
    }

    pub fn write_ray(&self, id: u32, ray: &Ray) {
        self.ray.set(id, *ray);
    }

    pub fn read_hit(&self, id: u32) -> Hit {
        self.hit.get(id)
    }

    pub fn write_hit(&self, id: u32, hit: &Hit) {
        self.hit.set(id, *hit);
    }

    pub fn read_depth(&self, id: u32) -> u32 {
        self.depth.get(id)
    }

    pub fn write_depth(&self, id: u32, depth: u32) {
        self.depth.set(id, depth);
    }

    pub fn read_pixel_index(&self, id: u32) -> u32 {
        self.pixel_index.get(id)
    }

    pub fn write_pixel_index(&self, id: u32, pixel: u32) {
        self.pixel_index.set(id, pixel);
    }

    pub fn read_pdf_bsdf(&self, id: u32) -> f32 {
        self.pdf_bsdf.get(id)
    }

    pub fn write_pdf_bsdf(&self, id: u32, pdf: f32) {
        self.pdf_bsdf.set(id, pdf);
    }

    pub fn read_eta_scale(&self, id: u32) -> f32 {
        self.eta_scale.get(id)
    }

    pub fn write_eta_scale(&self, id: u32, scale: f32) {
        self.eta_scale.set(id, scale);
    }

    /// Only meaningful in the gathered queue layout.
    pub fn read_kernel_index(&self, id: u32) -> KernelState {
        KernelState::from_u32(self.kernel_index.get(id))
    }

    pub fn write_kernel_index(&self, id: u32, state: KernelState) {
        self.kernel_index.set(id, state as u32);
    }

    /// Marks every slot invalid; the host-side start of a shutter pass.
    /// Runs between dispatches, when no kernel owns any slot.
    pub fn mark_all_invalid(&self) {
        for id in 0..self.kernel_index.len() as u32 {
            self.kernel_index.set(id, KernelState::Invalid as u32);
        }
    }

    pub fn write_wavelength_sample(&self, id: u32, u_wl: f32) {
        if let Some(column) = &self.wl_sample {
            column.set(id, u_wl);
        }
    }

    pub fn read_wavelength_sample(&self, id: u32) -> f32 {
        self.wl_sample.as_ref().map_or(0.0, |column| column.get(id))
    }

    /// Flips the sign of the stored wavelength sample; subsequent reads
    /// see the secondary lanes as terminated.
    pub fn terminate_secondary_wavelengths(&self, id: u32, u_wl: f32) {
        if let Some(column) = &self.wl_sample {
            column.set(id, -u_wl);
        }
    }

    /// Rebuilds the wavelength bundle of a path. Returns the unsigned
    /// wavelength sample alongside, for the termination re-encode.
    pub fn read_swl(&self, id: u32, spectrum: &dyn Spectrum) -> (f32, SampledWavelengths) {
        match &self.wl_sample {
            None => (0.0, spectrum.sample(0.0)),
            Some(column) => {
                let u_wl = column.get(id);
                let mut swl = spectrum.sample(u_wl.abs());
                if u_wl < 0.0 {
                    swl.terminate_secondary();
                }
                (u_wl.abs(), swl)
            }
        }
    }

    /// Relocates the full field set of a path to a new slot.
    pub fn move_state(&self, from: u32, to: u32) {
        self.beta.set(to, self.beta.get(from));
        self.pdf_bsdf.set(to, self.pdf_bsdf.get(from));
        self.eta_scale.set(to, self.eta_scale.get(from));
        self.ray.set(to, self.ray.get(from));
        self.hit.set(to, self.hit.get(from));
        self.depth.set(to, self.depth.get(from));
        self.pixel_index.set(to, self.pixel_index.get(from));
        if self.gathering {
            self.kernel_index.set(to, self.kernel_index.get(from));
        }
        if let Some(column) = &self.wl_sample {
            column.set(to, column.get(from));
        }
    }
}

/// Light-sample records parked between the Sample and Surface stages,
/// plus the per-material counters backing the tag sort.
pub struct LightSampleSoa {
    emission: Column<[f32; SPECTRUM_LANES]>,
    wi_and_pdf: Column<[f32; 4]>,
    surface_tag: Column<u32>,
    tag_counter: Vec<std::sync::atomic::AtomicU32>,
    dim: u32,
}

impl LightSampleSoa {
    /// `tag_count == 0` disables the tag sort machinery.
    pub fn new(dim: u32, state_count: usize, tag_count: usize) -> Self {
        Self {
            emission: Column::new(state_count),
            wi_and_pdf: Column::new(state_count),
            surface_tag: Column::new(if tag_count > 0 { state_count } else { 1 }),
            tag_counter: (0..tag_count.max(1))
                .map(|_| std::sync::atomic::AtomicU32::new(0))
                .collect(),
            dim,
        }
    }

    pub fn use_tag_sort(&self) -> bool {
        self.tag_counter.len() > 1 || self.surface_tag.len() > 1
    }

    pub fn read_emission(&self, id: u32) -> SampledSpectrum {
        SampledSpectrum::from_lanes(self.dim, self.emission.get(id))
    }

    pub fn write_emission(&self, id: u32, emission: &SampledSpectrum) {
        self.emission.set(id, *emission.lanes());
    }

    pub fn read_wi_and_pdf(&self, id: u32) -> (Vec3, f32) {
        let v = Vec4::from_array(self.wi_and_pdf.get(id));
        (v.truncate(), v.w)
    }

    pub fn write_wi_and_pdf(&self, id: u32, wi: Vec3, pdf: f32) {
        self.wi_and_pdf.set(id, [wi.x, wi.y, wi.z, pdf]);
    }

    pub fn read_surface_tag(&self, id: u32) -> u32 {
        self.surface_tag.get(id)
    }

    pub fn write_surface_tag(&self, id: u32, tag: u32) {
        self.surface_tag.set(id, tag);
    }

    pub fn increase_tag(&self, tag: u32) {
        self.tag_counter[tag as usize].fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn tag_count(&self) -> usize {
        self.tag_counter.len()
    }

    /// Exclusive-prefix-sums the tag counters into bucket offsets and
    /// returns them; the counters themselves become write cursors.
    pub fn tag_offsets(&self) -> Vec<u32> {
        let mut prev = 0;
        self.tag_counter
            .iter()
            .map(|counter| {
                let now = counter.swap(prev, std::sync::atomic::Ordering::Relaxed);
                let offset = prev;
                prev += now;
                offset
            })
            .collect()
    }

    pub fn bump_tag_cursor(&self, tag: u32) -> u32 {
        self.tag_counter[tag as usize].fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn reset_tags(&self) {
        for counter in &self.tag_counter {
            counter.store(0, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Moves the parked record during compaction; only meaningful for
    /// paths between Sample and Surface.
    pub fn move_state(&self, from: u32, to: u32, tag_sort: bool) {
        self.emission.set(to, self.emission.get(from));
        self.wi_and_pdf.set(to, self.wi_and_pdf.get(from));
        if tag_sort {
            self.surface_tag.set(to, self.surface_tag.get(from));
        }
    }
}
