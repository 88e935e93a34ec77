//! Render-core error types. Only conditions that must stop a render
//! before it produces output live here; transport-level anomalies
//! (degenerate pdfs, NaN throughput, missing lights) are absorbed
//! locally by the integrators.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid integrator configuration: {0}")]
    InvalidConfig(String),

    #[error("path-state allocation of {requested} slots failed")]
    StateAllocation { requested: usize },
}

pub type RenderResult<T> = Result<T, RenderError>;
