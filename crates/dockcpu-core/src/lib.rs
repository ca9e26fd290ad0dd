//! dockcpu-core — average CPU usage of a running container.
//!
//! Provides:
//! - `sample` — stats record schema and the CPU percentage formula
//! - `source` — stats source abstraction (Docker Engine API, mock)
//! - `sampler` — the sampling loop and its result types
//! - `cancel` — cancellation token shared with the signal handler
//! - `report` — presentation of a finished measurement (text, JSON)

pub mod cancel;
pub mod report;
pub mod sample;
pub mod sampler;
pub mod source;

pub use cancel::CancelToken;
pub use sampler::{
    CpuSummary, MeasureError, Measurement, Outcome, SamplerConfig, StopReason, measure,
};
