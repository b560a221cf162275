// ocr-autopilot: backend policy, local service lifecycle, submission
// pipeline, and failover/circuit-breaking for an OCR capture pipeline.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::too_many_arguments)]

pub mod alias;
pub mod batch;
pub mod circuit_breaker;
pub mod concurrency;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod failover;
pub mod hardware;
pub mod local_service;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod quota;
pub mod retry;

pub use config::OcrSettings;
pub use error::{AutopilotError, AutopilotResult};
pub use pipeline::{submit_tiles, PipelineState, SubmissionResult};
