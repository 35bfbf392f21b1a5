//! # raster2sensor pipeline
//!
//! Turns configured raster images into SensorThings observations:
//!
//! - [`config`]: the YAML/JSON run configuration, validated before any work
//! - [`orchestrator`]: `process-images`, images x indices x plots
//! - [`plots`]: plot registration and listing commands
//! - [`summary`]: counts, failures and exit code of a run

pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod plots;
pub mod summary;

pub use config::{
    sample_config, write_sample_config, ConfigFormat, ConfigOverrides, PipelineConfig, RunPlan,
    Selection,
};
pub use context::RunContext;
pub use error::{PipelineError, Result};
pub use orchestrator::Pipeline;
pub use plots::{add_datastreams, create_plots, fetch_plots, RegistrationSummary};
pub use summary::{FailureRecord, FailureScope, ObservationStatus, RunSummary};
