//! Error taxonomy of a pipeline run

use thiserror::Error;

/// Pipeline errors, one variant per failure class.
///
/// Only [`PipelineError::Config`] aborts a run; every other class is
/// recorded against the smallest affected unit and the run continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("raster I/O error: {0}")]
    RasterIo(String),

    #[error("index computation error: {0}")]
    IndexComputation(String),

    #[error("geometry error: {0}")]
    Geometry(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("publish error: {0}")]
    Publish(String),
}

impl PipelineError {
    /// Class name shown in run summaries
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "ConfigError",
            PipelineError::RasterIo(_) => "RasterIOError",
            PipelineError::IndexComputation(_) => "IndexComputationError",
            PipelineError::Geometry(_) => "GeometryError",
            PipelineError::Registry(_) => "RegistryError",
            PipelineError::Publish(_) => "PublishError",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PipelineError::Config(r)
            | PipelineError::RasterIo(r)
            | PipelineError::IndexComputation(r)
            | PipelineError::Geometry(r)
            | PipelineError::Registry(r)
            | PipelineError::Publish(r) => r,
        }
    }
}

impl From<raster2sensor_core::Error> for PipelineError {
    fn from(e: raster2sensor_core::Error) -> Self {
        use raster2sensor_core::Error as E;
        let reason = e.to_string();
        match e {
            E::MissingBand(_) | E::UnknownBandRole(_) => PipelineError::IndexComputation(reason),
            E::InvalidGeometry { .. } | E::CrsMismatch(..) => PipelineError::Geometry(reason),
            E::Vector { .. } | E::MissingPlotId { .. } => PipelineError::Config(reason),
            _ => PipelineError::RasterIo(reason),
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
