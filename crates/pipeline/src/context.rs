//! Explicit per-run context handed to every stage

use raster2sensor_parallel::ProcessingMode;
use raster2sensor_sensorthings::CancelFlag;

/// Dry-run switch, cancellation flag and CPU processing mode of one run.
///
/// Stages receive this by reference instead of reading process-wide state.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub dry_run: bool,
    pub cancel: CancelFlag,
    pub mode: ProcessingMode,
}

impl RunContext {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
