//! Run summary: counts, failures and the process exit code

use crate::error::PipelineError;
use serde::Serialize;
use std::fmt;

/// Smallest unit a failure is recorded against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureScope {
    Image,
    Index,
    Plot,
}

impl fmt::Display for FailureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureScope::Image => "image",
            FailureScope::Index => "index",
            FailureScope::Plot => "plot",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub scope: FailureScope,
    /// `image`, `image/index` or `image/index/trial-plot`
    pub key: String,
    pub error: &'static str,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(scope: FailureScope, key: impl Into<String>, err: &PipelineError) -> Self {
        Self {
            scope,
            key: key.into(),
            error: err.kind(),
            reason: err.reason().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationStatus {
    Published,
    WouldPublish,
    Skipped,
    Failed,
    NotAttempted,
}

/// One candidate observation and what happened to it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationRecord {
    pub image: String,
    pub index: String,
    pub plot_id: String,
    pub phenomenon_time: String,
    pub mean: f64,
    pub count: usize,
    pub status: ObservationStatus,
}

/// Outcome of a `process-images` run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub images: usize,
    pub indices: usize,
    pub plots: usize,
    /// Observations handed to the publisher (including dry-run previews)
    pub attempted: usize,
    pub published: usize,
    pub would_publish: usize,
    /// Plots with no valid pixels
    pub skipped: usize,
    pub failed: usize,
    /// Candidates left untouched after cancellation
    pub not_attempted: usize,
    pub things_created: usize,
    pub datastreams_created: usize,
    pub cancelled: bool,
    pub failures: Vec<FailureRecord>,
    pub observations: Vec<ObservationRecord>,
}

impl RunSummary {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    pub fn fail(&mut self, scope: FailureScope, key: impl Into<String>, err: &PipelineError) {
        let record = FailureRecord::new(scope, key, err);
        tracing::warn!(scope = %record.scope, key = %record.key, error = record.error, "{}", record.reason);
        self.failures.push(record);
    }

    /// Account one candidate observation
    pub fn record(&mut self, record: ObservationRecord) {
        match record.status {
            ObservationStatus::Published => {
                self.attempted += 1;
                self.published += 1;
            }
            ObservationStatus::WouldPublish => {
                self.attempted += 1;
                self.would_publish += 1;
            }
            ObservationStatus::Failed => {
                self.attempted += 1;
                self.failed += 1;
            }
            ObservationStatus::Skipped => self.skipped += 1,
            ObservationStatus::NotAttempted => self.not_attempted += 1,
        }
        self.observations.push(record);
    }

    /// Fold a partial summary (one image) into this one
    pub fn merge(&mut self, other: RunSummary) {
        self.attempted += other.attempted;
        self.published += other.published;
        self.would_publish += other.would_publish;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.not_attempted += other.not_attempted;
        self.cancelled |= other.cancelled;
        self.failures.extend(other.failures);
        self.observations.extend(other.observations);
    }

    /// Sort records so that output does not depend on task scheduling
    pub fn sort(&mut self) {
        self.failures
            .sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.reason.cmp(&b.reason)));
        self.observations.sort_by(|a, b| {
            (&a.image, &a.index, &a.plot_id).cmp(&(&b.image, &b.index, &b.plot_id))
        });
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// 0 on success, 1 on any failure, 130 when interrupted without failures
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else if self.cancelled {
            130
        } else {
            0
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        writeln!(f, "Run summary{}", mode)?;
        writeln!(
            f,
            "  inputs:        {} image(s), {} index(es), {} plot(s)",
            self.images, self.indices, self.plots
        )?;
        writeln!(f, "  attempted:     {}", self.attempted)?;
        if self.dry_run {
            writeln!(f, "  would publish: {}", self.would_publish)?;
        } else {
            writeln!(f, "  published:     {}", self.published)?;
        }
        writeln!(f, "  skipped:       {}", self.skipped)?;
        writeln!(f, "  failed:        {}", self.failed)?;
        if self.not_attempted > 0 {
            writeln!(f, "  not attempted: {}", self.not_attempted)?;
        }
        if !self.dry_run {
            writeln!(
                f,
                "  created:       {} Thing(s), {} Datastream(s)",
                self.things_created, self.datastreams_created
            )?;
        }
        if self.cancelled {
            writeln!(f, "  interrupted by user")?;
        }
        if !self.failures.is_empty() {
            writeln!(f, "Failures:")?;
            for failure in &self.failures {
                writeln!(
                    f,
                    "  [{}] {} {}: {}",
                    failure.scope, failure.key, failure.error, failure.reason
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: ObservationStatus) -> ObservationRecord {
        ObservationRecord {
            image: "a.tif".into(),
            index: "NDVI".into(),
            plot_id: "1".into(),
            phenomenon_time: "2024-03-06T09:00:00+01:00".into(),
            mean: 0.5,
            count: 4,
            status,
        }
    }

    #[test]
    fn counts_by_status() {
        let mut s = RunSummary::new(false);
        s.record(record(ObservationStatus::Published));
        s.record(record(ObservationStatus::Failed));
        s.record(record(ObservationStatus::Skipped));
        s.record(record(ObservationStatus::NotAttempted));
        assert_eq!(s.attempted, 2);
        assert_eq!(s.published, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.not_attempted, 1);
    }

    #[test]
    fn exit_codes() {
        let mut s = RunSummary::new(false);
        assert_eq!(s.exit_code(), 0);
        s.cancelled = true;
        assert_eq!(s.exit_code(), 130);
        s.fail(
            FailureScope::Image,
            "a.tif",
            &PipelineError::RasterIo("truncated".into()),
        );
        assert_eq!(s.exit_code(), 1);
    }

    #[test]
    fn merge_and_render() {
        let mut total = RunSummary::new(true);
        let mut part = RunSummary::new(true);
        part.record(record(ObservationStatus::WouldPublish));
        part.fail(
            FailureScope::Index,
            "a.tif/NDRE",
            &PipelineError::IndexComputation("band role 'red_edge' is not mapped".into()),
        );
        total.merge(part);
        assert_eq!(total.would_publish, 1);
        assert_eq!(total.failures.len(), 1);

        let text = total.to_string();
        assert!(text.contains("would publish: 1"));
        assert!(text.contains("[index] a.tif/NDRE IndexComputationError"));

        let json: serde_json::Value = serde_json::from_str(&total.to_json().unwrap()).unwrap();
        assert_eq!(json["failures"][0]["scope"], "index");
        assert_eq!(json["observations"][0]["status"], "would_publish");
    }
}
