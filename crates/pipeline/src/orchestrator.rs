//! The `process-images` pipeline.
//!
//! For every selected image, in a bounded number of blocking workers: read
//! the mapped bands, compute each selected index and aggregate it over all
//! plots. The resulting candidates are then resolved and published with a
//! bounded number of requests in flight. Failures are recorded against the
//! smallest affected unit and never stop unrelated work, except an
//! observation the registry rejects as malformed, which stops the run.

use crate::config::{PlannedImage, PlannedIndex, RunPlan};
use crate::context::RunContext;
use crate::error::{PipelineError, Result};
use crate::plots::plot_sites;
use crate::summary::{FailureScope, ObservationRecord, ObservationStatus, RunSummary};
use futures::stream::{self, StreamExt};
use raster2sensor_algorithms::imagery::compute;
use raster2sensor_algorithms::statistics::{aggregate, ZonalStatisticResult};
use raster2sensor_core::io::write_geotiff;
use raster2sensor_core::{PlotCollection, RasterImage};
use raster2sensor_parallel::ProcessingMode;
use raster2sensor_sensorthings::{
    ObservationPublisher, ObservationValues, PlotSite, PublishOutcome, RegistryResolver,
    SensorThingsApi, StaError,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Statistics of one index over all plots of one image
struct IndexAnalysis {
    position: usize,
    plots: std::result::Result<Vec<raster2sensor_core::Result<ZonalStatisticResult>>, PipelineError>,
    export: Option<PipelineError>,
}

/// A plot with valid pixels, waiting to be published
struct Candidate {
    position: usize,
    plot_id: String,
    values: ObservationValues,
}

struct Attempt {
    status: ObservationStatus,
    error: Option<PipelineError>,
}

impl Attempt {
    fn done(status: ObservationStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    fn failed(error: PipelineError) -> Self {
        Self {
            status: ObservationStatus::Failed,
            error: Some(error),
        }
    }
}

/// Shared, run-scoped publishing state
struct Publishing {
    sites: HashMap<String, PlotSite>,
    resolver: RegistryResolver,
    publisher: ObservationPublisher,
    permits: Semaphore,
}

pub struct Pipeline {
    plan: Arc<RunPlan>,
    ctx: RunContext,
    api: Arc<dyn SensorThingsApi>,
    output_dir: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(plan: RunPlan, ctx: RunContext, api: Arc<dyn SensorThingsApi>) -> Self {
        Self {
            plan: Arc::new(plan),
            ctx,
            api,
            output_dir: None,
        }
    }

    /// Also write every derived raster as `{image_stem}_{index}.tif` into `dir`
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Run the pipeline.
    ///
    /// An unusable plots file or a rejected observation payload is a
    /// [`PipelineError::Config`]; everything else is reported in the summary.
    pub async fn run(&self) -> Result<RunSummary> {
        let plan = &self.plan;
        let plots = PlotCollection::load(
            &plan.plots_file,
            &plan.plot_id_field,
            plan.treatment_id_field.as_deref(),
        )
        .map_err(|e| {
            PipelineError::Config(format!("plots file {}: {}", plan.plots_file.display(), e))
        })?;
        let plots = Arc::new(plots);

        tracing::info!(
            trial = %plan.trial_id,
            images = plan.images.len(),
            indices = plan.indices.len(),
            plots = plots.len(),
            dry_run = self.ctx.dry_run,
            "starting run"
        );

        let policy = plan.http.retry_policy();
        let publishing = Publishing {
            sites: plot_sites(&plots, &plan.trial_id, plan.year)
                .into_iter()
                .map(|site| (site.plot_id.clone(), site))
                .collect(),
            resolver: RegistryResolver::new(
                self.api.clone(),
                policy,
                self.ctx.cancel.clone(),
                self.ctx.dry_run,
            ),
            publisher: ObservationPublisher::new(
                self.api.clone(),
                policy,
                self.ctx.cancel.clone(),
                self.ctx.dry_run,
            ),
            permits: Semaphore::new(plan.concurrency.requests),
        };

        let parts: Vec<Result<RunSummary>> = stream::iter(plan.images.iter().cloned())
            .map(|image| self.process_image(image, plots.clone(), &publishing))
            .buffer_unordered(plan.concurrency.images)
            .collect()
            .await;

        let mut summary = RunSummary::new(self.ctx.dry_run);
        summary.images = plan.images.len();
        summary.indices = plan.indices.len();
        summary.plots = plots.len();
        for part in parts {
            summary.merge(part?);
        }
        let (things, datastreams) = publishing.resolver.created();
        summary.things_created = things;
        summary.datastreams_created = datastreams;
        summary.cancelled |= self.ctx.is_cancelled();
        summary.sort();

        tracing::info!(
            attempted = summary.attempted,
            published = summary.published,
            would_publish = summary.would_publish,
            skipped = summary.skipped,
            failed = summary.failed,
            failures = summary.failures.len(),
            "run finished"
        );
        Ok(summary)
    }

    async fn process_image(
        &self,
        image: PlannedImage,
        plots: Arc<PlotCollection>,
        publishing: &Publishing,
    ) -> Result<RunSummary> {
        let mut part = RunSummary::new(self.ctx.dry_run);
        let image_key = image_label(&image.path);
        if self.ctx.is_cancelled() {
            part.cancelled = true;
            return Ok(part);
        }

        let analyses = {
            let plan = self.plan.clone();
            let image = image.clone();
            let plots = plots.clone();
            let mode = self.ctx.mode;
            let output_dir = self.output_dir.clone();
            tokio::task::spawn_blocking(move || {
                analyse_image(&plan, &image, &plots, mode, output_dir.as_deref())
            })
            .await
        };
        let analyses = match analyses {
            Ok(Ok(analyses)) => analyses,
            Ok(Err(e)) => {
                part.fail(FailureScope::Image, &image_key, &e);
                return Ok(part);
            }
            Err(join) => {
                let e = PipelineError::RasterIo(format!("image worker failed: {}", join));
                part.fail(FailureScope::Image, &image_key, &e);
                return Ok(part);
            }
        };

        let mut candidates = Vec::new();
        for analysis in analyses {
            let planned = &self.plan.indices[analysis.position];
            let index_key = format!("{}/{}", image_key, planned.index);
            if let Some(e) = &analysis.export {
                part.fail(FailureScope::Index, &index_key, e);
            }
            let results = match analysis.plots {
                Ok(results) => results,
                Err(e) => {
                    part.fail(FailureScope::Index, &index_key, &e);
                    continue;
                }
            };

            for (plot, result) in plots.iter().zip(results) {
                let zonal = match result {
                    Ok(zonal) => zonal,
                    Err(e) => {
                        let key = format!("{}/{}-{}", index_key, self.plan.trial_id, plot.plot_id);
                        part.fail(FailureScope::Plot, key, &PipelineError::from(e));
                        continue;
                    }
                };
                if !zonal.stats.has_data() {
                    tracing::warn!(
                        image = %image_key,
                        index = %planned.index,
                        plot = %plot.plot_id,
                        "plot has no valid pixels, skipping"
                    );
                    part.record(ObservationRecord {
                        image: image_key.clone(),
                        index: planned.index.to_string(),
                        plot_id: plot.plot_id.clone(),
                        phenomenon_time: image.timestamp.to_rfc3339(),
                        mean: f64::NAN,
                        count: 0,
                        status: ObservationStatus::Skipped,
                    });
                    continue;
                }
                let s = &zonal.stats;
                candidates.push(Candidate {
                    position: analysis.position,
                    plot_id: plot.plot_id.clone(),
                    values: ObservationValues {
                        mean: s.mean,
                        min: s.min,
                        max: s.max,
                        std_dev: s.std_dev,
                        median: s.median,
                        count: s.count,
                    },
                });
            }
        }

        let image_ref = &image;
        let attempts: Vec<(Candidate, Result<Attempt>)> = stream::iter(candidates)
            .map(|candidate| async move {
                let planned = &self.plan.indices[candidate.position];
                let attempt = self.publish_one(&candidate, planned, image_ref, publishing).await;
                if attempt.is_err() {
                    // No further requests once the registry refuses the payload
                    self.ctx.cancel.cancel();
                }
                (candidate, attempt)
            })
            .buffer_unordered(self.plan.concurrency.requests)
            .collect()
            .await;

        for (candidate, attempt) in attempts {
            let attempt = attempt?;
            let planned = &self.plan.indices[candidate.position];
            if let Some(e) = &attempt.error {
                let key = format!(
                    "{}/{}/{}-{}",
                    image_key, planned.index, self.plan.trial_id, candidate.plot_id
                );
                part.fail(FailureScope::Plot, key, e);
            }
            if attempt.status == ObservationStatus::NotAttempted {
                part.cancelled = true;
            }
            part.record(ObservationRecord {
                image: image_key.clone(),
                index: planned.index.to_string(),
                plot_id: candidate.plot_id,
                phenomenon_time: image.timestamp.to_rfc3339(),
                mean: candidate.values.mean,
                count: candidate.values.count,
                status: attempt.status,
            });
        }

        tracing::info!(
            image = %image_key,
            published = part.published,
            would_publish = part.would_publish,
            skipped = part.skipped,
            failures = part.failures.len(),
            "image processed"
        );
        Ok(part)
    }

    /// Resolve Thing and Datastream, then publish. The resolver is always
    /// consulted before the publisher. Only a rejected observation payload
    /// is returned as an error.
    async fn publish_one(
        &self,
        candidate: &Candidate,
        planned: &PlannedIndex,
        image: &PlannedImage,
        publishing: &Publishing,
    ) -> Result<Attempt> {
        if self.ctx.is_cancelled() {
            return Ok(Attempt::done(ObservationStatus::NotAttempted));
        }
        let Ok(_permit) = publishing.permits.acquire().await else {
            return Ok(Attempt::done(ObservationStatus::NotAttempted));
        };
        let Some(site) = publishing.sites.get(&candidate.plot_id) else {
            return Ok(Attempt::failed(PipelineError::Registry(format!(
                "plot {} has no registry description",
                candidate.plot_id
            ))));
        };

        let thing = match publishing.resolver.resolve_thing(site).await {
            Ok(thing) => thing,
            Err(StaError::Cancelled) => return Ok(Attempt::done(ObservationStatus::NotAttempted)),
            Err(e) => {
                return Ok(Attempt::failed(PipelineError::Registry(format!(
                    "Thing {}: {}",
                    site.key(),
                    e
                ))))
            }
        };
        let datastream = match publishing
            .resolver
            .resolve_datastream(site, &thing, &planned.datastream)
            .await
        {
            Ok(ds) => ds,
            Err(StaError::Cancelled) => return Ok(Attempt::done(ObservationStatus::NotAttempted)),
            Err(e) => {
                return Ok(Attempt::failed(PipelineError::Registry(format!(
                    "Datastream {}/{}: {}",
                    site.key(),
                    planned.index,
                    e
                ))))
            }
        };

        let outcome = publishing
            .publisher
            .publish(&datastream, &candidate.values, image.timestamp)
            .await
            .map_err(|e| {
                PipelineError::Config(format!(
                    "observation for {}/{} rejected: {}",
                    site.key(),
                    planned.index,
                    e
                ))
            })?;
        Ok(match outcome {
            PublishOutcome::Published(_) => Attempt::done(ObservationStatus::Published),
            PublishOutcome::WouldPublish(observation) => {
                tracing::debug!(
                    plot = %site.label(),
                    index = %planned.index,
                    result = observation.result,
                    "would publish"
                );
                Attempt::done(ObservationStatus::WouldPublish)
            }
            PublishOutcome::Skipped(_) => Attempt::done(ObservationStatus::Skipped),
            PublishOutcome::Cancelled => Attempt::done(ObservationStatus::NotAttempted),
            PublishOutcome::Failed(reason) => Attempt::failed(PipelineError::Publish(reason)),
        })
    }
}

/// Read, compute, optionally export and aggregate every selected index of
/// one image. Runs on a blocking worker.
fn analyse_image(
    plan: &RunPlan,
    image: &PlannedImage,
    plots: &PlotCollection,
    mode: ProcessingMode,
    output_dir: Option<&Path>,
) -> Result<Vec<IndexAnalysis>> {
    let span = tracing::info_span!("image", path = %image.path.display());
    let _guard = span.enter();

    let raster = RasterImage::load(&image.path, image.timestamp, plan.band_map.clone())
        .map_err(|e| PipelineError::RasterIo(e.to_string()))?;
    let stem = image
        .path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image")
        .to_string();

    let mut analyses = Vec::with_capacity(plan.indices.len());
    for (position, planned) in plan.indices.iter().enumerate() {
        let unmapped = planned.unmapped_roles();
        if !unmapped.is_empty() {
            let roles: Vec<String> = unmapped.iter().map(ToString::to_string).collect();
            analyses.push(IndexAnalysis {
                position,
                plots: Err(PipelineError::IndexComputation(format!(
                    "{} needs band role(s) {} which its band mapping does not define",
                    planned.index,
                    roles.join(", ")
                ))),
                export: None,
            });
            continue;
        }

        let derived = match compute(planned.index, &raster) {
            Ok(derived) => derived,
            Err(e) => {
                analyses.push(IndexAnalysis {
                    position,
                    plots: Err(PipelineError::IndexComputation(e.to_string())),
                    export: None,
                });
                continue;
            }
        };

        let export = output_dir.and_then(|dir| {
            let out = dir.join(format!("{}_{}.tif", stem, planned.index.name()));
            match write_geotiff(&derived.raster, &out) {
                Ok(()) => {
                    tracing::debug!(path = %out.display(), "derived raster written");
                    None
                }
                Err(e) => Some(PipelineError::RasterIo(format!(
                    "cannot write {}: {}",
                    out.display(),
                    e
                ))),
            }
        });

        analyses.push(IndexAnalysis {
            position,
            plots: aggregate(&derived, plots, mode).map_err(PipelineError::from),
            export,
        });
    }
    Ok(analyses)
}

fn image_label(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}
