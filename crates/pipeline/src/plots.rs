//! Plot registration and listing: `plots create`, `plots add-datastreams`
//! and `plots fetch`.

use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::error::{PipelineError, Result};
use crate::summary::{FailureRecord, FailureScope};
use futures::stream::{self, StreamExt};
use raster2sensor_core::PlotCollection;
use raster2sensor_sensorthings::{
    PlotSite, RegistryResolver, Resolved, RetryPolicy, SensorThingsApi, StaError, Thing,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Registry description of every plot in `plots`
pub fn plot_sites(plots: &PlotCollection, trial_id: &str, year: i32) -> Vec<PlotSite> {
    plots
        .iter()
        .map(|plot| PlotSite {
            trial_id: trial_id.to_string(),
            plot_id: plot.plot_id.clone(),
            treatment_id: plot.treatment_id.clone(),
            year,
            location: plot.representative_point().map(|p| (p.x(), p.y())),
        })
        .collect()
}

/// Outcome of `plots create` and `plots add-datastreams`
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationSummary {
    pub dry_run: bool,
    pub plots: usize,
    pub things_created: usize,
    pub datastreams_created: usize,
    /// Datastreams found or created
    pub datastreams_resolved: usize,
    /// Datastreams that would be created (dry run)
    pub missing: usize,
    pub cancelled: bool,
    pub failures: Vec<FailureRecord>,
}

impl RegistrationSummary {
    pub fn exit_code(&self) -> i32 {
        if !self.failures.is_empty() {
            1
        } else if self.cancelled {
            130
        } else {
            0
        }
    }
}

impl fmt::Display for RegistrationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plots: {}", self.plots)?;
        writeln!(
            f,
            "  created: {} Thing(s), {} Datastream(s)",
            self.things_created, self.datastreams_created
        )?;
        writeln!(f, "  datastreams resolved: {}", self.datastreams_resolved)?;
        if self.dry_run {
            writeln!(f, "  missing (dry run): {}", self.missing)?;
        }
        if self.cancelled {
            writeln!(f, "  interrupted by user")?;
        }
        for failure in &self.failures {
            writeln!(f, "  [{}] {}: {}", failure.scope, failure.key, failure.reason)?;
        }
        Ok(())
    }
}

/// Tally shared by concurrent registration tasks
#[derive(Default)]
struct Tally {
    resolved: AtomicUsize,
    missing: AtomicUsize,
    cancelled: AtomicUsize,
    failures: Mutex<Vec<FailureRecord>>,
}

impl Tally {
    fn resolved(&self, r: &Resolved) {
        match r {
            Resolved::Unresolved => self.missing.fetch_add(1, Ordering::Relaxed),
            _ => self.resolved.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn error(&self, key: String, e: StaError) {
        if matches!(e, StaError::Cancelled) {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let err = PipelineError::Registry(e.to_string());
        tracing::warn!(key = %key, "{}", err);
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        failures.push(FailureRecord::new(FailureScope::Plot, key, &err));
    }

    fn finish(
        self,
        resolver: &RegistryResolver,
        ctx: &RunContext,
        plots: usize,
    ) -> RegistrationSummary {
        let (things_created, datastreams_created) = resolver.created();
        let mut failures = self.failures.into_inner().unwrap_or_else(|p| p.into_inner());
        failures.sort_by(|a, b| a.key.cmp(&b.key));
        RegistrationSummary {
            dry_run: ctx.dry_run,
            plots,
            things_created,
            datastreams_created,
            datastreams_resolved: self.resolved.into_inner(),
            missing: self.missing.into_inner(),
            cancelled: self.cancelled.into_inner() > 0 || ctx.is_cancelled(),
            failures,
        }
    }
}

/// Resolve (creating when missing) the Thing and every configured Datastream
/// of each plot in the configured plots file.
pub async fn create_plots(
    config: &PipelineConfig,
    ctx: &RunContext,
    api: Arc<dyn SensorThingsApi>,
) -> Result<RegistrationSummary> {
    let trial_id = config.trial_id()?;
    let templates = config.datastream_templates()?;
    let plots_file = config.plots_file()?;
    let plots = PlotCollection::load(
        plots_file,
        config.plot_id_field()?,
        config.treatment_id_field.as_deref(),
    )
    .map_err(|e| PipelineError::Config(format!("plots file {}: {}", plots_file.display(), e)))?;
    let sites = plot_sites(&plots, trial_id, config.year());

    let resolver = RegistryResolver::new(
        api,
        config.http.retry_policy(),
        ctx.cancel.clone(),
        ctx.dry_run,
    );
    let tally = Tally::default();

    stream::iter(&sites)
        .for_each_concurrent(config.concurrency.requests.max(1), |site| {
            let (resolver, tally) = (&resolver, &tally);
            async move {
                let thing = match resolver.resolve_thing(site).await {
                    Ok(thing) => thing,
                    Err(e) => return tally.error(site.label(), e),
                };
                for template in templates {
                    let key = format!("{}/{}", site.label(), template.raster_data().unwrap_or("?"));
                    match resolver.resolve_datastream(site, &thing, template).await {
                        Ok(ds) => tally.resolved(&ds),
                        Err(e) => tally.error(key, e),
                    }
                }
            }
        })
        .await;

    let summary = tally.finish(&resolver, ctx, sites.len());
    tracing::info!(
        trial = %trial_id,
        plots = summary.plots,
        things_created = summary.things_created,
        datastreams_created = summary.datastreams_created,
        "plots registered"
    );
    Ok(summary)
}

/// Resolve every configured Datastream for each Thing already registered
/// for the trial.
pub async fn add_datastreams(
    config: &PipelineConfig,
    ctx: &RunContext,
    api: Arc<dyn SensorThingsApi>,
) -> Result<RegistrationSummary> {
    let trial_id = config.trial_id()?;
    let templates = config.datastream_templates()?;
    let policy = config.http.retry_policy();

    let things = policy
        .run(&ctx.cancel, "list things", || api.list_things(trial_id))
        .await
        .map_err(|e| PipelineError::Registry(format!("listing Things of {}: {}", trial_id, e)))?;

    let mut registered = Vec::new();
    for thing in things {
        let (Some(id), Some(plot_id)) = (thing.id.clone(), thing.plot_id()) else {
            tracing::warn!(name = %thing.name, "Thing has no id or plot_id, skipping");
            continue;
        };
        let site = PlotSite {
            trial_id: trial_id.to_string(),
            plot_id,
            treatment_id: thing
                .properties
                .get("treatment_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            year: thing
                .properties
                .get("year")
                .and_then(Value::as_i64)
                .and_then(|y| i32::try_from(y).ok())
                .unwrap_or_else(|| config.year()),
            location: None,
        };
        registered.push((site, Resolved::Existing(id)));
    }

    let resolver = RegistryResolver::new(api, policy, ctx.cancel.clone(), ctx.dry_run);
    let tally = Tally::default();

    stream::iter(&registered)
        .for_each_concurrent(config.concurrency.requests.max(1), |(site, thing)| {
            let (resolver, tally) = (&resolver, &tally);
            async move {
                for template in templates {
                    let key = format!("{}/{}", site.label(), template.raster_data().unwrap_or("?"));
                    match resolver.resolve_datastream(site, thing, template).await {
                        Ok(ds) => tally.resolved(&ds),
                        Err(e) => tally.error(key, e),
                    }
                }
            }
        })
        .await;

    Ok(tally.finish(&resolver, ctx, registered.len()))
}

/// The trial's Things as a GeoJSON FeatureCollection, one feature per Thing
/// located at its first Location.
pub async fn fetch_plots(
    api: &dyn SensorThingsApi,
    trial_id: &str,
    policy: RetryPolicy,
    ctx: &RunContext,
) -> Result<Value> {
    let things = policy
        .run(&ctx.cancel, "list things", || api.list_things(trial_id))
        .await
        .map_err(|e| PipelineError::Registry(format!("listing Things of {}: {}", trial_id, e)))?;
    tracing::info!(trial = %trial_id, things = things.len(), "fetched plots");
    Ok(things_to_geojson(&things))
}

fn things_to_geojson(things: &[Thing]) -> Value {
    let features: Vec<Value> = things
        .iter()
        .map(|thing| {
            let geometry = thing
                .locations
                .first()
                .map(|loc| match loc.location.get("geometry") {
                    Some(geometry) => geometry.clone(),
                    None => loc.location.clone(),
                })
                .unwrap_or(Value::Null);

            let mut properties = Map::new();
            if let Some(id) = &thing.id {
                properties.insert("iot_id".into(), json!(id));
            }
            properties.insert("name".into(), json!(thing.name));
            for (k, v) in &thing.properties {
                properties.insert(k.clone(), v.clone());
            }
            json!({
                "type": "Feature",
                "geometry": geometry,
                "properties": properties,
            })
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "features": features,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use raster2sensor_sensorthings::memory::MemoryRegistry;
    use raster2sensor_sensorthings::{IotId, Location};

    #[test]
    fn geojson_uses_location_geometry() {
        let thing = Thing {
            id: Some(IotId::Number(7)),
            name: "Trial Plot - T-1".into(),
            description: String::new(),
            properties: json!({"trial_id": "T", "plot_id": "1"})
                .as_object()
                .cloned()
                .unwrap(),
            locations: vec![Location {
                id: None,
                name: "loc".into(),
                description: String::new(),
                encoding_type: "application/geo+json".into(),
                location: json!({
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [3.0, 4.0]},
                }),
            }],
        };
        let fc = things_to_geojson(&[thing]);
        assert_eq!(fc["features"][0]["geometry"]["coordinates"], json!([3.0, 4.0]));
        assert_eq!(fc["features"][0]["properties"]["iot_id"], json!(7));
        assert_eq!(fc["features"][0]["properties"]["plot_id"], json!("1"));
    }

    #[tokio::test]
    async fn fetch_lists_only_the_trial() {
        let registry = Arc::new(MemoryRegistry::new());
        let resolver = RegistryResolver::new(
            registry.clone(),
            RetryPolicy::none(),
            Default::default(),
            false,
        );
        for (trial, plot) in [("A", "1"), ("A", "2"), ("B", "1")] {
            let site = PlotSite {
                trial_id: trial.into(),
                plot_id: plot.into(),
                treatment_id: None,
                year: 2024,
                location: Some((1.0, 2.0)),
            };
            resolver.resolve_thing(&site).await.unwrap();
        }

        let fc = fetch_plots(registry.as_ref(), "A", RetryPolicy::none(), &RunContext::default())
            .await
            .unwrap();
        assert_eq!(fc["features"].as_array().unwrap().len(), 2);
    }
}
