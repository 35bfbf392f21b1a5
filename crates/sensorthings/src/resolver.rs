//! Idempotent resolution of plot Things and Datastreams.
//!
//! Every resolution looks the entity up by its local key before creating
//! it, so repeated runs against the same trial never create duplicates.
//! Results are cached for the run; concurrent resolutions of one key share
//! a single in-flight lookup/create. A key whose resolution was rejected
//! outright stays failed for the rest of the run.

use crate::api::{DatastreamKey, SensorThingsApi, ThingKey};
use crate::error::{Result, StaError};
use crate::models::{DatastreamTemplate, IotId, PlotSite};
use crate::retry::{CancelFlag, RetryPolicy};
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Outcome of resolving one registry entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Found by lookup
    Existing(IotId),
    /// Created by this run
    Created(IotId),
    /// Not found and not created (dry run)
    Unresolved,
}

impl Resolved {
    pub fn id(&self) -> Option<&IotId> {
        match self {
            Resolved::Existing(id) | Resolved::Created(id) => Some(id),
            Resolved::Unresolved => None,
        }
    }
}

type Cache<K> = DashMap<K, Arc<OnceCell<std::result::Result<Resolved, Arc<StaError>>>>>;

/// Single-flight, run-scoped cache in front of a [`SensorThingsApi`].
pub struct RegistryResolver {
    api: Arc<dyn SensorThingsApi>,
    policy: RetryPolicy,
    cancel: CancelFlag,
    dry_run: bool,
    things: Cache<ThingKey>,
    datastreams: Cache<DatastreamKey>,
    things_created: AtomicUsize,
    datastreams_created: AtomicUsize,
}

impl RegistryResolver {
    pub fn new(
        api: Arc<dyn SensorThingsApi>,
        policy: RetryPolicy,
        cancel: CancelFlag,
        dry_run: bool,
    ) -> Self {
        Self {
            api,
            policy,
            cancel,
            dry_run,
            things: DashMap::new(),
            datastreams: DashMap::new(),
            things_created: AtomicUsize::new(0),
            datastreams_created: AtomicUsize::new(0),
        }
    }

    /// Number of (Things, Datastreams) created by this resolver
    pub fn created(&self) -> (usize, usize) {
        (
            self.things_created.load(Ordering::Relaxed),
            self.datastreams_created.load(Ordering::Relaxed),
        )
    }

    /// Resolve the Thing of a plot, creating it (with its Location) if the
    /// registry has none.
    pub async fn resolve_thing(&self, site: &PlotSite) -> Result<Resolved> {
        let key = site.key();
        single_flight(&self.things, key.clone(), || async {
            let resolved = self
                .policy
                .run(&self.cancel, "resolve thing", || async {
                    if let Some(thing) = self.api.find_thing(&key).await? {
                        let id = thing.id.ok_or_else(|| StaError::InvalidResponse {
                            url: format!("Things?$filter=... ({})", key),
                            reason: "Thing without @iot.id".into(),
                        })?;
                        return Ok(Resolved::Existing(id));
                    }
                    if self.dry_run {
                        return Ok(Resolved::Unresolved);
                    }
                    let id = self.api.create_thing(&site.thing()).await?;
                    Ok(Resolved::Created(id))
                })
                .await?;

            if let Resolved::Created(id) = &resolved {
                self.things_created.fetch_add(1, Ordering::Relaxed);
                tracing::info!(key = %key, id = %id, "created Thing");
            }
            Ok(resolved)
        })
        .await
    }

    /// Resolve the Datastream of `template` under an already resolved Thing.
    ///
    /// An unresolved Thing (dry run) yields an unresolved Datastream without
    /// any lookup.
    pub async fn resolve_datastream(
        &self,
        site: &PlotSite,
        thing: &Resolved,
        template: &DatastreamTemplate,
    ) -> Result<Resolved> {
        let raster_data = template
            .raster_data()
            .ok_or_else(|| StaError::Rejected(format!("datastream '{}' names no index", template.name)))?;
        let Some(thing_id) = thing.id() else {
            return Ok(Resolved::Unresolved);
        };

        let key = DatastreamKey::new(site.key(), raster_data);
        single_flight(&self.datastreams, key.clone(), || async {
            let resolved = self
                .policy
                .run(&self.cancel, "resolve datastream", || async {
                    if let Some(ds) = self.api.find_datastream(thing_id, raster_data).await? {
                        let id = ds.id.ok_or_else(|| StaError::InvalidResponse {
                            url: format!("Things({})/Datastreams", thing_id.path_segment()),
                            reason: "Datastream without @iot.id".into(),
                        })?;
                        return Ok(Resolved::Existing(id));
                    }
                    if self.dry_run {
                        return Ok(Resolved::Unresolved);
                    }
                    let payload = template.datastream_for(site, thing_id.clone());
                    let id = self.api.create_datastream(&payload).await?;
                    Ok(Resolved::Created(id))
                })
                .await?;

            if let Resolved::Created(id) = &resolved {
                self.datastreams_created.fetch_add(1, Ordering::Relaxed);
                tracing::info!(key = %key, id = %id, "created Datastream");
            }
            Ok(resolved)
        })
        .await
    }
}

/// Run `init` at most once per key at a time.
///
/// Transient failures (and cancellation) leave the key empty so a later
/// call can try again; any other failure is stored and returned to every
/// later caller as [`StaError::Permanent`].
async fn single_flight<K, F, Fut>(cache: &Cache<K>, key: K, init: F) -> Result<Resolved>
where
    K: Eq + Hash,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Resolved>>,
{
    // Clone the cell out so no map guard is held across the await.
    let cell = cache.entry(key).or_default().clone();
    let entry = cell
        .get_or_try_init(|| async {
            match init().await {
                Ok(resolved) => Ok(Ok(resolved)),
                Err(e) if e.is_retryable() || matches!(e, StaError::Cancelled) => Err(e),
                Err(e) => Ok(Err(Arc::new(e))),
            }
        })
        .await?;
    match entry {
        Ok(resolved) => Ok(resolved.clone()),
        Err(e) => Err(StaError::Permanent(e.clone())),
    }
}
