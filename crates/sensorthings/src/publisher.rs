//! Observation publishing

use crate::api::SensorThingsApi;
use crate::error::{Result, StaError};
use crate::models::{IotId, Observation, ObservationValues};
use crate::resolver::Resolved;
use crate::retry::{CancelFlag, RetryPolicy};
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;

/// What happened to one candidate observation
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published(IotId),
    /// Dry run: the observation that would have been posted
    WouldPublish(Observation),
    /// Nothing to publish (no valid pixels)
    Skipped(String),
    /// Not attempted because the run was cancelled
    Cancelled,
    Failed(String),
}

/// Posts one observation per (plot, index, image) to its Datastream.
pub struct ObservationPublisher {
    api: Arc<dyn SensorThingsApi>,
    policy: RetryPolicy,
    cancel: CancelFlag,
    dry_run: bool,
}

impl ObservationPublisher {
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
        }
    }

    /// Publish `values` as the observation at `phenomenon_time`.
    ///
    /// Network and server failures become [`PublishOutcome::Failed`] so one
    /// observation cannot abort the batch. Errors that would repeat for
    /// every observation (an unresolved Datastream, a 4xx rejection) are
    /// returned instead; see [`StaError::is_configuration`].
    pub async fn publish(
        &self,
        datastream: &Resolved,
        values: &ObservationValues,
        phenomenon_time: DateTime<FixedOffset>,
    ) -> Result<PublishOutcome> {
        if values.count == 0 {
            return Ok(PublishOutcome::Skipped("no valid pixels".into()));
        }

        let observation =
            Observation::from_values(values, phenomenon_time, Utc::now(), datastream.id().cloned());

        if self.dry_run {
            return Ok(PublishOutcome::WouldPublish(observation));
        }
        if observation.datastream.is_none() {
            return Err(StaError::Rejected("observation has no Datastream id".into()));
        }
        if self.cancel.is_cancelled() {
            return Ok(PublishOutcome::Cancelled);
        }

        match self
            .policy
            .run(&self.cancel, "create observation", || {
                self.api.create_observation(&observation)
            })
            .await
        {
            Ok(id) => {
                tracing::debug!(id = %id, phenomenon_time = %observation.phenomenon_time, "observation created");
                Ok(PublishOutcome::Published(id))
            }
            Err(StaError::Cancelled) => Ok(PublishOutcome::Cancelled),
            Err(e) if e.is_configuration() => Err(e),
            Err(e) => Ok(PublishOutcome::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;

    fn values(count: usize) -> ObservationValues {
        ObservationValues {
            mean: 0.42,
            min: 0.1,
            max: 0.8,
            std_dev: 0.05,
            median: 0.4,
            count,
        }
    }

    fn ts() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-04-05T09:00:00+01:00").unwrap()
    }

    fn publisher(registry: &Arc<MemoryRegistry>, dry_run: bool, cancel: CancelFlag) -> ObservationPublisher {
        ObservationPublisher::new(registry.clone(), RetryPolicy::none(), cancel, dry_run)
    }

    #[tokio::test]
    async fn publishes_to_resolved_datastream() {
        let registry = Arc::new(MemoryRegistry::new());
        let p = publisher(&registry, false, CancelFlag::new());

        let ds = Resolved::Existing(IotId::Number(5));
        let outcome = p.publish(&ds, &values(10), ts()).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published(_)));

        let posted = registry.observations();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].result, 0.42);
        assert_eq!(posted[0].datastream.as_ref().map(|d| &d.id), Some(&IotId::Number(5)));
    }

    #[tokio::test]
    async fn zero_count_is_skipped() {
        let registry = Arc::new(MemoryRegistry::new());
        let p = publisher(&registry, false, CancelFlag::new());
        let outcome = p
            .publish(&Resolved::Existing(IotId::Number(1)), &values(0), ts())
            .await
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::Skipped(_)));
        assert_eq!(registry.writes(), 0);
    }

    #[tokio::test]
    async fn dry_run_returns_payload_without_writing() {
        let registry = Arc::new(MemoryRegistry::new());
        let p = publisher(&registry, true, CancelFlag::new());
        match p.publish(&Resolved::Unresolved, &values(3), ts()).await.unwrap() {
            PublishOutcome::WouldPublish(obs) => {
                assert_eq!(obs.result, 0.42);
                assert!(obs.datastream.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(registry.writes(), 0);
    }

    #[tokio::test]
    async fn server_failures_and_cancellation_are_outcomes() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.fail_next_writes(1, 500);
        let cancel = CancelFlag::new();
        let p = publisher(&registry, false, cancel.clone());
        let ds = Resolved::Created(IotId::Number(2));

        assert!(matches!(
            p.publish(&ds, &values(4), ts()).await,
            Ok(PublishOutcome::Failed(_))
        ));

        cancel.cancel();
        assert_eq!(p.publish(&ds, &values(4), ts()).await.unwrap(), PublishOutcome::Cancelled);
        assert!(registry.observations().is_empty());
    }

    #[tokio::test]
    async fn rejected_observation_is_an_error() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.fail_next_writes(1, 400);
        let p = publisher(&registry, false, CancelFlag::new());

        let ds = Resolved::Existing(IotId::Text("not-a-datastream".into()));
        match p.publish(&ds, &values(4), ts()).await {
            Err(e @ StaError::Status { status: 400, .. }) => assert!(e.is_configuration()),
            other => panic!("expected a 400 rejection, got {:?}", other),
        }
        assert!(registry.observations().is_empty());
    }

    #[tokio::test]
    async fn unresolved_datastream_is_an_error_when_live() {
        let registry = Arc::new(MemoryRegistry::new());
        let p = publisher(&registry, false, CancelFlag::new());
        let err = p.publish(&Resolved::Unresolved, &values(4), ts()).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(registry.writes(), 0);
    }
}
