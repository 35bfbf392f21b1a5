//! # raster2sensor SensorThings
//!
//! Client side of the SensorThings API registry and the OGC API Processes
//! catalog.
//!
//! - [`SensorThingsApi`]: lookup/create operations on Things, Datastreams
//!   and Observations, implemented over HTTP by [`HttpRegistry`]
//! - [`RegistryResolver`]: idempotent (trial, plot) and (trial, plot, index)
//!   resolution with a single-flight cache
//! - [`ObservationPublisher`]: builds and posts observations
//! - [`RetryPolicy`]: bounded exponential backoff for transient failures
//! - [`ProcessesClient`]: fetch / describe / execute OGC API processes

pub mod api;
pub mod error;
pub mod http;
pub mod models;
pub mod processes;
pub mod publisher;
pub mod resolver;
pub mod retry;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use api::{DatastreamKey, SensorThingsApi, ThingKey};
pub use error::{Result, StaError};
pub use http::{normalize_base_url, HttpRegistry};
pub use models::{
    Datastream, DatastreamTemplate, EntityRef, IotId, Location, Observation, ObservationValues,
    PlotSite, Thing, UnitOfMeasurement,
};
pub use processes::ProcessesClient;
pub use publisher::{ObservationPublisher, PublishOutcome};
pub use resolver::{RegistryResolver, Resolved};
pub use retry::{CancelFlag, RetryPolicy};
