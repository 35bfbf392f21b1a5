//! The registry operations the resolver and publisher are written against.

use crate::error::Result;
use crate::models::{Datastream, IotId, Observation, Thing};
use async_trait::async_trait;
use std::fmt;

/// Local key of a plot Thing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThingKey {
    pub trial_id: String,
    pub plot_id: String,
}

impl ThingKey {
    pub fn new(trial_id: impl Into<String>, plot_id: impl Into<String>) -> Self {
        Self {
            trial_id: trial_id.into(),
            plot_id: plot_id.into(),
        }
    }
}

impl fmt::Display for ThingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.trial_id, self.plot_id)
    }
}

/// Local key of a plot Datastream: the plot plus the lower-cased index name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatastreamKey {
    pub thing: ThingKey,
    pub raster_data: String,
}

impl DatastreamKey {
    pub fn new(thing: ThingKey, raster_data: &str) -> Self {
        Self {
            thing,
            raster_data: raster_data.to_lowercase(),
        }
    }
}

impl fmt::Display for DatastreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.thing, self.raster_data)
    }
}

/// Lookup and create operations on a SensorThings registry.
///
/// Implementations perform exactly one remote interaction per call; retry
/// and caching are layered on top by the resolver and publisher.
#[async_trait]
pub trait SensorThingsApi: Send + Sync {
    /// The Thing whose properties carry this trial and plot id
    async fn find_thing(&self, key: &ThingKey) -> Result<Option<Thing>>;

    async fn create_thing(&self, thing: &Thing) -> Result<IotId>;

    /// The Datastream of a Thing whose `properties/raster_data` matches
    /// `raster_data` case-insensitively
    async fn find_datastream(&self, thing_id: &IotId, raster_data: &str)
        -> Result<Option<Datastream>>;

    async fn create_datastream(&self, datastream: &Datastream) -> Result<IotId>;

    async fn create_observation(&self, observation: &Observation) -> Result<IotId>;

    /// Every Thing of a trial, with its Locations expanded
    async fn list_things(&self, trial_id: &str) -> Result<Vec<Thing>>;
}
