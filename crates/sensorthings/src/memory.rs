//! In-memory registry for tests.
//!
//! Implements [`SensorThingsApi`] over plain vectors, counts reads and
//! writes, and can inject write failures and latency.

use crate::api::{SensorThingsApi, ThingKey};
use crate::error::{Result, StaError};
use crate::models::{Datastream, IotId, Observation, Thing};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    things: Vec<Thing>,
    datastreams: Vec<Datastream>,
    observations: Vec<Observation>,
    failing_writes: Option<InjectedFailure>,
}

/// Remaining injected write failures, optionally limited to one collection
#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    collection: Option<&'static str>,
    remaining: usize,
    status: u16,
}

impl State {
    fn allocate_id(&mut self) -> IotId {
        self.next_id += 1;
        IotId::Number(self.next_id)
    }
}

/// Registry backed by in-process vectors.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `n` write calls fail with HTTP `status`
    pub fn fail_next_writes(&self, n: usize, status: u16) {
        self.inject(None, n, status);
    }

    /// Make the next `n` writes to `collection` (e.g. `"Observations"`)
    /// fail with HTTP `status`
    pub fn fail_next_writes_to(&self, collection: &'static str, n: usize, status: u16) {
        self.inject(Some(collection), n, status);
    }

    fn inject(&self, collection: Option<&'static str>, n: usize, status: u16) {
        self.lock().failing_writes = (n > 0).then_some(InjectedFailure {
            collection,
            remaining: n,
            status,
        });
    }

    /// Lookup calls made so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Successful create calls made so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn thing_count(&self) -> usize {
        self.lock().things.len()
    }

    pub fn datastream_count(&self) -> usize {
        self.lock().datastreams.len()
    }

    pub fn things(&self) -> Vec<Thing> {
        self.lock().things.clone()
    }

    pub fn datastreams(&self) -> Vec<Datastream> {
        self.lock().datastreams.clone()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.lock().observations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        self.pause().await;
        self.reads.fetch_add(1, Ordering::SeqCst);
        f(&self.lock())
    }

    async fn write(&self, collection: &str, f: impl FnOnce(&mut State, IotId)) -> Result<IotId> {
        self.pause().await;
        let mut state = self.lock();
        if let Some(failure) = state.failing_writes {
            if failure.collection.map_or(true, |c| c == collection) {
                state.failing_writes = (failure.remaining > 1).then_some(InjectedFailure {
                    remaining: failure.remaining - 1,
                    ..failure
                });
                return Err(StaError::Status {
                    method: "POST",
                    url: format!("memory://{}", collection),
                    status: failure.status,
                    body: "injected failure".into(),
                });
            }
        }
        let id = state.allocate_id();
        f(&mut state, id.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }
}

#[async_trait]
impl SensorThingsApi for MemoryRegistry {
    async fn find_thing(&self, key: &ThingKey) -> Result<Option<Thing>> {
        Ok(self
            .read(|s| {
                s.things
                    .iter()
                    .find(|t| {
                        t.trial_id() == Some(key.trial_id.as_str())
                            && t.plot_id().as_deref() == Some(key.plot_id.as_str())
                    })
                    .cloned()
            })
            .await)
    }

    async fn create_thing(&self, thing: &Thing) -> Result<IotId> {
        self.write("Things", |s, id| {
            let mut thing = thing.clone();
            thing.id = Some(id);
            s.things.push(thing);
        })
        .await
    }

    async fn find_datastream(
        &self,
        thing_id: &IotId,
        raster_data: &str,
    ) -> Result<Option<Datastream>> {
        let wanted = raster_data.to_lowercase();
        Ok(self
            .read(|s| {
                s.datastreams
                    .iter()
                    .find(|d| {
                        d.thing.as_ref().map(|t| &t.id) == Some(thing_id)
                            && d.raster_data().map(str::to_lowercase).as_deref() == Some(wanted.as_str())
                    })
                    .cloned()
            })
            .await)
    }

    async fn create_datastream(&self, datastream: &Datastream) -> Result<IotId> {
        self.write("Datastreams", |s, id| {
            let mut datastream = datastream.clone();
            datastream.id = Some(id);
            s.datastreams.push(datastream);
        })
        .await
    }

    async fn create_observation(&self, observation: &Observation) -> Result<IotId> {
        self.write("Observations", |s, id| {
            let mut observation = observation.clone();
            observation.id = Some(id);
            s.observations.push(observation);
        })
        .await
    }

    async fn list_things(&self, trial_id: &str) -> Result<Vec<Thing>> {
        Ok(self
            .read(|s| {
                s.things
                    .iter()
                    .filter(|t| t.trial_id() == Some(trial_id))
                    .cloned()
                    .collect()
            })
            .await)
    }
}
