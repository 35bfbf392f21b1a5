//! SensorThings API registry over HTTP.

use crate::api::{SensorThingsApi, ThingKey};
use crate::error::{Result, StaError};
use crate::models::{Collection, Datastream, IotId, Observation, Thing};
use async_trait::async_trait;
use reqwest::{header::LOCATION, Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Upper bound on followed `@iot.nextLink` pages per listing
const MAX_PAGES: usize = 1_000;

/// HTTP client for a SensorThings API v1.x endpoint.
pub struct HttpRegistry {
    client: Client,
    base_url: String,
}

impl HttpRegistry {
    /// Create a client for `base_url` (e.g. `https://host/FROST-Server/v1.1`).
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_collection<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let first = self.url(path);
        let resp = self.client.get(&first).query(query).send().await?;
        let mut page: Collection<T> = parse_json(check_status("GET", &first, resp).await?).await?;

        let mut items = Vec::new();
        for _ in 0..MAX_PAGES {
            items.append(&mut page.value);
            let Some(next) = page.next_link.take() else {
                return Ok(items);
            };
            tracing::debug!(url = %next, "following nextLink");
            let resp = self.client.get(&next).send().await?;
            page = parse_json(check_status("GET", &next, resp).await?).await?;
        }

        tracing::warn!(url = %first, pages = MAX_PAGES, "pagination limit reached");
        Ok(items)
    }

    async fn post_entity<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<IotId> {
        let url = self.url(path);
        let resp = self.client.post(&url).json(body).send().await?;
        let resp = check_status("POST", &url, resp).await?;

        let from_header = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(IotId::from_entity_url);
        if let Some(id) = from_header {
            return Ok(id);
        }

        // Some servers only return the created entity in the body
        let body = resp.text().await?;
        serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("@iot.id").cloned())
            .and_then(|id| serde_json::from_value(id).ok())
            .ok_or_else(|| StaError::InvalidResponse {
                url,
                reason: "created entity has no Location header or @iot.id".into(),
            })
    }
}

#[async_trait]
impl SensorThingsApi for HttpRegistry {
    async fn find_thing(&self, key: &ThingKey) -> Result<Option<Thing>> {
        for filter in thing_filters(key) {
            let mut things: Vec<Thing> = self
                .get_collection("Things", &[("$filter", filter)])
                .await?;
            if things.len() > 1 {
                tracing::warn!(key = %key, matches = things.len(), "several Things match plot, using the first");
            }
            if !things.is_empty() {
                return Ok(Some(things.swap_remove(0)));
            }
        }
        Ok(None)
    }

    async fn create_thing(&self, thing: &Thing) -> Result<IotId> {
        self.post_entity("Things", thing).await
    }

    async fn find_datastream(
        &self,
        thing_id: &IotId,
        raster_data: &str,
    ) -> Result<Option<Datastream>> {
        let path = format!("Things({})/Datastreams", thing_id.path_segment());
        let filter = format!(
            "tolower(properties/raster_data) eq {}",
            quote(&raster_data.to_lowercase())
        );
        let mut found: Vec<Datastream> = self.get_collection(&path, &[("$filter", filter)]).await?;
        Ok((!found.is_empty()).then(|| found.swap_remove(0)))
    }

    async fn create_datastream(&self, datastream: &Datastream) -> Result<IotId> {
        self.post_entity("Datastreams", datastream).await
    }

    async fn create_observation(&self, observation: &Observation) -> Result<IotId> {
        self.post_entity("Observations", observation).await
    }

    async fn list_things(&self, trial_id: &str) -> Result<Vec<Thing>> {
        self.get_collection(
            "Things",
            &[
                ("$filter", format!("properties/trial_id eq {}", quote(trial_id))),
                ("$expand", "Locations".to_string()),
            ],
        )
        .await
    }
}

/// Validate an endpoint URL and strip trailing slashes
pub fn normalize_base_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(trimmed.to_string()),
        _ => Err(StaError::InvalidUrl(url.to_string())),
    }
}

pub(crate) async fn check_status(method: &'static str, url: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StaError::Status {
        method,
        url: url.to_string(),
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}

pub(crate) async fn parse_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let url = resp.url().to_string();
    let body = resp.text().await?;
    serde_json::from_str(&body).map_err(|e| StaError::InvalidResponse {
        url,
        reason: e.to_string(),
    })
}

/// OData string literal
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Filters tried in order. Plot ids are stored as strings, but Things
/// created by older tooling may carry a numeric `plot_id`.
fn thing_filters(key: &ThingKey) -> Vec<String> {
    let trial = format!("properties/trial_id eq {}", quote(&key.trial_id));
    let mut filters = vec![format!(
        "{} and properties/plot_id eq {}",
        trial,
        quote(&key.plot_id)
    )];
    if let Ok(n) = key.plot_id.parse::<i64>() {
        filters.push(format!("{} and properties/plot_id eq {}", trial, n));
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_validation() {
        assert_eq!(
            normalize_base_url("https://sta.example.org/v1.1/").unwrap(),
            "https://sta.example.org/v1.1"
        );
        assert!(normalize_base_url("ftp://x").is_err());
        assert!(normalize_base_url("http://").is_err());
        assert!(normalize_base_url("sta.example.org").is_err());
    }

    #[test]
    fn filters_quote_and_numeric_fallback() {
        let filters = thing_filters(&ThingKey::new("O'Brien-2024", "12"));
        assert_eq!(filters.len(), 2);
        assert_eq!(
            filters[0],
            "properties/trial_id eq 'O''Brien-2024' and properties/plot_id eq '12'"
        );
        assert!(filters[1].ends_with("properties/plot_id eq 12"));

        assert_eq!(thing_filters(&ThingKey::new("T", "A1")).len(), 1);
    }
}
