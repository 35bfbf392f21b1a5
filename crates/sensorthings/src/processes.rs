//! OGC API Processes client (fetch, describe, execute).

use crate::error::Result;
use crate::http::{check_status, normalize_base_url, parse_json};
use crate::retry::{CancelFlag, RetryPolicy};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Thin client for a process catalog such as pygeoapi.
pub struct ProcessesClient {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
    cancel: CancelFlag,
}

impl ProcessesClient {
    pub fn new(base_url: &str, request_timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(request_timeout).build()?,
            base_url: normalize_base_url(base_url)?,
            policy,
            cancel: CancelFlag::new(),
        })
    }

    /// `GET /processes`
    pub async fn fetch(&self) -> Result<Value> {
        self.get(&format!("{}/processes", self.base_url)).await
    }

    /// `GET /processes/{id}`
    pub async fn describe(&self, process_id: &str) -> Result<Value> {
        self.get(&format!("{}/processes/{}", self.base_url, process_id))
            .await
    }

    /// `POST /processes/{id}/execution` with `{"inputs": inputs}`.
    ///
    /// Executions are not idempotent, so this is sent once.
    pub async fn execute(&self, process_id: &str, inputs: Value) -> Result<Value> {
        let url = execution_url(&self.base_url, process_id);
        tracing::info!(process = process_id, "executing process");
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "inputs": inputs }))
            .send()
            .await?;
        parse_json(check_status("POST", &url, resp).await?).await
    }

    async fn get(&self, url: &str) -> Result<Value> {
        self.policy
            .run(&self.cancel, url, || async {
                let resp = self.client.get(url).send().await?;
                parse_json(check_status("GET", url, resp).await?).await
            })
            .await
    }
}

fn execution_url(base_url: &str, process_id: &str) -> String {
    format!("{}/processes/{}/execution", base_url, process_id)
}
