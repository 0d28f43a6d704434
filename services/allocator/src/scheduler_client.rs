//! HTTP client for the placement service.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRequest {
    pub cpu: u64,
    pub memory: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target_hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleResponse {
    pub host: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

pub struct SchedulerClient {
    base_url: String,
    http: reqwest::Client,
}

impl SchedulerClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
        }
    }

    /// Ask the placement service for the best host.
    pub async fn schedule(&self, request: &ScheduleRequest) -> Result<ScheduleResponse> {
        let response = self
            .http
            .post(format!("{}/schedule", self.base_url))
            .json(request)
            .send()
            .await
            .context("scheduler request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error: ErrorResponse = response
                .json()
                .await
                .with_context(|| format!("scheduler returned status {status}"))?;
            bail!("scheduler returned status {status}: {}", error.error);
        }

        response
            .json()
            .await
            .context("decode scheduler response")
    }
}
