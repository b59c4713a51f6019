//! Rain status from an external HTTP endpoint.
//!
//! Watering during rain wastes tank water, so the failure default is "it is
//! raining": any fetch or parse problem suppresses schedule-driven watering
//! for that tick rather than opening valves on unknown weather.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RainStatus {
    state: String,
}

pub(crate) struct RainOracle {
    client: reqwest::Client,
    url: Option<String>,
}

impl RainOracle {
    pub(crate) fn new(url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("failed to build rain status HTTP client")?;
        Ok(Self { client, url })
    }

    /// Poll the configured endpoint. No endpoint configured means no rain
    /// suppression; a configured endpoint that cannot be reached means rain.
    pub(crate) async fn is_raining(&self) -> bool {
        let Some(url) = &self.url else {
            return false;
        };
        match self.fetch_state(url).await {
            Ok(state) => state == "Yes",
            Err(e) => {
                warn!("rain status fetch failed: {e:#} — withholding watering");
                true
            }
        }
    }

    async fn fetch_state(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("rain status request failed")?
            .error_for_status()
            .context("rain status endpoint returned an error")?;
        let status: RainStatus = response
            .json()
            .await
            .context("rain status body is not the expected JSON")?;
        Ok(status.state)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
