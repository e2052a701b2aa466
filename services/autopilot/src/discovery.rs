//! Discovery source adapters

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::collaborators::DiscoverySource;
use crate::error::{PipelineError, Result};
use crate::gateway::{check_status, http_client};
use crate::types::Opportunity;

/// Candidate as reported by a discovery feed
#[derive(Debug, Deserialize)]
struct Candidate {
    ticker: String,
    #[serde(default)]
    rank_score: f64,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// Polls `GET {url}/opportunities` for candidates
pub struct HttpDiscoverySource {
    name: String,
    base_url: String,
    http_client: Client,
}

impl HttpDiscoverySource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            name: format!("discovery:{}", base_url),
            base_url,
            http_client: http_client(timeout)?,
        })
    }
}

#[async_trait::async_trait]
impl DiscoverySource for HttpDiscoverySource {
    async fn discover(&self) -> Result<Vec<Opportunity>> {
        let url = format!("{}/opportunities", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("discover", e))?;

        let candidates: Vec<Candidate> = check_status("discover", response)
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::rejected("discover", format!("bad discovery feed: {}", e)))?;

        let opportunities: Vec<Opportunity> = candidates
            .into_iter()
            .filter(|c| !c.ticker.trim().is_empty() && c.rank_score.is_finite())
            .map(|c| Opportunity::new(c.ticker.trim(), c.rank_score).with_metadata(c.metadata))
            .collect();

        debug!("{} returned {} opportunities", self.name, opportunities.len());
        Ok(opportunities)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
