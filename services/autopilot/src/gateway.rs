//! Analysis gateway client
//!
//! HTTP client for the local analysis gateway, which serves three roles:
//! opportunity analysis (`POST /v1/analyze`), error diagnosis
//! (`POST /v1/diagnose`) and the pre-cycle health probe (`GET /v1/health`).

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collaborators::{Analysis, Analyzer, AuditProbe, Diagnoser, Diagnosis};
use crate::error::{PipelineError, Result};
use crate::types::Opportunity;

/// Health checks use a short fixed timeout
const HEALTH_TIMEOUT_SECS: u64 = 5;

/// Map a non-success response onto the error taxonomy
///
/// 429 and 5xx are transient; any other 4xx rejects the item.
pub(crate) async fn check_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("status {}: {}", status, body);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(PipelineError::transient(operation, message))
    } else {
        Err(PipelineError::rejected(operation, message))
    }
}

/// Build the shared HTTP client used by every adapter
pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(2)
        .build()
        .map_err(|e| PipelineError::Invariant(format!("failed to build HTTP client: {}", e)))
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    opportunity_id: uuid::Uuid,
    ticker: &'a str,
    rank_score: f64,
    source_metadata: &'a Value,
}

#[derive(Debug, Serialize)]
struct DiagnoseRequest<'a> {
    message: &'a str,
    context: &'a Value,
}

#[derive(Debug, Deserialize)]
pub struct GatewayHealth {
    pub healthy: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Gateway client
pub struct HttpGateway {
    gateway_url: String,
    http_client: Client,
}

impl HttpGateway {
    pub fn new(gateway_url: &str, timeout: Duration) -> Result<Self> {
        let gateway_url = gateway_url.trim_end_matches('/').to_string();
        info!(
            "Gateway client initialized: url={}, timeout={:?}",
            gateway_url, timeout
        );
        Ok(Self {
            gateway_url,
            http_client: http_client(timeout)?,
        })
    }

    pub fn gateway_url(&self) -> &str {
        &self.gateway_url
    }

    /// GET /v1/health
    pub async fn health(&self) -> Result<GatewayHealth> {
        let url = format!("{}/v1/health", self.gateway_url);
        let response = self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("health", e))?;

        check_status("health", response)
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::rejected("health", format!("bad health response: {}", e)))
    }
}

#[async_trait::async_trait]
impl Analyzer for HttpGateway {
    /// POST /v1/analyze
    async fn analyze(&self, opportunity: &Opportunity) -> Result<Analysis> {
        let url = format!("{}/v1/analyze", self.gateway_url);
        debug!("Requesting analysis for {}", opportunity.ticker);

        let request = AnalyzeRequest {
            opportunity_id: opportunity.id,
            ticker: &opportunity.ticker,
            rank_score: opportunity.rank_score,
            source_metadata: &opportunity.source_metadata,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("analyze", e))?;

        let analysis: Analysis = check_status("analyze", response)
            .await?
            .json()
            .await
            .map_err(|e| {
                PipelineError::rejected("analyze", format!("bad analysis response: {}", e))
            })?;

        if !analysis.confidence.is_finite() || !analysis.variance.is_finite() {
            return Err(PipelineError::rejected(
                "analyze",
                format!("non-finite scores for {}", opportunity.ticker),
            ));
        }
        Ok(analysis)
    }
}

#[async_trait::async_trait]
impl Diagnoser for HttpGateway {
    /// POST /v1/diagnose
    async fn diagnose(&self, message: &str, context: &Value) -> Result<Diagnosis> {
        let url = format!("{}/v1/diagnose", self.gateway_url);
        let response = self
            .http_client
            .post(&url)
            .json(&DiagnoseRequest { message, context })
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("diagnose", e))?;

        check_status("diagnose", response)
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::rejected("diagnose", format!("bad diagnosis response: {}", e)))
    }
}

#[async_trait::async_trait]
impl AuditProbe for HttpGateway {
    async fn check(&self) -> Result<()> {
        let health = self.health().await?;
        if health.healthy {
            Ok(())
        } else {
            let reason = health.message.unwrap_or_else(|| "gateway unhealthy".to_string());
            warn!("Gateway reported unhealthy: {}", reason);
            Err(PipelineError::Audit(reason))
        }
    }
}
