//! Control plane client - forwards pipeline events and heartbeats
//!
//! Forwarding is best-effort: a failed batch is logged and dropped, it never
//! blocks or fails a cycle.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, PipelineEvent};
use crate::ledger::LedgerSnapshot;

/// Events sent per request
const FORWARD_BATCH: usize = 50;
/// Partial batches are flushed at least this often
const FORWARD_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Client for the control plane's bot endpoints
pub struct ControlPlaneClient {
    client: Client,
    base_url: String,
    bot_id: Uuid,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, bot_id: Uuid, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bot_id,
        })
    }

    /// Send heartbeat with the current ledger position
    pub async fn heartbeat(
        &self,
        status: &str,
        ledger: Option<&LedgerSnapshot>,
    ) -> anyhow::Result<HeartbeatResponse> {
        let url = format!("{}/v1/bot/{}/heartbeat", self.base_url, self.bot_id);

        let req = HeartbeatRequest {
            status: status.to_string(),
            timestamp: chrono::Utc::now(),
            metrics: ledger.map(|l| {
                vec![MetricInput {
                    timestamp: chrono::Utc::now(),
                    equity: l.running_balance,
                    pnl: l.realized_change,
                }]
            }),
        };

        let response = self.client.post(&url).json(&req).send().await?;

        if response.status().is_success() {
            let resp: HeartbeatResponse = response.json().await?;
            Ok(resp)
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("Heartbeat failed: {} - {}", status, text))
        }
    }

    /// Send events
    pub async fn send_events(&self, events: Vec<EventInput>) -> anyhow::Result<()> {
        let url = format!("{}/v1/bot/{}/events", self.base_url, self.bot_id);

        let req = EventsBatchRequest { events };

        let response = self.client.post(&url).json(&req).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("Events send failed: {} - {}", status, text))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HeartbeatRequest {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    metrics: Option<Vec<MetricInput>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricInput {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub equity: rust_decimal::Decimal,
    pub pnl: rust_decimal::Decimal,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
struct EventsBatchRequest {
    events: Vec<EventInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventInput {
    pub event_type: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&PipelineEvent> for EventInput {
    fn from(event: &PipelineEvent) -> Self {
        Self {
            event_type: event.kind().to_string(),
            message: event.summary(),
            metadata: serde_json::to_value(event).ok(),
            timestamp: event.at(),
        }
    }
}

async fn flush(client: &ControlPlaneClient, pending: &mut Vec<EventInput>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let count = batch.len();
    match client.send_events(batch).await {
        Ok(()) => debug!("Forwarded {} events", count),
        Err(e) => warn!("Dropped {} events: {}", count, e),
    }
}

/// Forward bus events to the control plane until cancelled or the bus closes
pub fn spawn_forwarder(
    bus: &EventBus,
    client: Arc<ControlPlaneClient>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        info!("Event forwarder started");
        let mut pending: Vec<EventInput> = Vec::with_capacity(FORWARD_BATCH);
        let mut ticker = tokio::time::interval(FORWARD_FLUSH_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => flush(&client, &mut pending).await,
                received = rx.recv() => match received {
                    Ok(event) => {
                        pending.push(EventInput::from(&event));
                        if pending.len() >= FORWARD_BATCH {
                            flush(&client, &mut pending).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event forwarder lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        flush(&client, &mut pending).await;
        info!("Event forwarder stopped");
    })
}
