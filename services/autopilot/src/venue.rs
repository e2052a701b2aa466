//! Execution venues
//!
//! `PaperVenue` simulates fills locally with random slippage; `HttpVenue`
//! forwards orders to a remote execution service.

use rand::Rng;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::amount::{from_venue_units, to_venue_units};
use crate::collaborators::{Fill, FillStatus, Venue};
use crate::error::{PipelineError, Result};
use crate::gateway::{check_status, http_client};
use crate::types::OrderSide;

/// Simulated venue
///
/// Every order fills at the reference price moved by up to `max_slippage_bps`
/// against the trader. Placing the same client id twice returns the first fill.
pub struct PaperVenue {
    reference_price: Decimal,
    max_slippage_bps: u32,
    fills: Mutex<HashMap<String, Fill>>,
}

impl PaperVenue {
    pub fn new(reference_price: Decimal, max_slippage_bps: u32) -> Self {
        Self {
            reference_price,
            max_slippage_bps,
            fills: Mutex::new(HashMap::new()),
        }
    }

    fn simulated_price(&self, side: OrderSide) -> Result<Decimal> {
        let bps = if self.max_slippage_bps == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_slippage_bps)
        };
        let slippage = self.reference_price * Decimal::from(bps) / Decimal::from(10_000);
        let price = match side {
            OrderSide::Buy => self.reference_price + slippage,
            OrderSide::Sell => self.reference_price - slippage,
        };
        // Round-trip through venue units like a real venue would report it
        let reported = to_venue_units(price).map_err(|e| PipelineError::Invariant(e.to_string()))?;
        from_venue_units(reported).map_err(|e| PipelineError::Invariant(e.to_string()))
    }

    pub fn fill_count(&self) -> usize {
        self.fills.lock().map(|f| f.len()).unwrap_or(0)
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new(Decimal::from(100), 25)
    }
}

#[async_trait::async_trait]
impl Venue for PaperVenue {
    async fn place_order(
        &self,
        client_id: &str,
        ticker: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<Fill> {
        if size <= Decimal::ZERO {
            return Err(PipelineError::rejected(
                "place_order",
                format!("non-positive size {} for {}", size, ticker),
            ));
        }

        let price = self.simulated_price(side)?;
        let mut fills = self
            .fills
            .lock()
            .map_err(|e| PipelineError::Invariant(format!("paper venue lock poisoned: {}", e)))?;

        let fill = fills
            .entry(client_id.to_string())
            .or_insert_with(|| Fill {
                order_id: format!("paper-{}", uuid::Uuid::new_v4()),
                status: FillStatus::Filled,
                fill_price: Some(price),
            })
            .clone();

        info!(
            "📝 PAPER {} {} {} @ {:?}",
            side.as_str(),
            size,
            ticker,
            fill.fill_price
        );
        Ok(fill)
    }

    async fn lookup_order(&self, client_id: &str) -> Result<Option<Fill>> {
        let fills = self
            .fills
            .lock()
            .map_err(|e| PipelineError::Invariant(format!("paper venue lock poisoned: {}", e)))?;
        Ok(fills.get(client_id).cloned())
    }

    async fn flatten_all(&self) -> Result<usize> {
        // Paper positions are notional; nothing to close
        Ok(0)
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    client_order_id: &'a str,
    ticker: &'a str,
    side: OrderSide,
    size: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
    status: FillStatus,
    #[serde(default)]
    fill_price: Option<Decimal>,
}

impl From<OrderResponse> for Fill {
    fn from(resp: OrderResponse) -> Self {
        Fill {
            order_id: resp.order_id,
            status: resp.status,
            fill_price: resp.fill_price,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlattenResponse {
    closed: usize,
}

/// Remote execution service
pub struct HttpVenue {
    base_url: String,
    http_client: Client,
}

impl HttpVenue {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: http_client(timeout)?,
        })
    }
}

#[async_trait::async_trait]
impl Venue for HttpVenue {
    /// POST /v1/orders
    async fn place_order(
        &self,
        client_id: &str,
        ticker: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<Fill> {
        let url = format!("{}/v1/orders", self.base_url);
        debug!("Placing {} {} {} via {}", side.as_str(), size, ticker, url);

        let response = self
            .http_client
            .post(&url)
            .json(&OrderRequest {
                client_order_id: client_id,
                ticker,
                side,
                size,
            })
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("place_order", e))?;

        let resp: OrderResponse = check_status("place_order", response)
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::rejected("place_order", format!("bad order response: {}", e)))?;
        Ok(resp.into())
    }

    /// GET /v1/orders/{client_id}
    async fn lookup_order(&self, client_id: &str) -> Result<Option<Fill>> {
        let url = format!("{}/v1/orders/{}", self.base_url, client_id);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("lookup_order", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let resp: OrderResponse = check_status("lookup_order", response)
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::rejected("lookup_order", format!("bad order response: {}", e)))?;
        Ok(Some(resp.into()))
    }

    /// POST /v1/positions/flatten
    async fn flatten_all(&self) -> Result<usize> {
        let url = format!("{}/v1/positions/flatten", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("flatten_all", e))?;

        let resp: FlattenResponse = check_status("flatten_all", response)
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::rejected("flatten_all", format!("bad flatten response: {}", e)))?;
        Ok(resp.closed)
    }

    fn name(&self) -> &str {
        "http"
    }
}
