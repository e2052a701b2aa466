//! Autopilot configuration
//!
//! Loaded from an optional YAML file, then overridden by `AUTOPILOT__*`
//! environment variables (e.g. `AUTOPILOT__RISK__FLOOR=250`).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AutopilotConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    /// SQLite file backing the durable queues and audit log
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            flow: FlowConfig::default(),
            risk: RiskConfig::default(),
            retry: RetryConfig::default(),
            dispatcher: DispatcherConfig::default(),
            endpoints: EndpointsConfig::default(),
            store_path: default_store_path(),
        }
    }
}

impl AutopilotConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("AUTOPILOT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: AutopilotConfig = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to read configuration: {}", e))?
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject configurations that would break the capital or flow invariants
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.risk.floor > self.risk.principal {
            return Err(anyhow::anyhow!(
                "Capital floor {} exceeds principal {}",
                self.risk.floor,
                self.risk.principal
            ));
        }
        if self.risk.position_size_pct <= Decimal::ZERO
            || self.risk.position_size_pct > Decimal::from(100)
        {
            return Err(anyhow::anyhow!(
                "position_size_pct must be in (0, 100], got {}",
                self.risk.position_size_pct
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.variance_threshold) {
            return Err(anyhow::anyhow!(
                "variance_threshold must be in [0, 1], got {}",
                self.risk.variance_threshold
            ));
        }
        if self.flow.min_queue > self.flow.max_queue {
            return Err(anyhow::anyhow!(
                "flow.min_queue {} exceeds flow.max_queue {}",
                self.flow.min_queue,
                self.flow.max_queue
            ));
        }
        if self.pipeline.batch_size == 0 {
            return Err(anyhow::anyhow!("pipeline.batch_size must be at least 1"));
        }
        if self.pipeline.discovery_workers == 0 || self.pipeline.analysis_workers == 0 {
            return Err(anyhow::anyhow!("worker caps must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Phase sizing and concurrency caps
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct PipelineConfig {
    /// Top-N opportunities analyzed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_discovery_workers")]
    pub discovery_workers: usize,
    #[serde(default = "default_analysis_workers")]
    pub analysis_workers: usize,
    /// Pause between autopilot cycles
    #[serde(default = "default_cycle_cooldown_secs")]
    pub cycle_cooldown_secs: u64,
}

impl PipelineConfig {
    pub fn cycle_cooldown(&self) -> Duration {
        Duration::from_secs(self.cycle_cooldown_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            confidence_threshold: default_confidence_threshold(),
            discovery_workers: default_discovery_workers(),
            analysis_workers: default_analysis_workers(),
            cycle_cooldown_secs: default_cycle_cooldown_secs(),
        }
    }
}

/// Queue water marks
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct FlowConfig {
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_min_queue")]
    pub min_queue: usize,
    #[serde(default = "default_restock_cooldown_secs")]
    pub restock_cooldown_secs: u64,
}

impl FlowConfig {
    pub fn restock_cooldown(&self) -> Duration {
        Duration::from_secs(self.restock_cooldown_secs)
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_queue: default_max_queue(),
            min_queue: default_min_queue(),
            restock_cooldown_secs: default_restock_cooldown_secs(),
        }
    }
}

/// Capital pool and veto limits
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RiskConfig {
    #[serde(default = "default_principal")]
    pub principal: Decimal,
    #[serde(default = "default_floor")]
    pub floor: Decimal,
    /// Variance above this always vetoes (e.g., 0.25)
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,
    /// Order size as a percentage of the running balance (e.g., 5 for 5%)
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            principal: default_principal(),
            floor: default_floor(),
            variance_threshold: default_variance_threshold(),
            position_size_pct: default_position_size_pct(),
        }
    }
}

/// Retry policy shared by every collaborator call site
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Error dispatcher and circuit breaker
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct DispatcherConfig {
    /// Consecutive escalating errors tolerated before the breaker trips
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_diagnosis_timeout_secs")]
    pub diagnosis_timeout_secs: u64,
}

impl DispatcherConfig {
    pub fn diagnosis_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnosis_timeout_secs)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            diagnosis_timeout_secs: default_diagnosis_timeout_secs(),
        }
    }
}

/// External collaborator endpoints
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EndpointsConfig {
    /// Analysis / diagnosis / health gateway
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Execution venue; `None` runs against the paper venue
    #[serde(default)]
    pub venue_url: Option<String>,
    #[serde(default)]
    pub discovery_urls: Vec<String>,
    /// Observability forwarding target; `None` disables forwarding
    #[serde(default)]
    pub control_plane_url: Option<String>,
    #[serde(default)]
    pub bot_id: Option<Uuid>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl EndpointsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            venue_url: None,
            discovery_urls: Vec::new(),
            control_plane_url: None,
            bot_id: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_batch_size() -> usize { 5 }
fn default_confidence_threshold() -> f64 { 0.6 }
fn default_discovery_workers() -> usize { 4 }
fn default_analysis_workers() -> usize { 4 }
fn default_cycle_cooldown_secs() -> u64 { 60 }
fn default_max_queue() -> usize { 50 }
fn default_min_queue() -> usize { 5 }
fn default_restock_cooldown_secs() -> u64 { 300 }
fn default_principal() -> Decimal { Decimal::from(300) }
fn default_floor() -> Decimal { Decimal::from(250) }
fn default_variance_threshold() -> f64 { 0.25 }
fn default_position_size_pct() -> Decimal { Decimal::from(5) }
fn default_max_attempts() -> u32 { 3 }
fn default_base_backoff_ms() -> u64 { 200 }
fn default_max_backoff_ms() -> u64 { 5_000 }
fn default_retry_budget() -> u32 { 3 }
fn default_diagnosis_timeout_secs() -> u64 { 10 }
fn default_gateway_url() -> String { "http://localhost:8090".to_string() }
fn default_request_timeout_secs() -> u64 { 30 }

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("autopilot")
        .join("autopilot.db")
}
