//! Autopilot - durable trading pipeline runner
//!
//! Commands:
//! 1. `run` - engage the autopilot loop until ctrl-c or the breaker opens
//! 2. `cycle` - run exactly one cycle
//! 3. `status` - print ledger, breaker and queue state as YAML
//! 4. `reset-breaker` - operator reset of an open circuit breaker
//! 5. `recover` - reconcile interrupted work and exit

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use autopilot::collaborators::{Diagnoser, DiscoverySource, Venue};
use autopilot::discovery::HttpDiscoverySource;
use autopilot::gateway::HttpGateway;
use autopilot::venue::{HttpVenue, PaperVenue};
use autopilot::{
    spawn_forwarder, AutopilotConfig, Collaborators, ControlPlaneClient, CycleCoordinator,
    CycleStart, EventBus, Store,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "autopilot", version, about = "Durable phase-driven trading pipeline")]
struct Cli {
    /// YAML configuration file; AUTOPILOT__* environment variables override it
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log at DEBUG instead of INFO
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run cycles continuously
    Run,
    /// Run a single cycle
    Cycle,
    /// Print current state
    Status,
    /// Clear an open circuit breaker
    ResetBreaker {
        #[arg(long)]
        operator: String,
    },
    /// Reconcile interrupted work and exit
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = AutopilotConfig::load(cli.config.as_deref())?;
    info!("Store: {}", config.store_path.display());

    let events = EventBus::default();
    let background = CancellationToken::new();
    let control_plane = match (&config.endpoints.control_plane_url, config.endpoints.bot_id) {
        (Some(url), Some(bot_id)) => {
            info!("Forwarding events to {} as bot {}", url, bot_id);
            Some(Arc::new(ControlPlaneClient::new(
                url,
                bot_id,
                config.endpoints.request_timeout(),
            )?))
        }
        (Some(_), None) => {
            warn!("control_plane_url set without bot_id; event forwarding disabled");
            None
        }
        _ => None,
    };
    let forwarder = control_plane
        .clone()
        .map(|client| spawn_forwarder(&events, client, background.clone()));

    let coordinator = Arc::new(build_coordinator(config, events).await?);

    let result = match cli.command {
        Command::Run => {
            if let Some(client) = control_plane {
                tokio::spawn(heartbeat_loop(client, coordinator.clone(), background.clone()));
            }
            run(coordinator).await
        }
        Command::Cycle => cycle(&coordinator).await,
        Command::Status => {
            let status = coordinator.status().await?;
            print!("{}", serde_yaml::to_string(&status)?);
            Ok(())
        }
        Command::ResetBreaker { operator } => {
            coordinator.reset_breaker(&operator).await?;
            info!("✓ Circuit breaker reset by {}", operator);
            Ok(())
        }
        Command::Recover => {
            let result = coordinator.startup_reconciliation();
            if result.is_clean() {
                info!("✓ Nothing to recover");
            } else {
                info!(
                    "✓ Recovered {} queue items, settled {} fills, failed {} orders",
                    result.recovered_queue_items, result.settled_filled, result.settled_failed
                );
            }
            Ok(())
        }
    };

    background.cancel();
    if let Some(handle) = forwarder {
        let _ = handle.await;
    }
    result
}

async fn build_coordinator(
    config: AutopilotConfig,
    events: EventBus,
) -> anyhow::Result<CycleCoordinator> {
    let timeout = config.endpoints.request_timeout();
    let store = Arc::new(Store::open(&config.store_path)?);

    let gateway = Arc::new(HttpGateway::new(&config.endpoints.gateway_url, timeout)?);

    let mut sources: Vec<Arc<dyn DiscoverySource>> = Vec::new();
    for url in &config.endpoints.discovery_urls {
        sources.push(Arc::new(HttpDiscoverySource::new(url, timeout)?));
    }
    if sources.is_empty() {
        warn!("No discovery sources configured; cycles will only drain the queues");
    }

    let venue: Arc<dyn Venue> = match &config.endpoints.venue_url {
        Some(url) => Arc::new(HttpVenue::new(url, timeout)?),
        None => {
            info!("📝 No venue configured, using paper venue");
            Arc::new(PaperVenue::default())
        }
    };

    let collaborators = Collaborators {
        sources,
        analyzer: gateway.clone(),
        venue,
        audit: gateway.clone(),
    };
    let diagnoser: Arc<dyn Diagnoser> = gateway;

    let coordinator =
        CycleCoordinator::bootstrap(config, store, collaborators, diagnoser, events).await?;
    Ok(coordinator)
}

async fn run(coordinator: Arc<CycleCoordinator>) -> anyhow::Result<()> {
    let signal_target = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_target.cancel();
        }
    });

    coordinator.run_autopilot().await?;
    Ok(())
}

/// Report liveness and the ledger position until shutdown
async fn heartbeat_loop(
    client: Arc<ControlPlaneClient>,
    coordinator: Arc<CycleCoordinator>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (state, ledger) = match coordinator.status().await {
            Ok(status) if status.breaker.open => ("halted", status.ledger),
            Ok(status) if status.cycle_running => ("running", status.ledger),
            Ok(status) => ("idle", status.ledger),
            Err(e) => {
                warn!("Status unavailable for heartbeat: {}", e);
                ("degraded", None)
            }
        };
        if let Err(e) = client.heartbeat(state, ledger.as_ref()).await {
            warn!("Heartbeat failed: {}", e);
        }
    }
}

async fn cycle(coordinator: &CycleCoordinator) -> anyhow::Result<()> {
    match coordinator.start_cycle().await? {
        CycleStart::Completed(report) => {
            let summary = &report.summary;
            info!(
                "Cycle {} {}: {} discovered, {} promoted, {} filled, {} failed, balance {} -> {}",
                summary.cycle_id,
                report.outcome().as_str(),
                summary.opportunities_discovered,
                summary.orders_promoted,
                summary.orders_filled,
                summary.orders_failed,
                summary.balance_before,
                summary.balance_after
            );
            if report.breaker_tripped() {
                error!("Circuit breaker tripped; run `reset-breaker` after investigating");
            }
        }
        CycleStart::AlreadyRunning => warn!("A cycle is already running"),
        CycleStart::BreakerOpen => {
            error!("Circuit breaker open; run `reset-breaker --operator <name>` first")
        }
    }
    Ok(())
}
