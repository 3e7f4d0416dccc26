//! vigild - local monitoring stack daemon
//!
//! Watches a periodically-mutated SQLite store, streams change events to
//! SSE clients, and supervises a declared daemon fleet with fast restarts
//! and slow pattern-matched self-healing.
//!
//! # Usage
//!
//! ```bash
//! # Run with ./vigil.toml (or built-in defaults)
//! vigild
//!
//! # Explicit config and bind address
//! vigild --config /etc/vigil/vigil.toml --addr 127.0.0.1:9000
//! ```
//!
//! # Environment Variables
//!
//! - `VIGIL_CONFIG`: Path to the TOML config file
//! - `VIGIL_CORS_ORIGINS`: Comma-separated allowed CORS origins
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vigil::api::{create_app, ApiState};
use vigil::config::{defaults, VigilConfig};
use vigil::store::{ProcessLock, Store};
use vigil::stream::{ChangeDetector, ClientRegistry, EventBroadcaster, Fingerprinter, QueryGroup};
use vigil::supervisor::{
    DaemonDescriptor, FailurePatternLibrary, ProcessDaemon, ProcessWatchdog, SelfHealSupervisor,
    SupervisorState, SystemObserver,
};
use vigil::EventLog;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "vigild")]
#[command(about = "vigil local monitoring stack")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file (falls back to ./vigil.toml)
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<String>,

    /// Override the server bind address
    #[arg(short, long)]
    addr: Option<String>,

    /// Override the monitored store path
    #[arg(long)]
    store: Option<String>,

    /// Override the data directory (process lock, event log)
    #[arg(long)]
    data_dir: Option<String>,
}

// ============================================================================
// Task Names for Monitor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    ChangeDetector,
    EventBroadcaster,
    ProcessWatchdog,
    SelfHealSupervisor,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::ChangeDetector => write!(f, "ChangeDetector"),
            TaskName::EventBroadcaster => write!(f, "EventBroadcaster"),
            TaskName::ProcessWatchdog => write!(f, "ProcessWatchdog"),
            TaskName::SelfHealSupervisor => write!(f, "SelfHealSupervisor"),
        }
    }
}

// ============================================================================
// Task Monitor
// ============================================================================

/// Monitor spawned tasks: any failure cancels the rest.
async fn run_task_monitor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Monitor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("🛑 Monitor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Monitor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Monitor: Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("🔒 Monitor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("🔒 Monitor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Drain remaining tasks so in-flight work finishes before exit.
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!("🔒 Monitor: Task {} completed", task_name),
            Ok(Err(e)) => error!("🔒 Monitor: Task error during shutdown: {}", e),
            Err(e) => error!("🔒 Monitor: Task panicked during shutdown: {}", e),
        }
    }

    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    // Load configuration with CLI overrides
    let mut config = match &args.config {
        Some(path) => VigilConfig::load_from_file(std::path::Path::new(path)),
        None => VigilConfig::load(),
    };
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(store) = args.store {
        config.store.path = store.into();
    }
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir.into();
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  vigil - Local Monitoring Stack");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("");
    info!("📦 Store: {}", config.store.path.display());
    info!(
        "👁  Poll every {}s | Watchdog every {}s | Deep scan every {}s",
        config.stream.poll_interval_secs,
        config.supervisor.watchdog_interval_secs,
        config.supervisor.deep_scan_interval_secs
    );

    info!("🔒 Acquiring process lock...");
    let _process_lock = ProcessLock::acquire(&config.store.data_dir)
        .context("Failed to acquire process lock")?;
    info!("✓ Process lock acquired");

    let event_log_path = config.store.data_dir.join(defaults::EVENT_LOG_DIR);
    let event_log =
        Arc::new(EventLog::open(&event_log_path).context("Failed to open event log")?);

    // --- Streaming layer ---
    let store = Store::new(&config.store.path);
    let groups: Vec<QueryGroup> = config.stream.groups.iter().map(QueryGroup::from).collect();
    if groups.is_empty() {
        info!("⚠ No [[stream.group]] entries configured — change feed will be idle");
    } else {
        info!(
            "✓ {} query group(s): {}",
            groups.len(),
            groups
                .iter()
                .map(|g| g.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let registry = Arc::new(ClientRegistry::new(
        config.stream.queue_capacity,
        config.stream.disconnect_after_full,
    ));
    let (event_tx, event_rx) = mpsc::channel(256);
    let (detector, detector_stats) =
        ChangeDetector::new(store, Fingerprinter::new(groups), &config.stream, event_tx);
    let broadcaster = EventBroadcaster::new(Arc::clone(&registry), event_rx);

    // --- Supervision layer ---
    let supervisor_state = Arc::new(SupervisorState::new());
    for daemon_cfg in &config.daemons {
        let descriptor = DaemonDescriptor::from_config(daemon_cfg);
        let handle = Arc::new(ProcessDaemon::new(descriptor.clone()));
        supervisor_state.insert(descriptor, handle).await;
        info!("✓ Supervising daemon: {}", daemon_cfg.name);
    }
    if config.daemons.is_empty() {
        info!("⚠ No [[daemon]] entries configured — supervision is idle");
    }

    let library = Arc::new(FailurePatternLibrary::standard());
    let observer = Arc::new(SystemObserver::new(config.store.data_dir.clone()));

    let (escalation_tx, escalation_rx) = mpsc::channel(32);
    let watchdog = ProcessWatchdog::new(
        Arc::clone(&supervisor_state),
        Arc::clone(&event_log),
        escalation_tx,
        Duration::from_secs(config.supervisor.watchdog_interval_secs),
        config.supervisor.watchdog_escalation_threshold,
    );
    let healer = SelfHealSupervisor::new(
        Arc::clone(&supervisor_state),
        library,
        observer,
        Arc::clone(&event_log),
        Duration::from_secs(config.supervisor.deep_scan_interval_secs),
        Duration::from_secs(config.supervisor.deep_scan_jitter_secs),
        config.supervisor.escalation_threshold,
    );

    // --- HTTP server ---
    info!("🌐 Starting HTTP server on {}...", config.server.addr);
    let api_state = ApiState {
        registry: Arc::clone(&registry),
        supervisor: Arc::clone(&supervisor_state),
        event_log: Arc::clone(&event_log),
        detector_stats,
    };
    let app = create_app(api_state);
    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.addr))?;
    info!("✓ HTTP server listening on {}", config.server.addr);
    info!("   Stream: http://{}/api/v1/stream", config.server.addr);
    info!("   Health: http://{}/api/v1/health", config.server.addr);
    info!("");

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    // --- Spawn all loops ---
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    let http_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                http_cancel.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;
        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });

    let detector_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[ChangeDetector] Task starting");
        detector.run(detector_cancel).await;
        Ok(TaskName::ChangeDetector)
    });

    let broadcaster_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[EventBroadcaster] Task starting");
        broadcaster.run(broadcaster_cancel).await;
        Ok(TaskName::EventBroadcaster)
    });

    let watchdog_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[ProcessWatchdog] Task starting");
        watchdog.run(watchdog_cancel).await;
        Ok(TaskName::ProcessWatchdog)
    });

    let healer_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[SelfHealSupervisor] Task starting");
        healer.run(escalation_rx, healer_cancel).await;
        Ok(TaskName::SelfHealSupervisor)
    });

    run_task_monitor(&mut task_set, cancel_token).await?;

    info!("");
    info!("✓ vigil shutdown complete");
    Ok(())
}
