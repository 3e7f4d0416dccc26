//! Deployment configuration loaded from TOML.
//!
//! Every cadence, threshold, and path the loops use is an operator-tunable
//! field here. Each struct implements `Default` with values matching the
//! constants in [`defaults`], so behaviour is unchanged when no config file
//! is present.
//!
//! ## Loading Order
//!
//! 1. `VIGIL_CONFIG` environment variable (path to TOML file)
//! 2. `vigil.toml` in the current working directory
//! 3. Built-in defaults

pub mod defaults;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a vigil deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Monitored datastore location
    #[serde(default)]
    pub store: StoreConfig,

    /// Change-detection and fan-out tuning
    #[serde(default)]
    pub stream: StreamConfig,

    /// Watchdog and self-heal tuning
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Supervised daemon fleet, declared at startup and immutable during run
    #[serde(default, rename = "daemon")]
    pub daemons: Vec<DaemonConfig>,
}

impl VigilConfig {
    /// Load configuration using the documented search order.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("VIGIL_CONFIG") {
            return Self::load_from_file(Path::new(&path));
        }

        let local = Path::new("vigil.toml");
        if local.exists() {
            return Self::load_from_file(local);
        }

        info!("No config file found, using built-in defaults");
        Self::default()
    }

    /// Load configuration from a specific TOML file, falling back to
    /// defaults on read or parse failure.
    pub fn load_from_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match toml::from_str::<Self>(&raw) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Config parse failed, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Config read failed, using defaults");
                Self::default()
            }
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the API and SSE stream.
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_addr() -> String {
    defaults::SERVER_ADDR.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Location of the monitored SQLite store and of vigil's own data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database mutated by external writers.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Directory for the process lock and the event log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(defaults::STORE_PATH)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(defaults::DATA_DIR)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            data_dir: default_data_dir(),
        }
    }
}

// ============================================================================
// Streaming
// ============================================================================

/// Change-detection cadence and per-client backpressure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Seconds between store polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Busy-retry attempts within a single tick before the cycle is skipped.
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,

    /// Milliseconds between busy retries.
    #[serde(default = "default_busy_backoff")]
    pub busy_backoff_ms: u64,

    /// Per-client output queue capacity (frames).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Consecutive full-queue events before a client is disconnected.
    #[serde(default = "default_disconnect_after_full")]
    pub disconnect_after_full: u32,

    /// Query groups fingerprinted each poll cycle.
    ///
    /// Group names are what `ChangeEvent.changed_groups` carries, so
    /// consumers can re-fetch only what moved.
    #[serde(default, rename = "group")]
    pub groups: Vec<QueryGroupConfig>,
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }
}

fn default_poll_interval() -> u64 {
    defaults::POLL_INTERVAL_SECS
}

fn default_busy_retries() -> u32 {
    defaults::BUSY_RETRIES
}

fn default_busy_backoff() -> u64 {
    defaults::BUSY_BACKOFF_MS
}

fn default_queue_capacity() -> usize {
    defaults::CLIENT_QUEUE_CAPACITY
}

fn default_disconnect_after_full() -> u32 {
    defaults::DISCONNECT_AFTER_FULL
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            busy_retries: default_busy_retries(),
            busy_backoff_ms: default_busy_backoff(),
            queue_capacity: default_queue_capacity(),
            disconnect_after_full: default_disconnect_after_full(),
            groups: Vec::new(),
        }
    }
}

/// A named group of read-only queries folded into one fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryGroupConfig {
    /// Logical entity group name surfaced to stream consumers.
    pub name: String,

    /// Read-only SQL executed against the store each cycle.
    pub queries: Vec<String>,
}

// ============================================================================
// Supervisor
// ============================================================================

/// Watchdog and self-heal supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds between watchdog liveness sweeps.
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    /// Consecutive failed watchdog cycles before escalation to the healer.
    #[serde(default = "default_watchdog_escalation")]
    pub watchdog_escalation_threshold: u32,

    /// Base seconds between deep scans.
    #[serde(default = "default_deep_scan_interval")]
    pub deep_scan_interval_secs: u64,

    /// Random jitter added to the deep-scan interval (seconds).
    #[serde(default = "default_deep_scan_jitter")]
    pub deep_scan_jitter_secs: u64,

    /// Consecutive failed remedies before a daemon latches Degraded.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
}

fn default_watchdog_interval() -> u64 {
    defaults::WATCHDOG_INTERVAL_SECS
}

fn default_watchdog_escalation() -> u32 {
    defaults::WATCHDOG_ESCALATION_THRESHOLD
}

fn default_deep_scan_interval() -> u64 {
    defaults::DEEP_SCAN_INTERVAL_SECS
}

fn default_deep_scan_jitter() -> u64 {
    defaults::DEEP_SCAN_JITTER_SECS
}

fn default_escalation_threshold() -> u32 {
    defaults::ESCALATION_THRESHOLD
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_secs: default_watchdog_interval(),
            watchdog_escalation_threshold: default_watchdog_escalation(),
            deep_scan_interval_secs: default_deep_scan_interval(),
            deep_scan_jitter_secs: default_deep_scan_jitter(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

// ============================================================================
// Daemons
// ============================================================================

/// One supervised daemon, as declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unique daemon name.
    pub name: String,

    /// Command (argv) that starts or restarts the daemon.
    pub start_command: Vec<String>,

    /// Pid file written by the daemon, used as the liveness probe.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// TCP address probed for liveness instead of a pid file.
    #[serde(default)]
    pub probe_addr: Option<String>,

    /// Lock file the daemon takes; stale copies are a known failure pattern.
    #[serde(default)]
    pub lock_file: Option<PathBuf>,

    /// Export file the daemon is expected to refresh; staleness is a
    /// known failure pattern.
    #[serde(default)]
    pub export_file: Option<PathBuf>,

    /// Port the daemon must be able to bind.
    #[serde(default)]
    pub port: Option<u16>,

    /// Restart attempts per watchdog cycle.
    #[serde(default = "default_restart_attempts")]
    pub restart_max_attempts: u32,

    /// Grace period after a restart before re-probing (milliseconds).
    #[serde(default = "default_restart_grace")]
    pub restart_grace_ms: u64,
}

fn default_restart_attempts() -> u32 {
    defaults::RESTART_MAX_ATTEMPTS
}

fn default_restart_grace() -> u64 {
    defaults::RESTART_GRACE_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = VigilConfig::default();
        assert_eq!(config.stream.poll_interval_secs, defaults::POLL_INTERVAL_SECS);
        assert_eq!(config.stream.queue_capacity, defaults::CLIENT_QUEUE_CAPACITY);
        assert_eq!(
            config.supervisor.escalation_threshold,
            defaults::ESCALATION_THRESHOLD
        );
        assert!(config.daemons.is_empty());
    }

    #[test]
    fn parses_daemon_table() {
        let raw = r#"
            [server]
            addr = "127.0.0.1:9000"

            [[stream.group]]
            name = "sessions"
            queries = ["SELECT id FROM sessions"]

            [[daemon]]
            name = "exporter"
            start_command = ["/usr/bin/exporter", "--daemon"]
            pid_file = "/tmp/exporter.pid"
            port = 9100
        "#;
        let config: VigilConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.addr, "127.0.0.1:9000");
        assert_eq!(config.stream.groups.len(), 1);
        assert_eq!(config.stream.groups[0].name, "sessions");
        assert_eq!(config.daemons.len(), 1);
        assert_eq!(config.daemons[0].name, "exporter");
        assert_eq!(config.daemons[0].port, Some(9100));
        assert_eq!(
            config.daemons[0].restart_max_attempts,
            defaults::RESTART_MAX_ATTEMPTS
        );
    }
}
