//! System-wide default constants.
//!
//! Centralises the cadence and threshold numbers so every loop reads the
//! same values the config layer documents. Grouped by subsystem.

// ============================================================================
// Change Detection
// ============================================================================

/// Interval between store polls (seconds).
pub const POLL_INTERVAL_SECS: u64 = 3;

/// Maximum busy-retry attempts inside a single poll tick.
pub const BUSY_RETRIES: u32 = 3;

/// Backoff between busy retries (milliseconds).
pub const BUSY_BACKOFF_MS: u64 = 150;

// ============================================================================
// Streaming
// ============================================================================

/// Per-client output queue capacity (frames).
pub const CLIENT_QUEUE_CAPACITY: usize = 64;

/// Consecutive full-queue events before a client is forcibly disconnected.
///
/// Dropping the oldest frame handles brief stalls; only a client that stays
/// full across this many broadcasts is cut loose.
pub const DISCONNECT_AFTER_FULL: u32 = 10;

/// SSE keep-alive comment period (seconds).
pub const KEEPALIVE_SECS: u64 = 15;

// ============================================================================
// Watchdog
// ============================================================================

/// Interval between watchdog liveness sweeps (seconds).
pub const WATCHDOG_INTERVAL_SECS: u64 = 60;

/// Consecutive failed watchdog cycles before handing a daemon to the healer.
pub const WATCHDOG_ESCALATION_THRESHOLD: u32 = 3;

/// Default restart attempts per watchdog cycle.
pub const RESTART_MAX_ATTEMPTS: u32 = 2;

/// Default grace period after a restart before re-probing (milliseconds).
pub const RESTART_GRACE_MS: u64 = 500;

// ============================================================================
// Self-Heal Supervisor
// ============================================================================

/// Base interval between deep scans (seconds). 21 600 = 6 hours.
pub const DEEP_SCAN_INTERVAL_SECS: u64 = 21_600;

/// Random jitter added to the deep-scan interval (seconds). 1 800 = ±30 min.
pub const DEEP_SCAN_JITTER_SECS: u64 = 1_800;

/// Consecutive failed remedies before a daemon latches Degraded.
pub const ESCALATION_THRESHOLD: u32 = 3;

/// Lock files older than this are considered stale (seconds).
pub const STALE_LOCK_MAX_AGE_SECS: u64 = 3_600;

/// Minimum free disk space before the disk-full pattern fires (bytes).
pub const MIN_DISK_FREE_BYTES: u64 = 500 * 1024 * 1024;

/// Export files older than this are considered stale (seconds).
pub const STALE_EXPORT_MAX_AGE_SECS: u64 = 24 * 3_600;

// ============================================================================
// Paths & Server
// ============================================================================

/// Default HTTP bind address.
pub const SERVER_ADDR: &str = "127.0.0.1:8766";

/// Default data directory (process lock, event log).
pub const DATA_DIR: &str = "./data";

/// Default path of the monitored SQLite store.
pub const STORE_PATH: &str = "./data/monitor.db";

/// Event log directory under the data directory.
pub const EVENT_LOG_DIR: &str = "eventlog";
