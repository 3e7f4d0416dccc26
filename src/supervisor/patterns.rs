//! Failure pattern library — ordered, first-match-wins classification.
//!
//! A pattern pairs a pure predicate over an [`Observation`] snapshot with
//! the remedy to apply when it matches. Matching is resolved strictly in
//! declaration order: when several conditions are simultaneously true only
//! the highest-priority pattern's remedy runs, so unrelated fixes never
//! compound. The set is an open registry — callers register their own
//! patterns, and tests seed synthetic ones.

use crate::config::defaults;
use crate::supervisor::daemon::{DaemonDescriptor, DaemonHandle, Liveness, LivenessProbe};
use crate::supervisor::remedy::{self, Remedy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Observation
// ============================================================================

/// Point-in-time snapshot of one daemon's observable state.
///
/// Gathering is the observer's job; matchers only read.
#[derive(Debug, Clone)]
pub struct Observation {
    pub daemon: String,
    pub process_alive: bool,
    /// Probe failure reason, when the probe failed.
    pub probe_reason: Option<String>,
    /// The daemon is down and something else holds its port.
    pub port_conflict: bool,
    /// Age of the daemon's lock file, when one exists.
    pub lock_file_age: Option<Duration>,
    /// Free bytes on the data volume, when measurable.
    pub disk_free_bytes: Option<u64>,
    /// Age of the daemon's export file, when one exists.
    pub export_age: Option<Duration>,
    /// Socket probe outcome, when the daemon exposes one.
    pub socket_healthy: Option<bool>,
    /// Consecutive failed watchdog restart cycles.
    pub crash_loop_count: u32,
    /// A permission error was hit while observing.
    pub permission_error: bool,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    /// A fully healthy baseline — useful as a starting point for builders
    /// and tests.
    pub fn healthy(daemon: impl Into<String>) -> Self {
        Self {
            daemon: daemon.into(),
            process_alive: true,
            probe_reason: None,
            port_conflict: false,
            lock_file_age: None,
            disk_free_bytes: None,
            export_age: None,
            socket_healthy: None,
            crash_loop_count: 0,
            permission_error: false,
            observed_at: Utc::now(),
        }
    }
}

// ============================================================================
// Matchers
// ============================================================================

/// Pattern severity, used for ordering the standard library and recorded
/// on every heal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for PatternSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternSeverity::Critical => write!(f, "critical"),
            PatternSeverity::High => write!(f, "high"),
            PatternSeverity::Medium => write!(f, "medium"),
            PatternSeverity::Low => write!(f, "low"),
        }
    }
}

/// Pure predicate over an [`Observation`].
#[derive(Clone)]
pub enum Matcher {
    /// Liveness probe failed.
    ProcessDown,
    /// Daemon down and its port is held by something else.
    PortConflict,
    /// Lock file older than the threshold.
    StaleLock { max_age: Duration },
    /// Free space below the threshold.
    DiskFull { min_free_bytes: u64 },
    /// Export file older than the threshold.
    StaleExport { max_age: Duration },
    /// Socket probe reported unhealthy.
    SocketUnhealthy,
    /// Watchdog restart failures at or above the threshold.
    CrashLoop { threshold: u32 },
    /// Observation hit a permission error.
    PermissionDenied,
    /// Caller-supplied predicate; keeps the registry open for conditions
    /// this core does not model.
    Custom(Arc<dyn Fn(&Observation) -> bool + Send + Sync>),
}

impl Matcher {
    pub fn matches(&self, obs: &Observation) -> bool {
        match self {
            Matcher::ProcessDown => !obs.process_alive,
            Matcher::PortConflict => obs.port_conflict,
            Matcher::StaleLock { max_age } => {
                obs.lock_file_age.map(|age| age > *max_age).unwrap_or(false)
            }
            Matcher::DiskFull { min_free_bytes } => obs
                .disk_free_bytes
                .map(|free| free < *min_free_bytes)
                .unwrap_or(false),
            Matcher::StaleExport { max_age } => {
                obs.export_age.map(|age| age > *max_age).unwrap_or(false)
            }
            Matcher::SocketUnhealthy => obs.socket_healthy == Some(false),
            Matcher::CrashLoop { threshold } => obs.crash_loop_count >= *threshold,
            Matcher::PermissionDenied => obs.permission_error,
            Matcher::Custom(predicate) => predicate(obs),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::ProcessDown => write!(f, "ProcessDown"),
            Matcher::PortConflict => write!(f, "PortConflict"),
            Matcher::StaleLock { max_age } => write!(f, "StaleLock({:?})", max_age),
            Matcher::DiskFull { min_free_bytes } => write!(f, "DiskFull({})", min_free_bytes),
            Matcher::StaleExport { max_age } => write!(f, "StaleExport({:?})", max_age),
            Matcher::SocketUnhealthy => write!(f, "SocketUnhealthy"),
            Matcher::CrashLoop { threshold } => write!(f, "CrashLoop({})", threshold),
            Matcher::PermissionDenied => write!(f, "PermissionDenied"),
            Matcher::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

// ============================================================================
// Pattern & Library
// ============================================================================

/// A known failure signature paired with its remedy.
#[derive(Clone)]
pub struct FailurePattern {
    pub id: String,
    pub severity: PatternSeverity,
    pub matcher: Matcher,
    pub remedy: Arc<dyn Remedy>,
}

impl FailurePattern {
    pub fn new(
        id: impl Into<String>,
        severity: PatternSeverity,
        matcher: Matcher,
        remedy: Arc<dyn Remedy>,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            matcher,
            remedy,
        }
    }
}

impl fmt::Debug for FailurePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailurePattern")
            .field("id", &self.id)
            .field("severity", &self.severity)
            .field("matcher", &self.matcher)
            .field("remedy", &self.remedy.name())
            .finish()
    }
}

/// Ordered registry of failure patterns. Declaration order is priority
/// order.
#[derive(Debug, Default)]
pub struct FailurePatternLibrary {
    patterns: Vec<FailurePattern>,
}

impl FailurePatternLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pattern. Later registrations have lower priority.
    pub fn register(&mut self, pattern: FailurePattern) -> &mut Self {
        self.patterns.push(pattern);
        self
    }

    /// First pattern (in declaration order) whose matcher is true.
    pub fn match_first(&self, obs: &Observation) -> Option<&FailurePattern> {
        self.patterns.iter().find(|p| p.matcher.matches(obs))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The default library: the eight observable failure classes in
    /// severity order. Conditions a restart cannot fix come first so a
    /// plain process-down match never shadows them.
    pub fn standard() -> Self {
        let mut lib = Self::new();
        lib.register(FailurePattern::new(
            "disk_full",
            PatternSeverity::Critical,
            Matcher::DiskFull {
                min_free_bytes: defaults::MIN_DISK_FREE_BYTES,
            },
            Arc::new(remedy::RotateLogs::default()),
        ))
        .register(FailurePattern::new(
            "permission_denied",
            PatternSeverity::Critical,
            Matcher::PermissionDenied,
            Arc::new(remedy::ManualIntervention),
        ))
        .register(FailurePattern::new(
            "port_conflict",
            PatternSeverity::High,
            Matcher::PortConflict,
            Arc::new(remedy::RestartDaemon),
        ))
        .register(FailurePattern::new(
            "stale_lock",
            PatternSeverity::High,
            Matcher::StaleLock {
                max_age: Duration::from_secs(defaults::STALE_LOCK_MAX_AGE_SECS),
            },
            Arc::new(remedy::ClearStaleLock),
        ))
        .register(FailurePattern::new(
            "crash_loop",
            PatternSeverity::High,
            Matcher::CrashLoop {
                threshold: defaults::WATCHDOG_ESCALATION_THRESHOLD,
            },
            Arc::new(remedy::ClearStaleLock),
        ))
        .register(FailurePattern::new(
            "socket_unhealthy",
            PatternSeverity::Medium,
            Matcher::SocketUnhealthy,
            Arc::new(remedy::RestartDaemon),
        ))
        .register(FailurePattern::new(
            "stale_export",
            PatternSeverity::Medium,
            Matcher::StaleExport {
                max_age: Duration::from_secs(defaults::STALE_EXPORT_MAX_AGE_SECS),
            },
            Arc::new(remedy::RestartDaemon),
        ))
        .register(FailurePattern::new(
            "process_down",
            PatternSeverity::Low,
            Matcher::ProcessDown,
            Arc::new(remedy::RestartDaemon),
        ));
        lib
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Gathers an [`Observation`] for one daemon.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(
        &self,
        descriptor: &DaemonDescriptor,
        handle: &dyn DaemonHandle,
        crash_loop_count: u32,
    ) -> Observation;
}

/// Real-system observer: probes the daemon and inspects the filesystem
/// artifacts the descriptor declares.
#[derive(Debug)]
pub struct SystemObserver {
    /// Volume whose free space is measured.
    data_dir: std::path::PathBuf,
}

impl SystemObserver {
    pub fn new(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn file_age(path: &std::path::Path) -> (Option<Duration>, bool) {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok());
                (age, false)
            }
            Err(e) => (None, e.kind() == std::io::ErrorKind::PermissionDenied),
        }
    }

    fn port_is_held(port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_err()
    }
}

#[async_trait]
impl Observer for SystemObserver {
    async fn observe(
        &self,
        descriptor: &DaemonDescriptor,
        handle: &dyn DaemonHandle,
        crash_loop_count: u32,
    ) -> Observation {
        let liveness = handle.probe().await;
        let (process_alive, probe_reason) = match liveness {
            Liveness::Available => (true, None),
            Liveness::Unavailable { reason } => (false, Some(reason)),
        };

        let mut permission_error = probe_reason
            .as_deref()
            .map(|r| r.contains("permission denied"))
            .unwrap_or(false);

        let lock_file_age = descriptor.lock_file.as_ref().and_then(|path| {
            let (age, perm) = Self::file_age(path);
            permission_error |= perm;
            age
        });

        let export_age = descriptor.export_file.as_ref().and_then(|path| {
            let (age, perm) = Self::file_age(path);
            permission_error |= perm;
            age
        });

        // Only meaningful when the daemon is down: a live daemon is
        // expected to hold its own port.
        let port_conflict = !process_alive
            && descriptor
                .port
                .map(Self::port_is_held)
                .unwrap_or(false);

        let socket_healthy = match (&descriptor.liveness, process_alive) {
            (LivenessProbe::TcpConnect(_), alive) => Some(alive),
            _ => None,
        };

        Observation {
            daemon: descriptor.name.clone(),
            process_alive,
            probe_reason,
            port_conflict,
            lock_file_age,
            disk_free_bytes: disk_free(&self.data_dir),
            export_age,
            socket_healthy,
            crash_loop_count,
            permission_error,
            observed_at: Utc::now(),
        }
    }
}

/// Free disk space for a path in bytes, `None` if it cannot be measured.
#[cfg(unix)]
pub fn disk_free(path: &std::path::Path) -> Option<u64> {
    use std::mem::MaybeUninit;

    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: c_path is a valid NUL-terminated string and stat is a valid
    // out-pointer for the duration of the call.
    #[allow(unsafe_code)]
    let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };

    if result == 0 {
        #[allow(unsafe_code)]
        let stat = unsafe { stat.assume_init() };
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
pub fn disk_free(_path: &std::path::Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins_in_declaration_order() {
        let mut lib = FailurePatternLibrary::new();
        lib.register(FailurePattern::new(
            "stale_lock",
            PatternSeverity::High,
            Matcher::StaleLock {
                max_age: Duration::from_secs(60),
            },
            Arc::new(remedy::ClearStaleLock),
        ))
        .register(FailurePattern::new(
            "process_down",
            PatternSeverity::Low,
            Matcher::ProcessDown,
            Arc::new(remedy::RestartDaemon),
        ));

        // Both conditions true: lock is stale AND process is down.
        let mut obs = Observation::healthy("sync");
        obs.process_alive = false;
        obs.lock_file_age = Some(Duration::from_secs(7_200));

        let matched = lib.match_first(&obs).unwrap();
        assert_eq!(matched.id, "stale_lock");
    }

    #[test]
    fn no_match_on_healthy_observation() {
        let lib = FailurePatternLibrary::standard();
        let obs = Observation::healthy("exporter");
        assert!(lib.match_first(&obs).is_none());
    }

    #[test]
    fn standard_library_matches_disk_full_before_process_down() {
        let lib = FailurePatternLibrary::standard();
        let mut obs = Observation::healthy("exporter");
        obs.process_alive = false;
        obs.disk_free_bytes = Some(0);

        let matched = lib.match_first(&obs).unwrap();
        assert_eq!(matched.id, "disk_full");
    }

    #[test]
    fn custom_matcher_extends_the_registry() {
        let mut lib = FailurePatternLibrary::new();
        lib.register(FailurePattern::new(
            "synthetic",
            PatternSeverity::Medium,
            Matcher::Custom(Arc::new(|obs| obs.daemon == "flaky")),
            Arc::new(remedy::RestartDaemon),
        ));

        assert!(lib.match_first(&Observation::healthy("flaky")).is_some());
        assert!(lib.match_first(&Observation::healthy("steady")).is_none());
    }

    #[test]
    fn disk_free_reports_something_for_tmp() {
        assert!(disk_free(std::path::Path::new("/tmp")).is_some());
    }
}
