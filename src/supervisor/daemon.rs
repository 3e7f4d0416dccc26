//! Supervised daemon descriptors and the process-control seam.
//!
//! A [`DaemonDescriptor`] is the declarative record from the config file:
//! identity, start command, liveness probe, restart policy, and the
//! filesystem artifacts (lock file, export file, port) the failure
//! patterns observe. How a process is actually probed and restarted sits
//! behind the [`DaemonHandle`] trait so tests can supervise fakes.

use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Result of a liveness probe. Probes must be side-effect free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Available,
    Unavailable { reason: String },
}

impl Liveness {
    pub fn is_available(&self) -> bool {
        matches!(self, Liveness::Available)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Liveness::Unavailable {
            reason: reason.into(),
        }
    }
}

/// How a daemon's liveness is checked.
#[derive(Debug, Clone)]
pub enum LivenessProbe {
    /// Pid file whose PID must refer to a live process.
    PidFile(PathBuf),
    /// TCP endpoint that must accept a connection.
    TcpConnect(String),
}

/// Restart behaviour for the watchdog's fast path.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restart attempts within one watchdog cycle.
    pub max_attempts: u32,
    /// Wait after issuing a restart before re-probing.
    pub grace: Duration,
}

/// One supervised daemon, declared at startup and immutable during the run.
#[derive(Debug, Clone)]
pub struct DaemonDescriptor {
    pub name: String,
    pub start_command: Vec<String>,
    pub liveness: LivenessProbe,
    pub restart: RestartPolicy,
    /// Lock file the daemon takes while working; a stale one is a known
    /// failure pattern.
    pub lock_file: Option<PathBuf>,
    /// Export file the daemon is expected to refresh on schedule.
    pub export_file: Option<PathBuf>,
    /// Port the daemon must be able to bind.
    pub port: Option<u16>,
}

impl DaemonDescriptor {
    pub fn from_config(cfg: &DaemonConfig) -> Self {
        let liveness = match (&cfg.pid_file, &cfg.probe_addr) {
            (Some(pid_file), _) => LivenessProbe::PidFile(pid_file.clone()),
            (None, Some(addr)) => LivenessProbe::TcpConnect(addr.clone()),
            // No probe declared: fall back to the conventional pid path.
            (None, None) => LivenessProbe::PidFile(PathBuf::from(format!(
                "/tmp/{}.pid",
                cfg.name
            ))),
        };
        Self {
            name: cfg.name.clone(),
            start_command: cfg.start_command.clone(),
            liveness,
            restart: RestartPolicy {
                max_attempts: cfg.restart_max_attempts,
                grace: Duration::from_millis(cfg.restart_grace_ms),
            },
            lock_file: cfg.lock_file.clone(),
            export_file: cfg.export_file.clone(),
            port: cfg.port,
        }
    }
}

/// Probe and restart operations for one daemon.
///
/// The watchdog and remedy layer call through this trait; the default
/// implementation drives real processes, tests drive fakes.
#[async_trait]
pub trait DaemonHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Check liveness without side effects.
    async fn probe(&self) -> Liveness;

    /// Start or restart the daemon. Idempotent against an already-running
    /// daemon: starting twice must be benign.
    async fn restart(&self) -> Result<()>;
}

/// Process-backed daemon control using the descriptor's start command and
/// liveness probe.
#[derive(Debug)]
pub struct ProcessDaemon {
    descriptor: DaemonDescriptor,
}

impl ProcessDaemon {
    pub fn new(descriptor: DaemonDescriptor) -> Self {
        Self { descriptor }
    }

    fn pid_is_alive(pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{}", pid)).exists()
    }
}

#[async_trait]
impl DaemonHandle for ProcessDaemon {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    async fn probe(&self) -> Liveness {
        match &self.descriptor.liveness {
            LivenessProbe::PidFile(path) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => match contents.trim().parse::<u32>() {
                    Ok(pid) if Self::pid_is_alive(pid) => Liveness::Available,
                    Ok(pid) => Liveness::unavailable(format!("pid {} not running", pid)),
                    Err(_) => Liveness::unavailable("pid file unparseable"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    Liveness::unavailable("permission denied reading pid file")
                }
                Err(_) => Liveness::unavailable("pid file missing"),
            },
            LivenessProbe::TcpConnect(addr) => {
                let connect = tokio::net::TcpStream::connect(addr);
                match tokio::time::timeout(Duration::from_secs(3), connect).await {
                    Ok(Ok(_)) => Liveness::Available,
                    Ok(Err(e)) => Liveness::unavailable(format!("connect failed: {}", e)),
                    Err(_) => Liveness::unavailable("connect timed out"),
                }
            }
        }
    }

    async fn restart(&self) -> Result<()> {
        let (program, args) = self
            .descriptor
            .start_command
            .split_first()
            .context("daemon has an empty start command")?;

        debug!(daemon = %self.descriptor.name, program = %program, "Issuing start command");

        // The start command is expected to daemonize; the child handle is
        // released rather than awaited.
        tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start daemon '{}'", self.descriptor.name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;

    fn config() -> DaemonConfig {
        toml::from_str(
            r#"
            name = "exporter"
            start_command = ["/bin/true"]
            pid_file = "/tmp/exporter.pid"
        "#,
        )
        .unwrap()
    }

    #[test]
    fn descriptor_from_config_prefers_pid_file() {
        let descriptor = DaemonDescriptor::from_config(&config());
        assert_eq!(descriptor.name, "exporter");
        assert!(matches!(descriptor.liveness, LivenessProbe::PidFile(_)));
    }

    #[tokio::test]
    async fn missing_pid_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = DaemonDescriptor::from_config(&config());
        descriptor.liveness = LivenessProbe::PidFile(dir.path().join("nope.pid"));

        let daemon = ProcessDaemon::new(descriptor);
        assert!(!daemon.probe().await.is_available());
    }

    #[tokio::test]
    async fn own_pid_counts_as_alive() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("self.pid");
        std::fs::write(&pid_file, format!("{}\n", std::process::id())).unwrap();

        let mut descriptor = DaemonDescriptor::from_config(&config());
        descriptor.liveness = LivenessProbe::PidFile(pid_file);

        let daemon = ProcessDaemon::new(descriptor);
        assert!(daemon.probe().await.is_available());
    }

    #[tokio::test]
    async fn empty_start_command_is_an_error() {
        let mut descriptor = DaemonDescriptor::from_config(&config());
        descriptor.start_command = Vec::new();
        let daemon = ProcessDaemon::new(descriptor);
        assert!(daemon.restart().await.is_err());
    }
}
