//! Process watchdog — the fast, cheap recovery path.
//!
//! Probes every supervised daemon on a short cadence and restarts crashed
//! processes directly, without consulting the pattern library. A daemon
//! that keeps failing plain restarts is handed to the self-heal supervisor
//! for an out-of-cycle deep scan instead of being restart-looped: a bare
//! restart cannot fix a stale lock, a full disk, or a corrupted export.

use crate::eventlog::{EventLog, RecoveryEvent};
use crate::supervisor::state::{DaemonState, SupervisorState};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fast-cadence liveness loop over the daemon fleet.
pub struct ProcessWatchdog {
    state: Arc<SupervisorState>,
    event_log: Arc<EventLog>,
    /// Escalation handoff to the self-heal supervisor.
    escalation_tx: mpsc::Sender<String>,
    interval: Duration,
    escalation_threshold: u32,
}

impl ProcessWatchdog {
    pub fn new(
        state: Arc<SupervisorState>,
        event_log: Arc<EventLog>,
        escalation_tx: mpsc::Sender<String>,
        interval: Duration,
        escalation_threshold: u32,
    ) -> Self {
        Self {
            state,
            event_log,
            escalation_tx,
            interval,
            escalation_threshold,
        }
    }

    /// Run the sweep loop until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Process watchdog started"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Process watchdog shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Probe every daemon once. Daemons mid-remedy or Degraded are skipped;
    /// one daemon's slow restart never delays another's check beyond this
    /// sweep's sequential order.
    pub async fn sweep(&self) {
        for name in self.state.names().await {
            self.check_daemon(&name).await;
        }
    }

    /// Probe one daemon and restart it if dead.
    pub async fn check_daemon(&self, name: &str) {
        match self.state.state_of(name).await {
            // The healer owns these states; a restart here would race the
            // in-flight remedy.
            Some(DaemonState::Remediating) | Some(DaemonState::Verifying) => return,
            // Degraded stays down until manually cleared.
            Some(DaemonState::Degraded) => return,
            Some(_) => {}
            None => return,
        }

        let Some((descriptor, handle)) = self.state.parts(name).await else {
            return;
        };

        // Same token the healer holds across a remedy; skip if busy.
        let Some(_token) = self.state.try_acquire_remedy_token(name).await else {
            debug!(daemon = %name, "Remedy in flight — watchdog skipping");
            return;
        };

        if handle.probe().await.is_available() {
            self.state.reset_watchdog_failures(name).await;
            if self.state.state_of(name).await == Some(DaemonState::Suspect) {
                // Recovered without our help; reflect reality.
                self.state.set_state(name, DaemonState::Healthy).await;
            }
            return;
        }

        warn!(daemon = %name, "Liveness probe failed — attempting restart");
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut recovered = false;

        while attempts < descriptor.restart.max_attempts {
            attempts += 1;
            if let Err(e) = handle.restart().await {
                warn!(daemon = %name, attempt = attempts, error = %e, "Restart command failed");
                continue;
            }
            tokio::time::sleep(descriptor.restart.grace).await;
            if handle.probe().await.is_available() {
                recovered = true;
                break;
            }
        }

        let event = RecoveryEvent {
            timestamp: Utc::now(),
            daemon: name.to_string(),
            strategy: "restart".to_string(),
            attempts,
            time_to_recover_ms: started.elapsed().as_millis() as u64,
            success: recovered,
        };
        if let Err(e) = self.event_log.append_recovery(&event) {
            warn!(daemon = %name, error = %e, "Failed to append recovery event");
        }

        if recovered {
            info!(
                daemon = %name,
                attempts,
                elapsed_ms = event.time_to_recover_ms,
                "Daemon recovered by restart"
            );
            self.state.reset_watchdog_failures(name).await;
            self.state.set_state(name, DaemonState::Healthy).await;
            return;
        }

        let failures = self.state.record_watchdog_failure(name).await;
        self.state.set_state(name, DaemonState::Suspect).await;

        if failures >= self.escalation_threshold {
            warn!(
                daemon = %name,
                failures,
                "Restart attempts keep failing — escalating to deep scan"
            );
            // Reset the streak so a slow healer does not get one handoff
            // per sweep for the same condition.
            self.state.reset_watchdog_failures(name).await;
            if self.escalation_tx.send(name.to_string()).await.is_err() {
                warn!(daemon = %name, "Healer channel closed — escalation dropped");
            }
        }
    }
}
