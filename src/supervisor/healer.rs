//! Self-heal supervisor — the slow, deep diagnosis path.
//!
//! On a long cadence (plus out-of-cycle triggers from the watchdog) each
//! daemon is observed, classified against the failure pattern library, and
//! remediated through the per-daemon state machine:
//!
//! `Healthy -> Suspect -> Remediating -> Verifying -> {Healthy | Degraded}`
//!
//! The remedy token is held for the whole Remediating -> Verifying span,
//! so a watchdog escalation firing while a scheduled scan is mid-remedy
//! can never double-apply. Three failed verifications latch the daemon
//! Degraded and automatic remediation stops until an operator clears it.

use crate::eventlog::{EventLog, HealEvent};
use crate::supervisor::patterns::{FailurePatternLibrary, Observer};
use crate::supervisor::remedy::RemedyContext;
use crate::supervisor::state::{DaemonState, SupervisorState};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one scan of one daemon did. Returned for tests and logging; the
/// durable record is the HealEvent stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Daemon not in the registry.
    Missing,
    /// Degraded latch set — automatic remediation halted.
    SkippedDegraded,
    /// A remedy is already in flight for this daemon.
    SkippedBusy,
    /// No pattern matched and the daemon is alive.
    Healthy,
    /// Failing, but no pattern matched — surfaced, nothing applied.
    Unresolved,
    /// Remedy applied and the condition verified fixed.
    Healed,
    /// Remedy applied but the condition persists.
    RemedyFailed { failures: u32 },
    /// This failure crossed the escalation threshold.
    Degraded,
}

/// Slow-cadence deep scan loop with pattern-matched remediation.
pub struct SelfHealSupervisor {
    state: Arc<SupervisorState>,
    library: Arc<FailurePatternLibrary>,
    observer: Arc<dyn Observer>,
    event_log: Arc<EventLog>,
    base_interval: Duration,
    jitter: Duration,
    escalation_threshold: u32,
}

impl SelfHealSupervisor {
    pub fn new(
        state: Arc<SupervisorState>,
        library: Arc<FailurePatternLibrary>,
        observer: Arc<dyn Observer>,
        event_log: Arc<EventLog>,
        base_interval: Duration,
        jitter: Duration,
        escalation_threshold: u32,
    ) -> Self {
        Self {
            state,
            library,
            observer,
            event_log,
            base_interval,
            jitter,
            escalation_threshold,
        }
    }

    /// Run scheduled deep scans and serve watchdog escalations until
    /// cancelled. A cancellation observed mid-scan lets the in-flight
    /// remedy finish — partial remedies can leave worse state than the
    /// failure they were fixing.
    pub async fn run(self, mut escalation_rx: mpsc::Receiver<String>, cancel: CancellationToken) {
        info!(
            patterns = self.library.len(),
            interval_secs = self.base_interval.as_secs(),
            "Self-heal supervisor started"
        );

        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Self-heal supervisor shutting down");
                    return;
                }
                _ = tokio::time::sleep(delay) => {
                    self.deep_scan().await;
                }
                handoff = escalation_rx.recv() => {
                    match handoff {
                        Some(name) => {
                            info!(daemon = %name, "Watchdog escalation — out-of-cycle deep scan");
                            self.scan_daemon(&name).await;
                        }
                        None => {
                            info!("Escalation channel closed — self-heal supervisor exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base_interval;
        }
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=self.jitter);
        self.base_interval + jitter
    }

    /// Scan the whole fleet once.
    pub async fn deep_scan(&self) {
        let names = self.state.names().await;
        debug!(daemons = names.len(), "Deep scan starting");
        for name in names {
            self.scan_daemon(&name).await;
        }
    }

    /// Run the full state machine for one daemon.
    pub async fn scan_daemon(&self, name: &str) -> ScanOutcome {
        let Some((descriptor, handle)) = self.state.parts(name).await else {
            return ScanOutcome::Missing;
        };

        let escalation = self.state.escalation_of(name).await.unwrap_or_default();
        if escalation.degraded {
            debug!(daemon = %name, "Degraded — skipping automatic remediation");
            return ScanOutcome::SkippedDegraded;
        }

        if matches!(
            self.state.state_of(name).await,
            Some(DaemonState::Remediating) | Some(DaemonState::Verifying)
        ) {
            debug!(daemon = %name, "Remedy already in flight — skipping");
            return ScanOutcome::SkippedBusy;
        }

        let crash_loops = self.state.watchdog_failures(name).await;
        let observation = self
            .observer
            .observe(&descriptor, handle.as_ref(), crash_loops)
            .await;

        let Some(pattern) = self.library.match_first(&observation) else {
            if observation.process_alive {
                if self.state.state_of(name).await == Some(DaemonState::Suspect) {
                    self.state.set_state(name, DaemonState::Healthy).await;
                }
                return ScanOutcome::Healthy;
            }
            warn!(
                daemon = %name,
                reason = observation.probe_reason.as_deref().unwrap_or("unknown"),
                "Daemon failing but no pattern matched — unresolved, no remedy attempted"
            );
            self.state.set_state(name, DaemonState::Suspect).await;
            return ScanOutcome::Unresolved;
        };

        // Exclusivity for the full Remediating -> Verifying span. A holder
        // means another trigger got here first: skip, never queue behind it.
        // Taken before the Suspect transition so a losing trigger cannot
        // rewind the winner's state machine.
        let Some(_token) = self.state.try_acquire_remedy_token(name).await else {
            debug!(daemon = %name, "Remedy already in flight — skipping");
            return ScanOutcome::SkippedBusy;
        };

        self.state.set_state(name, DaemonState::Suspect).await;

        info!(
            daemon = %name,
            pattern = %pattern.id,
            severity = %pattern.severity,
            remedy = pattern.remedy.name(),
            "Failure pattern matched — applying remedy"
        );

        self.state.set_state(name, DaemonState::Remediating).await;
        let started = Instant::now();
        let ctx = RemedyContext {
            descriptor: &descriptor,
            handle: handle.as_ref(),
            observation: &observation,
        };
        // Command failure is not condition failure; verification decides.
        if let Err(e) = pattern.remedy.apply(&ctx).await {
            warn!(daemon = %name, remedy = pattern.remedy.name(), error = %e, "Remedy command failed");
        }

        self.state.set_state(name, DaemonState::Verifying).await;
        let verification = self
            .observer
            .observe(&descriptor, handle.as_ref(), 0)
            .await;
        let still_failing = pattern.matcher.matches(&verification);
        let duration_ms = started.elapsed().as_millis() as u64;

        let (success, outcome) = if still_failing {
            let escalation = self
                .state
                .record_remedy_failure(name, self.escalation_threshold)
                .await;
            let outcome = if escalation.degraded {
                ScanOutcome::Degraded
            } else {
                ScanOutcome::RemedyFailed {
                    failures: escalation.consecutive_failures,
                }
            };
            (false, outcome)
        } else {
            info!(
                daemon = %name,
                pattern = %pattern.id,
                elapsed_ms = duration_ms,
                "Remedy verified — daemon healthy"
            );
            self.state.record_remedy_success(name).await;
            (true, ScanOutcome::Healed)
        };

        let event = HealEvent {
            timestamp: Utc::now(),
            daemon: name.to_string(),
            pattern_id: pattern.id.clone(),
            remedy_applied: pattern.remedy.name().to_string(),
            success,
            duration_ms,
            severity: pattern.severity,
        };
        if let Err(e) = self.event_log.append_heal(&event) {
            warn!(daemon = %name, error = %e, "Failed to append heal event");
        }

        outcome
    }
}
