//! Shared per-daemon runtime state.
//!
//! One explicit state store, passed by reference to the watchdog, the
//! healer, and the API. Access is serialized per daemon through the remedy
//! token rather than a global lock, so unrelated daemons heal fully
//! concurrently. The map itself is only ever held for short bookkeeping
//! sections — never across a probe, restart, or remedy.

use crate::supervisor::daemon::{DaemonDescriptor, DaemonHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

/// Supervision state machine for one daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DaemonState {
    Healthy,
    Suspect,
    Remediating,
    Verifying,
    Degraded,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Healthy => write!(f, "Healthy"),
            DaemonState::Suspect => write!(f, "Suspect"),
            DaemonState::Remediating => write!(f, "Remediating"),
            DaemonState::Verifying => write!(f, "Verifying"),
            DaemonState::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Consecutive-failure bookkeeping for one daemon.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EscalationState {
    /// Failed remedy verifications in a row.
    pub consecutive_failures: u32,
    /// Latched on threshold; only a manual clear resets it.
    pub degraded: bool,
}

/// Point-in-time view of one daemon for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonSnapshot {
    pub name: String,
    pub state: DaemonState,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub watchdog_failures: u32,
    pub last_transition: DateTime<Utc>,
}

struct DaemonRuntime {
    descriptor: DaemonDescriptor,
    handle: Arc<dyn DaemonHandle>,
    state: DaemonState,
    escalation: EscalationState,
    /// Consecutive failed watchdog restart cycles.
    watchdog_failures: u32,
    last_transition: DateTime<Utc>,
    /// Held for the full Remediating -> Verifying span; also taken by the
    /// watchdog's restart path. The only cross-cutting lock in the design.
    remedy_token: Arc<Mutex<()>>,
}

/// Registry of every supervised daemon's runtime state.
#[derive(Default)]
pub struct SupervisorState {
    daemons: RwLock<HashMap<String, DaemonRuntime>>,
}

impl SupervisorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a daemon. Called once at startup per descriptor.
    pub async fn insert(&self, descriptor: DaemonDescriptor, handle: Arc<dyn DaemonHandle>) {
        let name = descriptor.name.clone();
        let runtime = DaemonRuntime {
            descriptor,
            handle,
            state: DaemonState::Healthy,
            escalation: EscalationState::default(),
            watchdog_failures: 0,
            last_transition: Utc::now(),
            remedy_token: Arc::new(Mutex::new(())),
        };
        self.daemons.write().await.insert(name, runtime);
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.daemons.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn daemon_count(&self) -> usize {
        self.daemons.read().await.len()
    }

    /// Descriptor and handle clones for out-of-lock work.
    pub async fn parts(&self, name: &str) -> Option<(DaemonDescriptor, Arc<dyn DaemonHandle>)> {
        let daemons = self.daemons.read().await;
        daemons
            .get(name)
            .map(|rt| (rt.descriptor.clone(), Arc::clone(&rt.handle)))
    }

    pub async fn state_of(&self, name: &str) -> Option<DaemonState> {
        self.daemons.read().await.get(name).map(|rt| rt.state)
    }

    pub async fn escalation_of(&self, name: &str) -> Option<EscalationState> {
        self.daemons.read().await.get(name).map(|rt| rt.escalation)
    }

    pub async fn watchdog_failures(&self, name: &str) -> u32 {
        self.daemons
            .read()
            .await
            .get(name)
            .map(|rt| rt.watchdog_failures)
            .unwrap_or(0)
    }

    /// Transition a daemon's state machine.
    pub async fn set_state(&self, name: &str, state: DaemonState) {
        if let Some(rt) = self.daemons.write().await.get_mut(name) {
            if rt.state != state {
                info!(daemon = %name, from = %rt.state, to = %state, "Daemon state transition");
                rt.state = state;
                rt.last_transition = Utc::now();
            }
        }
    }

    /// Try to take the per-daemon remedy token without waiting.
    ///
    /// `None` means a remedy (or watchdog restart) is already in flight for
    /// this daemon — the caller skips rather than queues, so concurrent
    /// triggers can never double-apply.
    pub async fn try_acquire_remedy_token(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        let token = {
            let daemons = self.daemons.read().await;
            Arc::clone(&daemons.get(name)?.remedy_token)
        };
        token.try_lock_owned().ok()
    }

    /// Record a verified remedy success: counters reset, state Healthy.
    pub async fn record_remedy_success(&self, name: &str) {
        if let Some(rt) = self.daemons.write().await.get_mut(name) {
            rt.escalation.consecutive_failures = 0;
            rt.watchdog_failures = 0;
            rt.state = DaemonState::Healthy;
            rt.last_transition = Utc::now();
        }
    }

    /// Record a failed remedy verification. Latches Degraded at the
    /// threshold and reports the updated escalation state.
    pub async fn record_remedy_failure(&self, name: &str, threshold: u32) -> EscalationState {
        let mut daemons = self.daemons.write().await;
        let Some(rt) = daemons.get_mut(name) else {
            return EscalationState::default();
        };
        rt.escalation.consecutive_failures += 1;
        if rt.escalation.consecutive_failures >= threshold {
            rt.escalation.degraded = true;
            rt.state = DaemonState::Degraded;
            warn!(
                daemon = %name,
                failures = rt.escalation.consecutive_failures,
                "Escalation threshold reached — daemon Degraded, automatic remediation halted"
            );
        } else {
            rt.state = DaemonState::Suspect;
        }
        rt.last_transition = Utc::now();
        rt.escalation
    }

    /// Record one failed watchdog cycle; returns the consecutive count.
    pub async fn record_watchdog_failure(&self, name: &str) -> u32 {
        let mut daemons = self.daemons.write().await;
        match daemons.get_mut(name) {
            Some(rt) => {
                rt.watchdog_failures += 1;
                rt.watchdog_failures
            }
            None => 0,
        }
    }

    /// Reset the watchdog failure streak after a successful probe/restart.
    pub async fn reset_watchdog_failures(&self, name: &str) {
        if let Some(rt) = self.daemons.write().await.get_mut(name) {
            rt.watchdog_failures = 0;
        }
    }

    /// The external manual action that unlatches Degraded.
    ///
    /// The daemon comes back as Suspect, not Healthy: the next scan must
    /// re-verify the condition before the fleet trusts it again.
    pub async fn clear_degraded(&self, name: &str) -> bool {
        let mut daemons = self.daemons.write().await;
        let Some(rt) = daemons.get_mut(name) else {
            return false;
        };
        if !rt.escalation.degraded {
            return false;
        }
        rt.escalation.degraded = false;
        rt.escalation.consecutive_failures = 0;
        rt.watchdog_failures = 0;
        rt.state = DaemonState::Suspect;
        rt.last_transition = Utc::now();
        info!(daemon = %name, "Degraded latch manually cleared");
        true
    }

    /// Snapshot for the health endpoint — always the true last-known state.
    pub async fn snapshot(&self) -> Vec<DaemonSnapshot> {
        let daemons = self.daemons.read().await;
        let mut snapshots: Vec<DaemonSnapshot> = daemons
            .values()
            .map(|rt| DaemonSnapshot {
                name: rt.descriptor.name.clone(),
                state: rt.state,
                consecutive_failures: rt.escalation.consecutive_failures,
                degraded: rt.escalation.degraded,
                watchdog_failures: rt.watchdog_failures,
                last_transition: rt.last_transition,
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::daemon::{Liveness, LivenessProbe, RestartPolicy};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullDaemon;

    #[async_trait]
    impl DaemonHandle for NullDaemon {
        fn name(&self) -> &str {
            "null"
        }
        async fn probe(&self) -> Liveness {
            Liveness::Available
        }
        async fn restart(&self) -> Result<()> {
            Ok(())
        }
    }

    fn descriptor(name: &str) -> DaemonDescriptor {
        DaemonDescriptor {
            name: name.to_string(),
            start_command: vec!["/bin/true".to_string()],
            liveness: LivenessProbe::PidFile("/tmp/x.pid".into()),
            restart: RestartPolicy {
                max_attempts: 2,
                grace: Duration::from_millis(1),
            },
            lock_file: None,
            export_file: None,
            port: None,
        }
    }

    async fn seeded() -> SupervisorState {
        let state = SupervisorState::new();
        state
            .insert(descriptor("exporter"), Arc::new(NullDaemon))
            .await;
        state
    }

    #[tokio::test]
    async fn remedy_token_excludes_concurrent_holders() {
        let state = seeded().await;

        let guard = state.try_acquire_remedy_token("exporter").await;
        assert!(guard.is_some());
        assert!(state.try_acquire_remedy_token("exporter").await.is_none());

        drop(guard);
        assert!(state.try_acquire_remedy_token("exporter").await.is_some());
    }

    #[tokio::test]
    async fn failure_threshold_latches_degraded() {
        let state = seeded().await;

        for expected in 1..=2u32 {
            let esc = state.record_remedy_failure("exporter", 3).await;
            assert_eq!(esc.consecutive_failures, expected);
            assert!(!esc.degraded);
            assert_eq!(
                state.state_of("exporter").await,
                Some(DaemonState::Suspect)
            );
        }

        let esc = state.record_remedy_failure("exporter", 3).await;
        assert!(esc.degraded);
        assert_eq!(
            state.state_of("exporter").await,
            Some(DaemonState::Degraded)
        );
    }

    #[tokio::test]
    async fn verified_success_resets_escalation() {
        let state = seeded().await;
        state.record_remedy_failure("exporter", 3).await;
        state.record_remedy_success("exporter").await;

        let esc = state.escalation_of("exporter").await.unwrap();
        assert_eq!(esc.consecutive_failures, 0);
        assert_eq!(
            state.state_of("exporter").await,
            Some(DaemonState::Healthy)
        );
    }

    #[tokio::test]
    async fn manual_clear_returns_daemon_as_suspect() {
        let state = seeded().await;
        for _ in 0..3 {
            state.record_remedy_failure("exporter", 3).await;
        }
        assert_eq!(
            state.state_of("exporter").await,
            Some(DaemonState::Degraded)
        );

        assert!(state.clear_degraded("exporter").await);
        assert_eq!(
            state.state_of("exporter").await,
            Some(DaemonState::Suspect)
        );
        assert!(!state.escalation_of("exporter").await.unwrap().degraded);

        // Clearing a non-degraded daemon is a no-op.
        assert!(!state.clear_degraded("exporter").await);
    }
}
