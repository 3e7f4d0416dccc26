//! Change detector — fixed-cadence polling loop over the store.
//!
//! Every tick the detector recomputes the group fingerprints, diffs them
//! against the previous cycle, and emits one [`ChangeEvent`] naming the
//! groups that moved. Writer contention is retried a bounded number of
//! times inside the tick; on exhaustion the cycle is skipped and counted,
//! never blocking past the tick and never touching the store with a write.

use crate::config::StreamConfig;
use crate::store::{Store, StoreError};
use crate::stream::fingerprint::{Fingerprint, Fingerprinter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A detected store delta.
///
/// Consumed exactly once by the broadcaster; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    /// Monotonically increasing, gap-free as emitted.
    pub sequence: u64,
    /// Logical entity groups whose fingerprints moved, so consumers can
    /// re-fetch partially instead of re-reading everything.
    pub changed_groups: Vec<String>,
    pub emitted_at: DateTime<Utc>,
}

/// Shared detector counters for the health endpoint.
#[derive(Debug, Default)]
pub struct DetectorStats {
    last_sequence: AtomicU64,
    missed_cycles: AtomicU64,
    completed_cycles: AtomicU64,
}

impl DetectorStats {
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Relaxed)
    }

    pub fn missed_cycles(&self) -> u64 {
        self.missed_cycles.load(Ordering::Relaxed)
    }

    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles.load(Ordering::Relaxed)
    }
}

/// Fixed-cadence change detection loop.
pub struct ChangeDetector {
    store: Store,
    fingerprinter: Arc<Fingerprinter>,
    poll_interval: Duration,
    busy_retries: u32,
    busy_backoff: Duration,
    stats: Arc<DetectorStats>,
    tx: mpsc::Sender<ChangeEvent>,
    previous: Option<HashMap<String, Fingerprint>>,
    sequence: u64,
}

impl ChangeDetector {
    pub fn new(
        store: Store,
        fingerprinter: Fingerprinter,
        config: &StreamConfig,
        tx: mpsc::Sender<ChangeEvent>,
    ) -> (Self, Arc<DetectorStats>) {
        let stats = Arc::new(DetectorStats::default());
        let detector = Self {
            store,
            fingerprinter: Arc::new(fingerprinter),
            poll_interval: config.poll_interval(),
            busy_retries: config.busy_retries,
            busy_backoff: config.busy_backoff(),
            stats: Arc::clone(&stats),
            tx,
            previous: None,
            sequence: 0,
        };
        (detector, stats)
    }

    /// Run the polling loop until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        if self.fingerprinter.is_empty() {
            warn!("No query groups configured — change detection is idle");
        }

        info!(
            interval_secs = self.poll_interval.as_secs(),
            "Change detector started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        sequence = self.sequence,
                        missed = self.stats.missed_cycles(),
                        "Change detector shutting down"
                    );
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Run one poll cycle: fingerprint, diff, emit on delta.
    pub async fn tick(&mut self) {
        let Some(current) = self.compute_with_retry().await else {
            self.stats.missed_cycles.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.stats.completed_cycles.fetch_add(1, Ordering::Relaxed);

        let changed = match &self.previous {
            // First successful cycle establishes the baseline; a delta needs
            // a prior cycle to be a delta against.
            None => Vec::new(),
            Some(previous) => {
                let mut changed: Vec<String> = current
                    .iter()
                    .filter(|(name, digest)| previous.get(*name) != Some(digest))
                    .map(|(name, _)| name.clone())
                    .collect();
                changed.sort();
                changed
            }
        };

        let is_baseline = self.previous.is_none();
        self.previous = Some(current);

        if is_baseline || changed.is_empty() {
            return;
        }

        self.sequence += 1;
        self.stats
            .last_sequence
            .store(self.sequence, Ordering::Relaxed);

        let event = ChangeEvent {
            sequence: self.sequence,
            changed_groups: changed,
            emitted_at: Utc::now(),
        };
        debug!(
            sequence = event.sequence,
            groups = ?event.changed_groups,
            "Store change detected"
        );

        if self.tx.send(event).await.is_err() {
            warn!("Broadcaster channel closed — dropping change event");
        }
    }

    /// Compute fingerprints, retrying busy errors with short backoff inside
    /// this tick only. Returns `None` when the cycle must be skipped.
    async fn compute_with_retry(&self) -> Option<HashMap<String, Fingerprint>> {
        let mut attempt = 0u32;
        loop {
            let store = self.store.clone();
            let fingerprinter = Arc::clone(&self.fingerprinter);
            let result = tokio::task::spawn_blocking(move || {
                let conn = store.open_read()?;
                fingerprinter.compute(&conn)
            })
            .await;

            match result {
                Ok(Ok(fingerprints)) => return Some(fingerprints),
                Ok(Err(StoreError::Busy(e))) if attempt < self.busy_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "Store busy, retrying within tick");
                    tokio::time::sleep(self.busy_backoff).await;
                }
                Ok(Err(StoreError::Busy(e))) => {
                    warn!(error = %e, "Store busy after {} retries — skipping cycle", attempt);
                    return None;
                }
                Ok(Err(StoreError::Sqlite(e))) => {
                    warn!(error = %e, "Store read failed — skipping cycle");
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "Fingerprint task failed — skipping cycle");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::fingerprint::QueryGroup;
    use rusqlite::Connection;

    fn seeded_store(dir: &tempfile::TempDir) -> Store {
        let path = dir.path().join("store.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sessions (id INTEGER PRIMARY KEY, outcome TEXT);
             INSERT INTO sessions (id, outcome) VALUES (1, 'ok');",
        )
        .unwrap();
        Store::new(&path)
    }

    fn detector(
        store: Store,
    ) -> (
        ChangeDetector,
        Arc<DetectorStats>,
        mpsc::Receiver<ChangeEvent>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let fingerprinter = Fingerprinter::new(vec![QueryGroup {
            name: "sessions".to_string(),
            queries: vec!["SELECT id, outcome FROM sessions ORDER BY id".to_string()],
        }]);
        let (detector, stats) =
            ChangeDetector::new(store, fingerprinter, &StreamConfig::default(), tx);
        (detector, stats, rx)
    }

    #[tokio::test]
    async fn baseline_then_idempotent_ticks_emit_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir);
        let (mut det, stats, mut rx) = detector(store);

        det.tick().await;
        det.tick().await;
        det.tick().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(stats.last_sequence(), 0);
        assert_eq!(stats.completed_cycles(), 3);
    }

    #[tokio::test]
    async fn mutation_between_ticks_emits_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir);
        let (mut det, stats, mut rx) = detector(store.clone());

        det.tick().await;

        let writer = Connection::open(store.path()).unwrap();
        writer
            .execute("INSERT INTO sessions (id, outcome) VALUES (2, 'failed')", [])
            .unwrap();

        det.tick().await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(event.changed_groups, vec!["sessions".to_string()]);
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.last_sequence(), 1);

        // No further mutation: no further event.
        det.tick().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sequence_numbers_are_gap_free() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir);
        let (mut det, _stats, mut rx) = detector(store.clone());

        det.tick().await;

        let writer = Connection::open(store.path()).unwrap();
        for i in 2..=5 {
            writer
                .execute(
                    "INSERT INTO sessions (id, outcome) VALUES (?1, 'ok')",
                    [i as i64],
                )
                .unwrap();
            det.tick().await;
        }

        let mut expected = 1u64;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.sequence, expected);
            expected += 1;
        }
        assert_eq!(expected, 5);
    }

    #[tokio::test]
    async fn unreadable_store_skips_cycle_without_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("missing.db"));
        let (tx, mut rx) = mpsc::channel(16);
        let fingerprinter = Fingerprinter::new(vec![QueryGroup {
            name: "sessions".to_string(),
            queries: vec!["SELECT 1".to_string()],
        }]);
        let (mut det, stats) =
            ChangeDetector::new(store, fingerprinter, &StreamConfig::default(), tx);

        det.tick().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(stats.missed_cycles(), 1);
    }
}
