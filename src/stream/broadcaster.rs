//! Event broadcaster — the single consumer of detector events.
//!
//! Serializes each change event once and offers the shared frame to every
//! client queue through the registry. On shutdown it pushes a final
//! notification so clients are closed explicitly rather than silently
//! dropped.

use crate::stream::detector::ChangeEvent;
use crate::stream::registry::{ClientRegistry, StreamFrame};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fan-out loop between the change detector and the client registry.
pub struct EventBroadcaster {
    registry: Arc<ClientRegistry>,
    rx: mpsc::Receiver<ChangeEvent>,
}

impl EventBroadcaster {
    pub fn new(registry: Arc<ClientRegistry>, rx: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { registry, rx }
    }

    /// Run until cancelled or the detector hangs up.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Event broadcaster started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close_clients("server shutting down");
                    return;
                }
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(event) => self.dispatch(event),
                        None => {
                            self.close_clients("event source closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Serialize once, fan out to every client.
    pub fn dispatch(&self, event: ChangeEvent) {
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to serialize change event");
                return;
            }
        };
        let frame = StreamFrame::new("change", data);
        let summary = self.registry.broadcast(&frame);
        debug!(
            sequence = event.sequence,
            delivered = summary.delivered,
            dropped_oldest = summary.dropped_oldest,
            disconnected = summary.disconnected,
            "Change event broadcast"
        );
    }

    fn close_clients(&self, reason: &str) {
        info!(reason, "Event broadcaster shutting down");
        let frame = StreamFrame::new("shutdown", format!("{{\"reason\":\"{}\"}}", reason));
        self.registry.shutdown(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(sequence: u64) -> ChangeEvent {
        ChangeEvent {
            sequence,
            changed_groups: vec!["sessions".to_string()],
            emitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_all_clients_in_order() {
        let registry = Arc::new(ClientRegistry::new(8, 3));
        let (_tx, rx) = mpsc::channel(8);
        let broadcaster = EventBroadcaster::new(Arc::clone(&registry), rx);

        let (_a, queue_a) = registry.register();
        let (_b, queue_b) = registry.register();

        broadcaster.dispatch(event(1));
        broadcaster.dispatch(event(2));

        for queue in [&queue_a, &queue_b] {
            let first = queue.next().await.unwrap();
            assert_eq!(first.event, "change");
            assert!(first.data.contains("\"sequence\":1"));
            let second = queue.next().await.unwrap();
            assert!(second.data.contains("\"sequence\":2"));
        }
    }

    #[tokio::test]
    async fn cancel_sends_final_shutdown_frame() {
        let registry = Arc::new(ClientRegistry::new(8, 3));
        let (tx, rx) = mpsc::channel(8);
        let broadcaster = EventBroadcaster::new(Arc::clone(&registry), rx);
        let (_id, queue) = registry.register();

        let cancel = CancellationToken::new();
        cancel.cancel();
        broadcaster.run(cancel).await;
        drop(tx);

        let last = queue.next().await.unwrap();
        assert_eq!(last.event, "shutdown");
        assert!(queue.next().await.is_none());
        assert_eq!(registry.client_count(), 0);
    }
}
