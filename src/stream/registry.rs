//! Client registry — per-client bounded queues with explicit backpressure.
//!
//! Each connected stream client owns one bounded FIFO of serialized frames
//! and a notifier its delivery task parks on. Broadcast never blocks: a
//! full queue drops its oldest frame (bounded staleness), and a client
//! whose queue is full for enough consecutive broadcasts is forcibly
//! closed. Every register/deregister pair releases its queue, so rapid
//! reconnect churn cannot leak.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// One serialized stream message, shared across all client queues.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    /// SSE event name (`hello`, `change`, `shutdown`).
    pub event: String,
    /// JSON payload.
    pub data: String,
}

impl StreamFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            event: event.into(),
            data: data.into(),
        })
    }
}

/// Registry handle for a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Outcome of offering a frame to one client queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued without overflow; the overflow streak resets.
    Queued,
    /// Queue was full: oldest frame dropped, streak incremented.
    DroppedOldest,
    /// Overflow streak hit the disconnect threshold; queue closed.
    Disconnected,
    /// Queue already closed.
    Closed,
}

#[derive(Debug)]
struct QueueInner {
    frames: VecDeque<Arc<StreamFrame>>,
    consecutive_full: u32,
    dropped_total: u64,
    closed: bool,
}

/// Bounded per-client frame queue.
///
/// Single producer (the broadcaster) and single consumer (the client's SSE
/// delivery task). FIFO order, so per-client delivery order always matches
/// the global sequence order.
#[derive(Debug)]
pub struct ClientQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    disconnect_after_full: u32,
}

impl ClientQueue {
    fn new(capacity: usize, disconnect_after_full: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity.min(64)),
                consecutive_full: 0,
                dropped_total: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            disconnect_after_full,
        }
    }

    /// Offer a frame. Never blocks.
    pub fn push(&self, frame: Arc<StreamFrame>) -> PushOutcome {
        let outcome = {
            let Ok(mut inner) = self.inner.lock() else {
                return PushOutcome::Closed;
            };
            if inner.closed {
                return PushOutcome::Closed;
            }

            if inner.frames.len() < self.capacity {
                inner.frames.push_back(frame);
                inner.consecutive_full = 0;
                PushOutcome::Queued
            } else {
                inner.frames.pop_front();
                inner.frames.push_back(frame);
                inner.consecutive_full += 1;
                inner.dropped_total += 1;
                if inner.consecutive_full >= self.disconnect_after_full {
                    inner.closed = true;
                    PushOutcome::Disconnected
                } else {
                    PushOutcome::DroppedOldest
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Await the next frame.
    ///
    /// Returns `None` once the queue is closed and drained — queued frames
    /// (including a final shutdown notice) are always delivered first.
    pub async fn next(&self) -> Option<Arc<StreamFrame>> {
        loop {
            {
                let Ok(mut inner) = self.inner.lock() else {
                    return None;
                };
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue. Already-queued frames remain deliverable.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|i| i.closed).unwrap_or(true)
    }

    /// Frames dropped to overflow over this queue's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.inner.lock().map(|i| i.dropped_total).unwrap_or(0)
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.frames.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-broadcast delivery summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub delivered: usize,
    pub dropped_oldest: usize,
    pub disconnected: usize,
}

/// Tracks every connected stream client and owns the backpressure policy.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Arc<ClientQueue>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    disconnect_after_full: u32,
}

impl ClientRegistry {
    pub fn new(queue_capacity: usize, disconnect_after_full: u32) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
            disconnect_after_full,
        }
    }

    /// Register a new client and hand back its queue.
    pub fn register(&self) -> (ClientId, Arc<ClientQueue>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(ClientQueue::new(
            self.queue_capacity,
            self.disconnect_after_full,
        ));
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(id, Arc::clone(&queue));
            debug!(client = %id, total = clients.len(), "Stream client registered");
        }
        (id, queue)
    }

    /// Remove a client and release its queue.
    pub fn deregister(&self, id: ClientId) {
        if let Ok(mut clients) = self.clients.lock() {
            if let Some(queue) = clients.remove(&id) {
                queue.close();
                debug!(client = %id, total = clients.len(), "Stream client deregistered");
            }
        }
    }

    /// Deliver a frame to every registered client.
    ///
    /// Clients that cross the overflow threshold are closed and removed
    /// here; nothing in this path can block on a slow consumer.
    pub fn broadcast(&self, frame: &Arc<StreamFrame>) -> BroadcastSummary {
        let mut summary = BroadcastSummary::default();
        let mut evicted: Vec<ClientId> = Vec::new();

        {
            let Ok(clients) = self.clients.lock() else {
                return summary;
            };
            for (id, queue) in clients.iter() {
                match queue.push(Arc::clone(frame)) {
                    PushOutcome::Queued => summary.delivered += 1,
                    PushOutcome::DroppedOldest => {
                        summary.delivered += 1;
                        summary.dropped_oldest += 1;
                    }
                    PushOutcome::Disconnected | PushOutcome::Closed => {
                        evicted.push(*id);
                    }
                }
            }
        }

        for id in evicted {
            warn!(client = %id, "Client queue overflowed repeatedly — disconnecting");
            summary.disconnected += 1;
            self.deregister(id);
        }

        summary
    }

    /// Close every client with a final notification and clear the registry.
    pub fn shutdown(&self, final_frame: &Arc<StreamFrame>) {
        let drained: Vec<(ClientId, Arc<ClientQueue>)> = match self.clients.lock() {
            Ok(mut clients) => clients.drain().collect(),
            Err(_) => return,
        };
        info!(clients = drained.len(), "Closing stream clients");
        for (_, queue) in drained {
            queue.push(Arc::clone(final_frame));
            queue.close();
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }
}
