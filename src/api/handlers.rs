//! API handlers: SSE stream, health summary, event queries, manual clear.

use crate::config::defaults;
use crate::eventlog::{EventLog, HealEvent, RecoveryEvent, RecoveryStats};
use crate::stream::detector::DetectorStats;
use crate::stream::registry::{ClientId, ClientQueue, ClientRegistry, StreamFrame};
use crate::supervisor::state::{DaemonSnapshot, DaemonState, SupervisorState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Shared handles the API reads from. Cheap to clone per request.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ClientRegistry>,
    pub supervisor: Arc<SupervisorState>,
    pub event_log: Arc<EventLog>,
    pub detector_stats: Arc<DetectorStats>,
}

// ============================================================================
// SSE Stream
// ============================================================================

/// Deregisters the client when its SSE stream is dropped, so disconnect
/// churn can never leak registry entries.
struct StreamGuard {
    registry: Arc<ClientRegistry>,
    id: ClientId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

struct StreamCtx {
    queue: Arc<ClientQueue>,
    _guard: StreamGuard,
}

/// GET /api/v1/stream — live change feed.
///
/// Emits a `hello` event carrying the current sequence number, then one
/// `change` event per detected store delta, in sequence order. Keep-alive
/// comments stop intermediaries from timing out idle connections.
pub async fn get_stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, queue) = state.registry.register();

    let hello = serde_json::json!({
        "sequence": state.detector_stats.last_sequence(),
        "connected_at": Utc::now(),
    });
    queue.push(StreamFrame::new("hello", hello.to_string()));

    let ctx = StreamCtx {
        queue,
        _guard: StreamGuard {
            registry: Arc::clone(&state.registry),
            id,
        },
    };

    let stream = futures::stream::unfold(ctx, |ctx| async move {
        match ctx.queue.next().await {
            Some(frame) => {
                let event = Event::default().event(&frame.event).data(&frame.data);
                Some((Ok(event), ctx))
            }
            None => None,
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(defaults::KEEPALIVE_SECS))
            .text("keepalive"),
    )
}

// ============================================================================
// Health Endpoint
// ============================================================================

/// Streaming-side counters for the health summary.
#[derive(Debug, Serialize)]
pub struct StreamHealth {
    pub clients: usize,
    pub last_sequence: u64,
    pub missed_cycles: u64,
    pub completed_cycles: u64,
}

/// Point-in-time system summary. Always the true last-known state — a
/// Degraded daemon stays visibly Degraded until an operator clears it.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy`, `degraded`, or `critical`.
    pub status: String,
    pub daemon_count: usize,
    pub daemons: Vec<DaemonSnapshot>,
    pub stream: StreamHealth,
    /// Aggregate recovery-rate statistics, absent when the log is unreadable.
    pub recovery: Option<RecoveryStats>,
    /// False when the persisted event log cannot be read — a
    /// health-critical condition, never silently retried.
    pub event_log_ok: bool,
    pub timestamp: DateTime<Utc>,
}

/// GET /api/v1/health — system health summary.
pub async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let daemons = state.supervisor.snapshot().await;

    let (recovery, event_log_ok) = match state.event_log.recovery_stats() {
        Ok(stats) => (Some(stats), true),
        Err(e) => {
            warn!(error = %e, "Event log unreadable");
            (None, false)
        }
    };

    let any_unhealthy = daemons.iter().any(|d| d.state != DaemonState::Healthy);
    let status = if !event_log_ok {
        "critical"
    } else if any_unhealthy {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        daemon_count: daemons.len(),
        daemons,
        stream: StreamHealth {
            clients: state.registry.client_count(),
            last_sequence: state.detector_stats.last_sequence(),
            missed_cycles: state.detector_stats.missed_cycles(),
            completed_cycles: state.detector_stats.completed_cycles(),
        },
        recovery,
        event_log_ok,
        timestamp: Utc::now(),
    })
}

// ============================================================================
// Event Queries
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealEventsResponse {
    pub events: Vec<HealEvent>,
    pub count: usize,
}

/// GET /api/v1/events/heal — recent heal outcomes, newest first.
pub async fn get_heal_events(
    State(state): State<ApiState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<HealEventsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let limit = params.limit.min(500);
    match state.event_log.recent_heal(limit) {
        Ok(events) => Ok(Json(HealEventsResponse {
            count: events.len(),
            events,
        })),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct RecoveryEventsResponse {
    pub events: Vec<RecoveryEvent>,
    pub count: usize,
}

/// GET /api/v1/events/recovery — recent watchdog restarts, newest first.
pub async fn get_recovery_events(
    State(state): State<ApiState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<RecoveryEventsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let limit = params.limit.min(500);
    match state.event_log.recent_recovery(limit) {
        Ok(events) => Ok(Json(RecoveryEventsResponse {
            count: events.len(),
            events,
        })),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}

// ============================================================================
// Manual Clear
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub daemon: String,
    pub cleared: bool,
}

/// POST /api/v1/daemons/{name}/clear — clear a Degraded latch.
///
/// The daemon returns as Suspect; the next scan must re-verify it.
pub async fn clear_daemon(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<ClearResponse>, (StatusCode, Json<ErrorResponse>)> {
    if state.supervisor.state_of(&name).await.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown daemon '{}'", name),
            }),
        ));
    }

    let cleared = state.supervisor.clear_degraded(&name).await;
    Ok(Json(ClearResponse {
        daemon: name,
        cleared,
    }))
}
