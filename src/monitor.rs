//! Monitoring HTTP/WS surface: exposes the Connection Registry and
//! Broadcast Fabric to the outside world over `axum`.
//!
//! `GET /api/stats` answers with a point-in-time snapshot; `GET /ws` upgrades
//! to a WebSocket and pushes one snapshot per second for as long as the
//! registry has something new to report. `/` and `/static/*path` serve an
//! optional static dashboard directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::broadcast::{BroadcastFabric, Sink};
use crate::registry::{ConnId, ConnectionRegistry, Protocol, Snapshot};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub broadcast: Arc<BroadcastFabric>,
}

/// The wire shape for `GET /api/stats` and each WebSocket push: decoupled
/// from `Snapshot` so internal `Instant` timestamps and field names never
/// leak onto the documented external surface, which keys `active_connections`
/// by connection id and names its fields independently of the registry's
/// internal representation.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: BTreeMap<String, ConnectionView>,
    pub total_connections: u64,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub current_bandwidth_in: f64,
    pub current_bandwidth_out: f64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionView {
    pub id: ConnId,
    pub client_ip: String,
    pub protocol: Protocol,
    pub destination: String,
    pub domain_name: String,
    pub start_time: DateTime<Utc>,
    pub duration: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub bandwidth_in: f64,
    pub bandwidth_out: f64,
}

/// Render a duration the way a human reads a stopwatch: `H:MM:SS`, with the
/// hour component dropped entirely for anything under an hour.
fn humanize_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

impl From<Snapshot> for StatsResponse {
    fn from(snap: Snapshot) -> Self {
        let now_instant = std::time::Instant::now();
        let now_wall = Utc::now();
        StatsResponse {
            active_connections: snap
                .active
                .into_iter()
                .map(|v| {
                    let start_time =
                        now_wall - chrono::Duration::from_std(now_instant.duration_since(v.start_time)).unwrap_or_default();
                    let view = ConnectionView {
                        id: v.id,
                        client_ip: v.client_endpoint,
                        protocol: v.protocol,
                        destination: v.destination,
                        domain_name: v.domain,
                        start_time,
                        duration: humanize_duration(v.duration),
                        bytes_received: v.bytes_in,
                        bytes_sent: v.bytes_out,
                        bandwidth_in: v.rate_in,
                        bandwidth_out: v.rate_out,
                    };
                    (v.id.to_string(), view)
                })
                .collect(),
            total_connections: snap.total_connections,
            total_bytes_received: snap.total_bytes_in,
            total_bytes_sent: snap.total_bytes_out,
            current_bandwidth_in: snap.current_bandwidth_in,
            current_bandwidth_out: snap.current_bandwidth_out,
        }
    }
}

/// Build the monitoring router. `dashboard_dir` is optional: when absent,
/// `/` and `/static/*path` still exist as routes and answer 404, matching
/// the guarantee that these paths are always routable.
pub fn build_router(state: AppState, dashboard_dir: Option<PathBuf>) -> Router {
    let router = Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let dashboard_root = dashboard_dir.unwrap_or_else(|| PathBuf::from("/nonexistent/duoproxy-dashboard"));
    let serve_dir = ServeDir::new(&dashboard_root);
    router
        .nest_service("/static", serve_dir.clone())
        .fallback_service(serve_dir)
        .layer(TraceLayer::new_for_http())
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot().await;
    Json(StatsResponse::from(snapshot))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// A `Sink` that forwards snapshots to one WebSocket client as JSON text
/// frames. Serialization and the write share a lock because `SplitSink`
/// only yields `&mut` access to one writer at a time.
struct WsSink {
    writer: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl Sink for WsSink {
    async fn send(&self, snapshot: &Snapshot) -> Result<(), ()> {
        let payload = serde_json::to_string(&StatsResponse::from(snapshot.clone())).map_err(|_| ())?;
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(payload.into())).await.map_err(|_| ())
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink_half, mut receiver) = socket.split();
    let sink = Arc::new(WsSink {
        writer: Mutex::new(sink_half),
    });

    let initial = state.registry.snapshot().await;
    state.broadcast.publish_now_to(sink.as_ref(), &initial).await;

    let _subscription = state.broadcast.subscribe(sink).await;

    // Keep the task alive (and thus the subscription registered) until the
    // client disconnects or sends something other than a ping/pong, which
    // this connection has no use for.
    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
}
