//! HTTP server assembly plus the WebSocket push endpoint: per-session
//! look-back window, periodic snapshot broadcast, runtime reconfiguration
//! via a `window:<integer>` control message.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::interval;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::api::{self, SharedAggregator};

const DEFAULT_WINDOW_SEC: i64 = 60;
const PUSH_INTERVAL: Duration = Duration::from_secs(2);

pub fn router(aggregator: SharedAggregator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/graph", get(api::graph_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health_handler))
        .route("/config", get(api::config_handler))
        .layer(cors)
        .with_state(aggregator)
}

/// `shutdown` resolves once the supervisor wants this server to drain and
/// stop — shared with the OTLP side so either server exiting, or a signal,
/// brings both down together (spec.md §4.5).
pub async fn run_http_server(
    aggregator: SharedAggregator,
    bind: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(aggregator);

    info!("HTTP server listening on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(aggregator): State<SharedAggregator>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, aggregator))
}

async fn handle_socket(socket: WebSocket, aggregator: SharedAggregator) {
    let (mut sender, mut receiver) = socket.split();

    // Per-session look-back window, mutated by the receive arm below and
    // read by the push arm; both live in the same `select!` loop so a
    // disconnect or error on either side tears the whole session down at
    // once — no separate cancellation token is needed.
    let window_sec = AtomicI64::new(DEFAULT_WINDOW_SEC);
    let mut push_tick = interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = push_tick.tick() => {
                let snapshot = aggregator.get_snapshot(window_sec.load(Ordering::Relaxed));
                let Ok(json) = serde_json::to_string(&snapshot) else { continue };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(new_window) = parse_window_message(&text) {
                            window_sec.store(new_window, Ordering::Relaxed);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    debug!("WebSocket client disconnected");
}

/// Parses a `window:<integer>` control message. Anything else — including a
/// malformed integer — is ignored and the session keeps its current window.
/// A non-positive value is substituted with the same default-60 the pull
/// endpoint falls back to (spec's `window_sec` policy is shared by both).
fn parse_window_message(text: &str) -> Option<i64> {
    let requested = text.trim().strip_prefix("window:")?.parse::<i64>().ok()?;
    Some(if requested > 0 { requested } else { DEFAULT_WINDOW_SEC })
}
