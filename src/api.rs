//! Stateless HTTP handlers: the pull endpoint plus small ambient routes
//! (liveness, compiled-in config) carried over from the teacher's own
//! `health_handler`/`config_handler` shape.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::aggregator::Aggregator;

pub type SharedAggregator = Arc<Aggregator>;

const DEFAULT_WINDOW_SEC: i64 = 60;

#[derive(Debug, Deserialize)]
pub struct GraphQuery {
    window_sec: Option<i64>,
}

/// `GET /graph?window_sec=<int>` — snapshot over the requested look-back
/// window. `window_sec` defaults to 60 when absent or non-positive.
pub async fn graph_handler(
    State(aggregator): State<SharedAggregator>,
    Query(query): Query<GraphQuery>,
) -> impl IntoResponse {
    let window_sec = query
        .window_sec
        .filter(|w| *w > 0)
        .unwrap_or(DEFAULT_WINDOW_SEC);
    axum::Json(aggregator.get_snapshot(window_sec))
}

pub async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Debug, serde::Serialize)]
struct ConfigView {
    window_sec: i64,
    retention_buckets: usize,
}

/// `GET /config` — the compiled-in aggregator tuning. Ambient infrastructure
/// carried over from the teacher's own `config_handler`, not spec-specific
/// business logic.
pub async fn config_handler(State(aggregator): State<SharedAggregator>) -> impl IntoResponse {
    axum::Json(ConfigView {
        window_sec: aggregator.window_sec(),
        retention_buckets: aggregator.retention_buckets(),
    })
}
