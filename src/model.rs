//! Shared data model: decoded spans, edge/node keys and stats, and the
//! snapshot wire format served over the pull and push endpoints.

use serde::{Deserialize, Serialize};

/// Span kind, mirroring `opentelemetry_proto::tonic::trace::v1::span::SpanKind`.
///
/// Kept as our own enum (rather than re-exporting the generated proto type)
/// so the aggregator core has no compile-time dependency on the OTLP wire
/// schema — only the decoder in `otlp.rs` needs to know about that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    /// `true` for spans that represent inbound work at a service boundary
    /// (a request received, or a message consumed).
    pub fn is_inbound(self) -> bool {
        matches!(self, SpanKind::Server | SpanKind::Consumer)
    }
}

impl From<i32> for SpanKind {
    fn from(code: i32) -> Self {
        match code {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }
}

/// A single span decoded from an OTLP export request.
///
/// Identifiers are opaque byte strings; equality is by exact bytes, not by
/// any decoded string form.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub trace_id: Vec<u8>,
    pub span_id: Vec<u8>,
    pub parent_span_id: Option<Vec<u8>>,
    pub service_name: String,
    pub duration_ms: f64,
    pub end_time_ns: u64,
    pub kind: SpanKind,
    pub is_error: bool,
}

/// Ordered `(parent_service, child_service)` pair identifying a dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub parent_service: String,
    pub child_service: String,
}

impl EdgeKey {
    pub fn new(parent_service: impl Into<String>, child_service: impl Into<String>) -> Self {
        Self {
            parent_service: parent_service.into(),
            child_service: child_service.into(),
        }
    }
}

/// Mutable per-bucket statistics for one edge.
#[derive(Debug, Clone, Default)]
pub struct EdgeStats {
    pub call_count: u64,
    pub error_count: u64,
    /// Raw latency samples observed in this bucket, in milliseconds.
    pub durations: Vec<f64>,
}

impl EdgeStats {
    fn merge_from(&mut self, other: &EdgeStats) {
        self.call_count += other.call_count;
        self.error_count += other.error_count;
        self.durations.extend_from_slice(&other.durations);
    }
}

/// Mutable per-bucket statistics for one node (service).
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub call_count: u64,
    pub error_count: u64,
    /// Counts only spans whose kind is SERVER or CONSUMER.
    pub server_call_count: u64,
    pub server_error_count: u64,
}

impl NodeStats {
    fn merge_from(&mut self, other: &NodeStats) {
        self.call_count += other.call_count;
        self.error_count += other.error_count;
        self.server_call_count += other.server_call_count;
        self.server_error_count += other.server_error_count;
    }
}

/// Accumulator used while folding several buckets together in `get_snapshot`.
/// Kept separate from the per-bucket `EdgeStats`/`NodeStats` only to make the
/// merge step read as "combine into", not "mutate in place".
#[derive(Default)]
pub(crate) struct Combined {
    pub nodes: std::collections::HashMap<String, NodeStats>,
    pub edges: std::collections::HashMap<EdgeKey, EdgeStats>,
}

impl Combined {
    pub fn merge_node(&mut self, name: &str, stats: &NodeStats) {
        self.nodes.entry(name.to_string()).or_default().merge_from(stats);
    }

    pub fn merge_edge(&mut self, key: &EdgeKey, stats: &EdgeStats) {
        self.edges.entry(key.clone()).or_default().merge_from(stats);
    }
}

/// One row of the `nodes` array in the snapshot wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot {
    pub name: String,
    pub call_count: u64,
    pub error_count: u64,
}

/// One row of the `edges` array in the snapshot wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeSnapshot {
    pub src: String,
    pub dst: String,
    pub call_count: u64,
    pub p95_ms: f64,
    pub error_count: u64,
}

/// The full snapshot served by both `GET /graph` and the `/ws` push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Snapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}
