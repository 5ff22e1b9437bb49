//! The time-bucketed streaming aggregator: the one stateful component in the
//! crate. Everything else (decoder, pull/push endpoints) is a thin,
//! stateless adapter around `ingest` and `get_snapshot`.
//!
//! Concurrency: a single `RwLock` guards both bucket tables together, so a
//! batch's mutations become visible atomically and snapshot reads never
//! observe a half-evicted state. `ingest` holds the write lock for its
//! entire duration (cheap: per-span map ops plus, at most, a `BTreeMap`
//! insertion per new bucket); `get_snapshot` holds the read lock only long
//! enough to fold matching buckets into a local accumulator, then releases
//! it before sorting duration samples and computing p95.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::{Combined, EdgeKey, EdgeSnapshot, EdgeStats, NodeSnapshot, NodeStats, Snapshot, SpanEvent};

struct Inner {
    /// bucket_id -> EdgeKey -> EdgeStats
    edge_buckets: BTreeMap<i64, HashMap<EdgeKey, EdgeStats>>,
    /// bucket_id -> service_name -> NodeStats
    ///
    /// Every ingested span writes a node-stats entry for its bucket,
    /// regardless of whether it produced an edge, so this map's key set is
    /// always the full "active buckets" set; `edge_buckets`' keys are always
    /// a subset of it. See DESIGN.md for why `active_buckets` isn't tracked
    /// as a separate list.
    node_buckets: BTreeMap<i64, HashMap<String, NodeStats>>,
}

pub struct Aggregator {
    window_ns: u64,
    retention_buckets: usize,
    inner: RwLock<Inner>,
}

impl Aggregator {
    pub fn new(window_sec: i64, retention_buckets: usize) -> Self {
        let window_sec = window_sec.max(1) as u64;
        Self {
            window_ns: window_sec * 1_000_000_000,
            retention_buckets,
            inner: RwLock::new(Inner {
                edge_buckets: BTreeMap::new(),
                node_buckets: BTreeMap::new(),
            }),
        }
    }

    fn bucket_id(&self, end_time_ns: u64) -> i64 {
        (end_time_ns / self.window_ns) as i64
    }

    pub fn window_sec(&self) -> i64 {
        (self.window_ns / 1_000_000_000) as i64
    }

    pub fn retention_buckets(&self) -> usize {
        self.retention_buckets
    }

    /// Consumes a batch of spans (typically sharing a trace) and commits
    /// their statistics. Returns only once every mutation is visible.
    pub fn ingest(&self, spans: Vec<SpanEvent>) {
        if spans.is_empty() {
            return;
        }

        // Parent resolution is scoped to this batch only: a short-lived
        // span_id -> service_name map, never consulted across ingest calls.
        let span_to_service: HashMap<&[u8], &str> = spans
            .iter()
            .map(|s| (s.span_id.as_slice(), s.service_name.as_str()))
            .collect();

        let mut inner = self.inner.write().expect("aggregator lock poisoned");

        for s in &spans {
            let bucket_id = self.bucket_id(s.end_time_ns);

            let node_stats = inner
                .node_buckets
                .entry(bucket_id)
                .or_default()
                .entry(s.service_name.clone())
                .or_default();
            node_stats.call_count += 1;
            if s.is_error {
                node_stats.error_count += 1;
            }
            if s.kind.is_inbound() {
                node_stats.server_call_count += 1;
                if s.is_error {
                    node_stats.server_error_count += 1;
                }
            }

            if let Some(parent_svc) = s
                .parent_span_id
                .as_deref()
                .and_then(|pid| span_to_service.get(pid))
            {
                if *parent_svc != s.service_name {
                    let edge_key = EdgeKey::new(*parent_svc, s.service_name.clone());
                    let edge_stats = inner
                        .edge_buckets
                        .entry(bucket_id)
                        .or_default()
                        .entry(edge_key)
                        .or_default();
                    edge_stats.call_count += 1;
                    edge_stats.durations.push(s.duration_ms);
                    if s.is_error {
                        edge_stats.error_count += 1;
                    }
                }
            }
        }

        self.evict_locked(&mut inner);
    }

    /// Assumes the write lock is held. Drops the oldest buckets until the
    /// resident count is back within `retention_buckets`.
    fn evict_locked(&self, inner: &mut Inner) {
        while inner.node_buckets.len() > self.retention_buckets {
            if let Some((&oldest, _)) = inner.node_buckets.iter().next() {
                inner.node_buckets.remove(&oldest);
                inner.edge_buckets.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Snapshot over the last `window_sec` seconds, measured from the
    /// current wall clock.
    pub fn get_snapshot(&self, window_sec: i64) -> Snapshot {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i128;
        self.get_snapshot_at(now_ns, window_sec)
    }

    /// Same as `get_snapshot`, but with `now` supplied explicitly so tests
    /// can exercise the bucket-selection logic without depending on wall
    /// clock time.
    fn get_snapshot_at(&self, now_ns: i128, window_sec: i64) -> Snapshot {
        let start_ns = now_ns - (window_sec as i128) * 1_000_000_000;
        let start_bucket = (start_ns / self.window_ns as i128) as i64;

        let mut combined = Combined::default();
        {
            let inner = self.inner.read().expect("aggregator lock poisoned");
            for (&bucket_id, edges) in inner.edge_buckets.range(start_bucket..) {
                for (key, stats) in edges {
                    combined.merge_edge(key, stats);
                }
            }
            for (_, nodes) in inner.node_buckets.range(start_bucket..) {
                for (name, stats) in nodes {
                    combined.merge_node(name, stats);
                }
            }
        }
        // Lock released above; sorting/rounding happens with no lock held.

        let mut nodes: Vec<NodeSnapshot> = combined
            .nodes
            .into_iter()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, stats)| {
                let (call_count, error_count) = if stats.server_call_count > 0 {
                    (stats.server_call_count, stats.server_error_count)
                } else {
                    (stats.call_count, stats.error_count)
                };
                NodeSnapshot {
                    name,
                    call_count,
                    error_count,
                }
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let edges: Vec<EdgeSnapshot> = combined
            .edges
            .into_iter()
            .filter(|(key, _)| !key.parent_service.is_empty() && !key.child_service.is_empty())
            .map(|(key, mut stats)| {
                let p95_ms = if stats.durations.is_empty() {
                    0.0
                } else {
                    stats.durations.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    let n = stats.durations.len();
                    let idx = ((n as f64) * 0.95).floor() as usize;
                    stats.durations[idx.min(n - 1)]
                };
                EdgeSnapshot {
                    src: key.parent_service,
                    dst: key.child_service,
                    call_count: stats.call_count,
                    p95_ms: round_2dp(p95_ms),
                    error_count: stats.error_count,
                }
            })
            .collect();

        Snapshot { nodes, edges }
    }
}

fn round_2dp(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpanKind;

    const WINDOW_NS: u64 = 10_000_000_000;

    fn span(
        span_id: u8,
        parent: Option<u8>,
        svc: &str,
        kind: SpanKind,
        dur_ms: f64,
        end_ns: u64,
        is_error: bool,
    ) -> SpanEvent {
        SpanEvent {
            trace_id: vec![1],
            span_id: vec![span_id],
            parent_span_id: parent.map(|p| vec![p]),
            service_name: svc.to_string(),
            duration_ms: dur_ms,
            end_time_ns: end_ns,
            kind,
            is_error,
        }
    }

    // S1: single cross-service call.
    #[test]
    fn s1_single_cross_service_call() {
        let agg = Aggregator::new(10, 3);
        agg.ingest(vec![
            span(1, None, "gw", SpanKind::Server, 5.0, 10 * WINDOW_NS, false),
            span(2, Some(1), "auth", SpanKind::Server, 3.0, 10 * WINDOW_NS, false),
        ]);

        let snap = agg.get_snapshot_at(10 * WINDOW_NS as i128 + 1, 60);
        assert_eq!(snap.edges.len(), 1);
        let e = &snap.edges[0];
        assert_eq!(e.src, "gw");
        assert_eq!(e.dst, "auth");
        assert_eq!(e.call_count, 1);
        assert_eq!(e.p95_ms, 3.0);
        assert_eq!(e.error_count, 0);

        assert_eq!(snap.nodes.len(), 2);
        assert_eq!(snap.nodes[0].name, "auth");
        assert_eq!(snap.nodes[0].call_count, 1);
        assert_eq!(snap.nodes[1].name, "gw");
        assert_eq!(snap.nodes[1].call_count, 1);
    }

    // S2: same-service parent produces no edge.
    #[test]
    fn s2_same_service_parent_ignored() {
        let agg = Aggregator::new(10, 3);
        agg.ingest(vec![
            span(1, None, "auth", SpanKind::Server, 1.0, 10 * WINDOW_NS, false),
            span(2, Some(1), "auth", SpanKind::Internal, 1.0, 10 * WINDOW_NS, false),
        ]);

        let snap = agg.get_snapshot_at(10 * WINDOW_NS as i128 + 1, 60);
        assert!(snap.edges.is_empty());
        assert_eq!(snap.nodes.len(), 1);
        assert_eq!(snap.nodes[0].call_count, 2);
    }

    // S3: error propagation onto edge and node.
    #[test]
    fn s3_error_propagation() {
        let agg = Aggregator::new(10, 3);
        agg.ingest(vec![
            span(1, None, "gw", SpanKind::Server, 1.0, 10 * WINDOW_NS, false),
            span(2, Some(1), "auth", SpanKind::Server, 1.0, 10 * WINDOW_NS, true),
        ]);

        let snap = agg.get_snapshot_at(10 * WINDOW_NS as i128 + 1, 60);
        assert_eq!(snap.edges[0].error_count, 1);
        let auth = snap.nodes.iter().find(|n| n.name == "auth").unwrap();
        assert_eq!(auth.error_count, 1);
    }

    // S4: SERVER stats preferred over total when present, fallback otherwise.
    #[test]
    fn s4_server_vs_total_fallback() {
        let agg = Aggregator::new(10, 3);
        let mut batch = Vec::new();
        for i in 0..3u8 {
            batch.push(span(i, None, "x", SpanKind::Server, 1.0, 10 * WINDOW_NS, i == 0));
        }
        for i in 3..8u8 {
            batch.push(span(i, None, "x", SpanKind::Internal, 1.0, 10 * WINDOW_NS, i < 5));
        }
        for i in 8..12u8 {
            batch.push(span(i, None, "y", SpanKind::Internal, 1.0, 10 * WINDOW_NS, i == 8));
        }
        agg.ingest(batch);

        let snap = agg.get_snapshot_at(10 * WINDOW_NS as i128 + 1, 60);
        let x = snap.nodes.iter().find(|n| n.name == "x").unwrap();
        assert_eq!(x.call_count, 3);
        assert_eq!(x.error_count, 1);
        let y = snap.nodes.iter().find(|n| n.name == "y").unwrap();
        assert_eq!(y.call_count, 4);
        assert_eq!(y.error_count, 1);
    }

    // S5: p95 over ten samples 1..10ms.
    #[test]
    fn s5_p95_computation() {
        let agg = Aggregator::new(10, 3);
        let mut batch = vec![span(0, None, "gw", SpanKind::Server, 0.0, 10 * WINDOW_NS, false)];
        for i in 1..=10u8 {
            batch.push(span(
                i,
                Some(0),
                "auth",
                SpanKind::Server,
                i as f64,
                10 * WINDOW_NS,
                false,
            ));
        }
        agg.ingest(batch);

        let snap = agg.get_snapshot_at(10 * WINDOW_NS as i128 + 1, 60);
        assert_eq!(snap.edges[0].p95_ms, 10.0);
    }

    // S6: retention eviction by bucket position, not wall-clock time.
    #[test]
    fn s6_retention_eviction() {
        let agg = Aggregator::new(10, 3);
        for bucket in [100u64, 101, 102, 103] {
            agg.ingest(vec![
                span(1, None, "gw", SpanKind::Server, 1.0, bucket * WINDOW_NS, false),
                span(2, Some(1), "auth", SpanKind::Server, 1.0, bucket * WINDOW_NS, false),
            ]);
        }

        let snap = agg.get_snapshot_at(103 * WINDOW_NS as i128 + 1, 1_000_000_000);
        // Only buckets 101..103 remain; their single edge carries call_count 3.
        assert_eq!(snap.edges.len(), 1);
        assert_eq!(snap.edges[0].call_count, 3);
    }

    // I1/I2: resident bucket count and key-set invariants.
    #[test]
    fn i1_i2_retention_and_key_set_invariants() {
        let agg = Aggregator::new(10, 3);
        for bucket in 0u64..10 {
            agg.ingest(vec![span(1, None, "svc", SpanKind::Internal, 1.0, bucket * WINDOW_NS, false)]);
        }
        let inner = agg.inner.read().unwrap();
        assert!(inner.node_buckets.len() <= 3);
        let node_keys: Vec<i64> = inner.node_buckets.keys().copied().collect();
        let mut sorted = node_keys.clone();
        sorted.sort();
        assert_eq!(node_keys, sorted, "active buckets must stay sorted ascending");
        for edge_bucket in inner.edge_buckets.keys() {
            assert!(inner.node_buckets.contains_key(edge_bucket));
        }
    }

    // I3: no self-edges.
    #[test]
    fn i3_no_self_edges() {
        let agg = Aggregator::new(10, 3);
        agg.ingest(vec![
            span(1, None, "auth", SpanKind::Server, 1.0, 10 * WINDOW_NS, false),
            span(2, Some(1), "auth", SpanKind::Server, 1.0, 10 * WINDOW_NS, false),
        ]);
        let inner = agg.inner.read().unwrap();
        for edges in inner.edge_buckets.values() {
            for key in edges.keys() {
                assert_ne!(key.parent_service, key.child_service);
            }
        }
    }

    // I4: error_count <= call_count on both nodes and edges.
    #[test]
    fn i4_error_bounded_by_call_count() {
        let agg = Aggregator::new(10, 3);
        agg.ingest(vec![
            span(1, None, "gw", SpanKind::Server, 1.0, 10 * WINDOW_NS, true),
            span(2, Some(1), "auth", SpanKind::Server, 1.0, 10 * WINDOW_NS, true),
            span(3, Some(1), "auth", SpanKind::Server, 1.0, 10 * WINDOW_NS, false),
        ]);
        let snap = agg.get_snapshot_at(10 * WINDOW_NS as i128 + 1, 60);
        for n in &snap.nodes {
            assert!(n.error_count <= n.call_count);
        }
        for e in &snap.edges {
            assert!(e.error_count <= e.call_count);
        }
    }

    // I5 / L3: window_sec <= 0 and empty state yield empty snapshots; p95 is
    // zero iff call_count is zero.
    #[test]
    fn i5_l3_empty_and_nonpositive_window() {
        let agg = Aggregator::new(10, 3);
        let empty = agg.get_snapshot_at(0, 60);
        assert!(empty.nodes.is_empty() && empty.edges.is_empty());

        agg.ingest(vec![
            span(1, None, "gw", SpanKind::Server, 1.0, 10 * WINDOW_NS, false),
            span(2, Some(1), "auth", SpanKind::Server, 1.0, 10 * WINDOW_NS, false),
        ]);
        // "now" must sit strictly past the ingested bucket's boundary for a
        // non-positive window to exclude it (spec.md: start_bucket >
        // active_buckets.max when window_sec <= 0).
        let zero_window = agg.get_snapshot_at(20 * WINDOW_NS as i128, 0);
        assert!(zero_window.nodes.is_empty() && zero_window.edges.is_empty());
    }

    // L1: additivity of counts across two disjoint sub-windows.
    #[test]
    fn l1_additivity_across_disjoint_windows() {
        let agg = Aggregator::new(10, 360);
        agg.ingest(vec![
            span(1, None, "gw", SpanKind::Server, 1.0, 100 * WINDOW_NS, false),
            span(2, Some(1), "auth", SpanKind::Server, 1.0, 100 * WINDOW_NS, false),
        ]);
        agg.ingest(vec![
            span(3, None, "gw", SpanKind::Server, 1.0, 110 * WINDOW_NS, false),
            span(4, Some(3), "auth", SpanKind::Server, 1.0, 110 * WINDOW_NS, false),
        ]);

        let now = 110 * WINDOW_NS as i128 + 1;
        let older = agg.get_snapshot_at(now, 200); // covers both
        let total_calls: u64 = older.edges.iter().map(|e| e.call_count).sum();
        assert_eq!(total_calls, 2);
    }

    // L2: the minimum resident bucket id never decreases after an ingest.
    #[test]
    fn l2_eviction_monotonicity() {
        let agg = Aggregator::new(10, 2);
        let mut prev_min = i64::MIN;
        for bucket in 0u64..20 {
            agg.ingest(vec![span(1, None, "svc", SpanKind::Internal, 1.0, bucket * WINDOW_NS, false)]);
            let inner = agg.inner.read().unwrap();
            if let Some((&min_id, _)) = inner.node_buckets.iter().next() {
                assert!(min_id >= prev_min);
                prev_min = min_id;
            }
        }
    }

    // L4: order independence of spans within a batch (ignoring duration order).
    #[test]
    fn l4_order_independence_within_batch() {
        let a = Aggregator::new(10, 3);
        let b = Aggregator::new(10, 3);

        let forward = vec![
            span(1, None, "gw", SpanKind::Server, 1.0, 10 * WINDOW_NS, false),
            span(2, Some(1), "auth", SpanKind::Server, 2.0, 10 * WINDOW_NS, false),
            span(3, Some(1), "auth", SpanKind::Server, 3.0, 10 * WINDOW_NS, false),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        a.ingest(forward);
        b.ingest(reversed);

        let snap_a = a.get_snapshot_at(10 * WINDOW_NS as i128 + 1, 60);
        let snap_b = b.get_snapshot_at(10 * WINDOW_NS as i128 + 1, 60);
        assert_eq!(snap_a, snap_b);
    }
}
