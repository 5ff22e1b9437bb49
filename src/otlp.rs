//! OTLP gRPC receiver: decodes `ExportTraceServiceRequest` batches into
//! `SpanEvent`s and hands them to the aggregator. Best-effort — a malformed
//! resource or span is tolerated with sensible defaults, never dropped from
//! the batch, and ingestion failures are never surfaced to the caller.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_server::{TraceService, TraceServiceServer},
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use opentelemetry_proto::tonic::common::v1::any_value::Value as AnyValueKind;
use tonic::{transport::Server, Request, Response, Status};
use tracing::info;

use crate::aggregator::Aggregator;
use crate::model::{SpanEvent, SpanKind};

/// `STATUS_CODE_ERROR` from the OTLP trace proto (`trace.proto`'s
/// `Status.StatusCode`); kept as a literal since the aggregator core has no
/// dependency on the proto crate's enum type.
const STATUS_CODE_ERROR: i32 = 2;

pub struct OtlpTraceReceiver {
    aggregator: Arc<Aggregator>,
}

impl OtlpTraceReceiver {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }
}

/// Decodes a full OTLP export request into a flat batch of `SpanEvent`,
/// preserving every span across every resource.
fn decode_request(req: ExportTraceServiceRequest) -> Vec<SpanEvent> {
    let mut batch = Vec::new();

    for resource_spans in req.resource_spans {
        let service_name = resource_spans
            .resource
            .as_ref()
            .and_then(|r| {
                r.attributes
                    .iter()
                    .find(|kv| kv.key == "service.name")
                    .and_then(|kv| kv.value.as_ref())
                    .and_then(|v| v.value.as_ref())
                    .and_then(|v| match v {
                        AnyValueKind::StringValue(s) => Some(s.clone()),
                        _ => None,
                    })
            })
            .unwrap_or_else(|| "unknown".to_string());

        for scope_spans in resource_spans.scope_spans {
            for span in scope_spans.spans {
                let parent_span_id = if span.parent_span_id.is_empty() {
                    None
                } else {
                    Some(span.parent_span_id.clone())
                };

                let duration_ms = span
                    .end_time_unix_nano
                    .saturating_sub(span.start_time_unix_nano) as f64
                    / 1_000_000.0;

                let is_error = span
                    .status
                    .as_ref()
                    .map(|s| s.code == STATUS_CODE_ERROR)
                    .unwrap_or(false);

                batch.push(SpanEvent {
                    trace_id: span.trace_id,
                    span_id: span.span_id,
                    parent_span_id,
                    service_name: service_name.clone(),
                    duration_ms,
                    end_time_ns: span.end_time_unix_nano,
                    kind: SpanKind::from(span.kind),
                    is_error,
                });
            }
        }
    }

    batch
}

#[tonic::async_trait]
impl TraceService for OtlpTraceReceiver {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let batch = decode_request(request.into_inner());

        if !batch.is_empty() {
            self.aggregator.ingest(batch);
        }

        // Ingestion is best-effort: the response is always a plain success,
        // even if every span in the batch turned out to be malformed.
        Ok(Response::new(ExportTraceServiceResponse {
            partial_success: None,
        }))
    }
}

/// `shutdown` resolves once the supervisor wants this server to drain and
/// stop — shared with the HTTP side so either server exiting, or a signal,
/// brings both down together (spec.md §4.5).
pub async fn run_otlp_server(
    aggregator: Arc<Aggregator>,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = addr.parse()?;
    info!("OTLP gRPC server listening on {}", addr);

    let receiver = OtlpTraceReceiver::new(aggregator);

    Server::builder()
        .add_service(TraceServiceServer::new(receiver))
        .serve_with_shutdown(addr, shutdown)
        .await?;

    Ok(())
}
