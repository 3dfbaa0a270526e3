// Per-request correlation for RPC logging.

use std::future::Future;

use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

tokio::task_local! {
    static REQUEST_TRACE: RequestTrace;
}

/// Correlation data for one request line, visible to everything the
/// handler awaits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTrace {
    /// Client-supplied `trace_id` (top level or in params), else generated.
    pub trace_id: String,
    pub method: Option<String>,
}

impl RequestTrace {
    /// Best-effort extraction; malformed input still gets a fresh id so the
    /// parse-error response can be correlated.
    pub fn from_raw(raw: &[u8]) -> Self {
        let value = serde_json::from_slice::<Value>(raw).ok();
        let trace_id = value
            .as_ref()
            .and_then(|value| {
                client_trace_id(value).or_else(|| value.get("params").and_then(client_trace_id))
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let method = value
            .as_ref()
            .and_then(|value| value.get("method"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self { trace_id, method }
    }
}

fn client_trace_id(value: &Value) -> Option<String> {
    value
        .as_object()?
        .get("trace_id")?
        .as_str()
        .map(str::trim)
        .filter(|trace_id| !trace_id.is_empty())
        .map(str::to_string)
}

/// Run `future` with `trace` in scope and inside an `rpc` span.
pub async fn with_request_trace<F>(trace: RequestTrace, future: F) -> F::Output
where
    F: Future,
{
    let span = tracing::debug_span!(
        "rpc",
        trace_id = %trace.trace_id,
        method = trace.method.as_deref().unwrap_or("?"),
    );
    REQUEST_TRACE.scope(trace, future.instrument(span)).await
}

pub fn current_trace_id() -> Option<String> {
    REQUEST_TRACE.try_with(|trace| trace.trace_id.clone()).ok()
}
