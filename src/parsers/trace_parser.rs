use crate::error::IngestError;
use crate::events::{SpanStatus, Timestamp, TraceSpan};
use crate::parsers::fields::{
    json_kind, string_map, value_to_f64, value_to_string, FieldCandidates, RecordOutcome,
};
use crate::parsers::time::{from_unix, parse_timestamp, value_or_now};
use chrono::Duration;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

const TRACE_ID: FieldCandidates = FieldCandidates::new("trace_id", &["trace_id", "traceId", "trace"]);
const SPAN_ID: FieldCandidates = FieldCandidates::new("span_id", &["span_id", "spanId", "id"]);
const PARENT_ID: FieldCandidates =
    FieldCandidates::new("parent_span_id", &["parent_span_id", "parentSpanId", "parent_id"]);
const SERVICE: FieldCandidates =
    FieldCandidates::new("service", &["service", "service_name", "serviceName"]);
const OPERATION: FieldCandidates = FieldCandidates::new(
    "operation",
    &["operation", "operation_name", "operationName", "name"],
);
const START: FieldCandidates =
    FieldCandidates::new("start_time", &["start_time", "startTime", "timestamp"]);
const END: FieldCandidates = FieldCandidates::new("end_time", &["end_time", "endTime"]);
const DURATION: FieldCandidates = FieldCandidates::new("duration", &["duration", "duration_ms"]);
const STATUS: FieldCandidates = FieldCandidates::new("status", &["status", "status_code"]);
const TAGS: FieldCandidates = FieldCandidates::new("tags", &["tags", "attributes"]);
const ERROR: FieldCandidates = FieldCandidates::new("error", &["error", "error_message"]);

/// List fields that may wrap the span collection, in lookup order
const WRAPPER_KEYS: &[&str] = &["spans", "traces", "data"];

/// Spans slower than this are reported by [`TraceParser::slow_spans`] by default
pub const DEFAULT_SLOW_SPAN_MS: f64 = 1000.0;

/// Recognized top-level layouts of a trace blob
#[derive(Debug)]
enum TraceShape<'a> {
    /// `[span, span, ...]`
    List(&'a [Value]),
    /// `{"spans" | "traces" | "data": [span, ...]}`
    Wrapped(&'static str, &'a [Value]),
    /// A lone span object
    Single(&'a Map<String, Value>),
}

impl<'a> TraceShape<'a> {
    fn classify(data: &'a Value) -> Result<Self, IngestError> {
        match data {
            Value::Array(items) => Ok(TraceShape::List(items)),
            Value::Object(object) => {
                let wrapped = WRAPPER_KEYS.iter().find_map(|key| match object.get(*key) {
                    Some(Value::Array(items)) => Some(TraceShape::Wrapped(*key, items)),
                    _ => None,
                });
                Ok(wrapped.unwrap_or(TraceShape::Single(object)))
            }
            other => Err(IngestError::Parsing(format!(
                "Unsupported trace format: top-level {}",
                json_kind(other)
            ))),
        }
    }
}

/// Parser for distributed-trace span collections
///
/// Besides decoding spans it derives the service dependency graph and the
/// root-to-error chains used for causal analysis.
#[derive(Debug, Default, Clone)]
pub struct TraceParser;

impl TraceParser {
    pub fn new() -> Self {
        TraceParser
    }

    /// Parse a trace blob into spans
    ///
    /// Spans lacking a trace or span id are dropped.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Json` for invalid JSON and `IngestError::Parsing`
    /// when the top level is neither a list nor an object.
    pub fn parse(&self, content: &str) -> Result<Vec<TraceSpan>, IngestError> {
        let data: Value = serde_json::from_str(content)?;

        let spans = match TraceShape::classify(&data)? {
            TraceShape::List(items) => {
                debug!("Classified trace blob as a span list");
                Self::parse_items(items)
            }
            TraceShape::Wrapped(key, items) => {
                debug!("Classified trace blob as a '{}' wrapper", key);
                Self::parse_items(items)
            }
            TraceShape::Single(object) => {
                debug!("Classified trace blob as a single span");
                Self::parse_span(object).into_option().into_iter().collect()
            }
        };

        info!("Parsed {} trace spans", spans.len());
        Ok(spans)
    }

    fn parse_items(items: &[Value]) -> Vec<TraceSpan> {
        let mut spans = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let outcome = match item {
                Value::Object(object) => Self::parse_span(object),
                other => RecordOutcome::skipped(format!(
                    "expected an object, found {}",
                    json_kind(other)
                )),
            };
            match outcome {
                RecordOutcome::Parsed(span) => spans.push(span),
                RecordOutcome::Skipped(reason) => debug!("Dropping span {}: {}", index, reason),
            }
        }
        spans
    }

    fn parse_span(object: &Map<String, Value>) -> RecordOutcome<TraceSpan> {
        let Some(trace_id) = TRACE_ID.resolve_string(object) else {
            return RecordOutcome::skipped("missing trace id");
        };
        let Some(span_id) = SPAN_ID.resolve_string(object) else {
            return RecordOutcome::skipped("missing span id");
        };

        let start_time = value_or_now(START.resolve(object));
        let (end_time, duration_ms) = reconcile_duration(
            start_time,
            DURATION.resolve(object).and_then(value_to_f64),
            END.resolve(object).and_then(optional_timestamp),
        );

        let status = STATUS
            .resolve(object)
            .map(|raw| SpanStatus::normalize(&value_to_string(raw)))
            .unwrap_or(SpanStatus::Ok);

        let tags = string_map(TAGS.resolve(object));
        let error = ERROR
            .resolve_string(object)
            .or_else(|| tags.get("error").filter(|e| !e.is_empty()).cloned());

        RecordOutcome::Parsed(TraceSpan {
            trace_id,
            span_id,
            parent_span_id: PARENT_ID.resolve_string(object),
            service: SERVICE
                .resolve_string(object)
                .unwrap_or_else(|| "unknown".to_string()),
            operation: OPERATION
                .resolve_string(object)
                .unwrap_or_else(|| "unknown".to_string()),
            start_time,
            end_time,
            duration_ms,
            status,
            tags,
            error,
        })
    }

    /// Service-level call graph: parent service -> set of child services
    ///
    /// Edges only join spans of the same trace; calls within one service
    /// produce no edge.
    pub fn build_dependency_graph(spans: &[TraceSpan]) -> BTreeMap<String, BTreeSet<String>> {
        let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for trace in group_by_trace(spans).values() {
            for span in trace.values() {
                let Some(parent) = span.parent_span_id.as_deref().and_then(|id| trace.get(id))
                else {
                    continue;
                };
                if parent.service != span.service {
                    graph
                        .entry(parent.service.clone())
                        .or_default()
                        .insert(span.service.clone());
                }
            }
        }

        graph
    }

    /// Root-first parent chains ending at each ERROR span
    ///
    /// Chains of a single span are left out.
    pub fn find_error_chains(spans: &[TraceSpan]) -> Vec<Vec<TraceSpan>> {
        let traces = group_by_trace(spans);
        let mut chains = Vec::new();

        for span in spans.iter().filter(|s| s.status == SpanStatus::Error) {
            let Some(trace) = traces.get(span.trace_id.as_str()) else {
                continue;
            };

            let mut chain = vec![span.clone()];
            let mut visited = HashSet::from([span.span_id.as_str()]);
            let mut current = span;

            while let Some(parent) = current
                .parent_span_id
                .as_deref()
                .and_then(|id| trace.get(id).copied())
            {
                if !visited.insert(parent.span_id.as_str()) {
                    warn!("Cycle in parent links of trace {}", span.trace_id);
                    break;
                }
                chain.push(parent.clone());
                current = parent;
            }

            if chain.len() > 1 {
                chain.reverse();
                chains.push(chain);
            }
        }

        chains
    }

    pub fn filter_by_service<S: AsRef<str>>(spans: &[TraceSpan], services: &[S]) -> Vec<TraceSpan> {
        spans
            .iter()
            .filter(|s| services.iter().any(|svc| svc.as_ref() == s.service))
            .cloned()
            .collect()
    }

    pub fn filter_by_status(spans: &[TraceSpan], statuses: &[SpanStatus]) -> Vec<TraceSpan> {
        spans
            .iter()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect()
    }

    /// Spans whose duration exceeds `threshold_ms`
    pub fn slow_spans(spans: &[TraceSpan], threshold_ms: f64) -> Vec<TraceSpan> {
        spans
            .iter()
            .filter(|s| s.duration_ms > threshold_ms)
            .cloned()
            .collect()
    }
}

/// Index spans by trace id, then by span id
fn group_by_trace(spans: &[TraceSpan]) -> HashMap<&str, HashMap<&str, &TraceSpan>> {
    let mut traces: HashMap<&str, HashMap<&str, &TraceSpan>> = HashMap::new();
    for span in spans {
        traces
            .entry(span.trace_id.as_str())
            .or_default()
            .insert(span.span_id.as_str(), span);
    }
    traces
}

/// A timestamp field that is dropped, not defaulted, when unreadable
fn optional_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_f64().and_then(from_unix),
        _ => None,
    }
}

/// Derive `(end_time, duration_ms)` from whichever of duration or end is known
///
/// An explicit duration wins. The result always has `end_time >= start_time`.
fn reconcile_duration(
    start: Timestamp,
    duration_ms: Option<f64>,
    end: Option<Timestamp>,
) -> (Timestamp, f64) {
    if let Some(duration) = duration_ms.filter(|d| d.is_finite()) {
        let duration = duration.max(0.0);
        let delta = Duration::microseconds((duration * 1000.0).round() as i64);
        let end = start.checked_add_signed(delta).unwrap_or(start);
        return (end, duration);
    }

    match end {
        Some(end) if end >= start => {
            let elapsed = end - start;
            let millis = elapsed
                .num_microseconds()
                .map(|us| us as f64 / 1000.0)
                .unwrap_or(elapsed.num_milliseconds() as f64);
            (end, millis)
        }
        Some(end) => {
            warn!("Span end {} precedes start {}, clamping", end, start);
            (start, 0.0)
        }
        None => (start, 0.0),
    }
}


// Property-based tests
#[cfg(test)]
mod property_tests {
    use super::*;
    use chrono::DateTime;
    use quickcheck_macros::quickcheck;

    // End never precedes start, whatever the inputs
    #[quickcheck]
    fn prop_end_not_before_start(start_secs: u32, duration: Option<i32>, end_secs: Option<u32>) -> bool {
        let Some(start) = DateTime::from_timestamp(start_secs as i64, 0) else {
            return true;
        };
        let start = start.fixed_offset();
        let end = end_secs
            .and_then(|s| DateTime::from_timestamp(s as i64, 0))
            .map(|dt| dt.fixed_offset());

        let (end_time, duration_ms) = reconcile_duration(start, duration.map(f64::from), end);
        end_time >= start && duration_ms >= 0.0
    }

    // Every graph edge joins two different services
    #[quickcheck]
    fn prop_graph_has_no_self_edges(links: Vec<(u8, u8, u8)>) -> bool {
        let spans: Vec<TraceSpan> = links
            .iter()
            .filter_map(|(id, parent, service)| {
                let value = serde_json::json!({
                    "trace_id": "t",
                    "span_id": (id % 16).to_string(),
                    "parent_span_id": (parent % 16).to_string(),
                    "service": format!("svc{}", service % 4),
                });
                match value {
                    Value::Object(object) => TraceParser::parse_span(&object).into_option(),
                    _ => None,
                }
            })
            .collect();

        TraceParser::build_dependency_graph(&spans)
            .iter()
            .all(|(from, to)| !to.contains(from))
    }
}
