use crate::config::Config;
use crate::error::{IngestError, PipelineError, ReasoningError};
use crate::events::{ConfigChange, DeploymentEvent, LogEntry, MetricDataPoint, Timestamp, TraceSpan};
use crate::parsers::fields::decode_utf8;
use crate::parsers::{ConfigFormat, ConfigParser, LogFormat};
use crate::reasoning::{AnalysisConstraints, ReasoningBackend};
use crate::store::{IncidentRecord, IncidentStatus, IncidentStore};
use crate::unifier::{
    ContextEnrichment, ContextLimits, DataUnifier, ParsedSignals, UnifiedContext, UnifyOptions,
};
use chrono::Duration;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What to do when one input blob cannot be parsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record a warning and continue with the remaining blobs
    #[default]
    Skip,
    /// Fail the whole incident
    Abort,
}

/// Cooperative cancellation shared between the caller and parse tasks
///
/// Checked once before each blob is parsed; a blob already being parsed runs
/// to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<Mutex<bool>>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            *cancelled = true;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        // A poisoned flag means a holder panicked; treat as cancelled
        self.cancelled.lock().map(|c| *c).unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct LogInput {
    /// Service name used when a line does not carry one
    pub source: String,
    /// Raw bytes; invalid UTF-8 fails the blob
    pub content: Vec<u8>,
    pub format: LogFormat,
}

/// A named metrics or trace blob
#[derive(Debug, Clone)]
pub struct SourceBlob {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ConfigInput {
    pub path: String,
    pub content: Vec<u8>,
    pub format: ConfigFormat,
}

/// Everything submitted for one incident analysis
#[derive(Debug, Clone, Default)]
pub struct IncidentRequest {
    pub incident_id: Option<String>,
    pub logs: Vec<LogInput>,
    pub metrics: Vec<SourceBlob>,
    pub traces: Vec<SourceBlob>,
    /// With two or more, the first two are diffed as old and new snapshots;
    /// later ones are ignored
    pub configs: Vec<ConfigInput>,
    pub deployments: Vec<DeploymentEvent>,
    pub metric_baseline: Option<HashMap<String, f64>>,
    pub time_window_minutes: Option<i64>,
    pub reference_time: Option<Timestamp>,
}

enum ParseJob {
    Log(LogInput),
    Metrics(SourceBlob),
    Trace(SourceBlob),
    Config { index: usize, input: ConfigInput },
}

enum ParseOutput {
    Logs(Vec<LogEntry>),
    Points(Vec<MetricDataPoint>),
    Spans(Vec<TraceSpan>),
    Config {
        index: usize,
        changes: Vec<ConfigChange>,
    },
}

enum JobOutcome {
    Done(ParseOutput),
    Failed(IngestError),
    Cancelled,
}

impl ParseJob {
    fn source_name(&self) -> String {
        match self {
            ParseJob::Log(input) => input.source.clone(),
            ParseJob::Metrics(blob) | ParseJob::Trace(blob) => blob.name.clone(),
            ParseJob::Config { input, .. } => input.path.clone(),
        }
    }

    fn content_len(&self) -> usize {
        match self {
            ParseJob::Log(input) => input.content.len(),
            ParseJob::Metrics(blob) | ParseJob::Trace(blob) => blob.content.len(),
            ParseJob::Config { input, .. } => input.content.len(),
        }
    }

    fn execute(self, unifier: &DataUnifier) -> Result<ParseOutput, IngestError> {
        match self {
            ParseJob::Log(input) => Ok(ParseOutput::Logs(unifier.log_parser().parse_bytes(
                &input.content,
                &input.source,
                input.format,
            )?)),
            ParseJob::Metrics(blob) => {
                let text = decode_utf8(&blob.content, &blob.name)?;
                Ok(ParseOutput::Points(unifier.metrics_parser().parse(text)?))
            }
            ParseJob::Trace(blob) => {
                let text = decode_utf8(&blob.content, &blob.name)?;
                Ok(ParseOutput::Spans(unifier.trace_parser().parse(text)?))
            }
            ParseJob::Config { index, input } => {
                let text = decode_utf8(&input.content, &input.path)?;
                Ok(ParseOutput::Config {
                    index,
                    changes: unifier.config_parser().parse(text, input.format, &input.path)?,
                })
            }
        }
    }
}

/// Parses, unifies and stores incidents
///
/// Each blob is parsed on the blocking pool in parallel; results are joined
/// before unification, which re-sorts everything by time.
pub struct IncidentPipeline {
    unifier: Arc<DataUnifier>,
    store: Arc<dyn IncidentStore>,
    policy: FailurePolicy,
    max_blob_bytes: u64,
    limits: ContextLimits,
    default_window_minutes: Option<i64>,
    correlation_window: Duration,
}

impl IncidentPipeline {
    pub fn new(store: Arc<dyn IncidentStore>) -> Self {
        Self::from_config(&Config::default(), store)
    }

    pub fn from_config(config: &Config, store: Arc<dyn IncidentStore>) -> Self {
        Self {
            unifier: Arc::new(DataUnifier::with_metrics_parser(config.metrics_parser())),
            store,
            policy: config.pipeline.failure_policy,
            max_blob_bytes: config.max_file_size_bytes(),
            limits: config.context_limits(),
            default_window_minutes: config.unifier.time_window_minutes,
            correlation_window: config.correlation_window(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_blob_bytes(mut self, max_blob_bytes: u64) -> Self {
        self.max_blob_bytes = max_blob_bytes;
        self
    }

    pub fn store(&self) -> &Arc<dyn IncidentStore> {
        &self.store
    }

    pub fn unifier(&self) -> &DataUnifier {
        &self.unifier
    }

    pub fn context_string(&self, context: &UnifiedContext) -> String {
        context.to_context_string(&self.limits)
    }

    /// Dependency graph, error chains and change correlations over the
    /// configured correlation window; derived on demand and never stored
    pub fn enrich(&self, context: &UnifiedContext) -> ContextEnrichment {
        self.unifier.enrich(context, self.correlation_window)
    }

    /// Context narrative followed by its enrichment sections
    ///
    /// The length cap applies to the narrative; enrichment text is appended
    /// only while the total stays within it.
    pub fn narrative(&self, context: &UnifiedContext) -> String {
        let mut text = self.context_string(context);
        let enrichment = self.enrich(context);
        if !enrichment.is_empty() {
            let extra = enrichment.to_context_string();
            if text.len() + extra.len() <= self.limits.max_context_length {
                text.push_str(&extra);
            } else {
                debug!(
                    "Leaving enrichment out of incident {}: context cap reached",
                    context.incident_id
                );
            }
        }
        text
    }

    /// Ingest every blob of `request` and store the unified incident
    ///
    /// The stored record moves from `analyzing` to `completed`, or to `failed`
    /// when a blob fails under [`FailurePolicy::Abort`], a task panics, or the
    /// request is cancelled.
    pub async fn run(
        &self,
        request: IncidentRequest,
        cancel: &CancellationFlag,
    ) -> Result<IncidentRecord, PipelineError> {
        let IncidentRequest {
            incident_id,
            logs,
            metrics,
            traces,
            configs,
            deployments,
            metric_baseline,
            time_window_minutes,
            reference_time,
        } = request;

        let incident_id = incident_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut record = IncidentRecord::new(incident_id.clone());
        record.set_status(IncidentStatus::Analyzing);
        self.store.save(&incident_id, &record)?;

        let config_count = configs.len();
        let jobs: Vec<ParseJob> = logs
            .into_iter()
            .map(ParseJob::Log)
            .chain(metrics.into_iter().map(ParseJob::Metrics))
            .chain(traces.into_iter().map(ParseJob::Trace))
            .chain(
                configs
                    .into_iter()
                    .enumerate()
                    .map(|(index, input)| ParseJob::Config { index, input }),
            )
            .collect();
        info!("Incident {}: parsing {} blobs", incident_id, jobs.len());

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let source_name = job.source_name();
            let unifier = Arc::clone(&self.unifier);
            let cancel = cancel.clone();
            let max_bytes = self.max_blob_bytes;

            let handle = tokio::task::spawn_blocking(move || {
                if cancel.is_cancelled() {
                    return JobOutcome::Cancelled;
                }
                let size = job.content_len() as u64;
                if size > max_bytes {
                    return JobOutcome::Failed(IngestError::Validation(format!(
                        "blob is {} bytes, limit is {} bytes",
                        size, max_bytes
                    )));
                }
                match job.execute(&unifier) {
                    Ok(output) => JobOutcome::Done(output),
                    Err(e) => JobOutcome::Failed(e),
                }
            });
            handles.push((source_name, handle));
        }

        let mut signals = ParsedSignals {
            deployments,
            ..ParsedSignals::default()
        };
        let mut snapshots: Vec<(usize, Vec<ConfigChange>)> = Vec::new();
        let mut cancelled = 0usize;

        for (source_name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = format!("{}: {}", source_name, e);
                    self.mark_failed(&mut record, &message);
                    return Err(PipelineError::TaskFailed(message));
                }
            };

            match outcome {
                JobOutcome::Done(ParseOutput::Logs(entries)) => signals.logs.extend(entries),
                JobOutcome::Done(ParseOutput::Points(points)) => {
                    signals.metric_data_points.extend(points)
                }
                JobOutcome::Done(ParseOutput::Spans(spans)) => signals.traces.extend(spans),
                JobOutcome::Done(ParseOutput::Config { index, changes }) => {
                    snapshots.push((index, changes))
                }
                JobOutcome::Failed(error) => match self.policy {
                    FailurePolicy::Skip => {
                        warn!("Skipping {}: {}", source_name, error);
                        record.warnings.push(format!("{}: {}", source_name, error));
                    }
                    FailurePolicy::Abort => {
                        self.mark_failed(&mut record, &format!("{}: {}", source_name, error));
                        return Err(PipelineError::Ingest { source_name, error });
                    }
                },
                JobOutcome::Cancelled => {
                    debug!("Cancelled before parsing {}", source_name);
                    cancelled += 1;
                }
            }
        }

        if cancelled > 0 {
            self.mark_failed(
                &mut record,
                &format!("cancelled with {} blobs unparsed", cancelled),
            );
            return Err(PipelineError::Cancelled(incident_id));
        }

        signals.config_changes = config_changes(snapshots, config_count);

        signals.metrics = self
            .unifier
            .metrics_parser()
            .create_summaries(&signals.metric_data_points, metric_baseline.as_ref());

        let options = UnifyOptions {
            time_window_minutes: time_window_minutes.or(self.default_window_minutes),
            reference_time,
            incident_id: Some(incident_id.clone()),
        };
        let context = self.unifier.create_unified_context(signals, &options);

        record.complete(context);
        self.store.save(&incident_id, &record)?;
        info!(
            "Incident {} completed with {} warnings",
            incident_id,
            record.warnings.len()
        );
        Ok(record)
    }

    /// Send the record's context to a reasoning backend and store the answer
    ///
    /// A backend failure marks the record failed and is returned.
    pub async fn hand_off(
        &self,
        record: &mut IncidentRecord,
        backend: &dyn ReasoningBackend,
        constraints: &AnalysisConstraints,
    ) -> Result<(), PipelineError> {
        let context = record
            .context
            .as_ref()
            .ok_or_else(|| ReasoningError::MissingContext(record.incident_id.clone()))?;
        let text = self.narrative(context);
        info!(
            "Handing incident {} to {} ({} bytes of context)",
            record.incident_id,
            backend.name(),
            text.len()
        );

        match backend.analyze(&text, constraints).await {
            Ok(analysis) => {
                record.analysis = Some(analysis);
                record.set_status(IncidentStatus::Completed);
                self.store.save(&record.incident_id, record)?;
                Ok(())
            }
            Err(e) => {
                self.mark_failed(record, &e.to_string());
                Err(e.into())
            }
        }
    }

    fn mark_failed(&self, record: &mut IncidentRecord, message: &str) {
        error!("Incident {} failed: {}", record.incident_id, message);
        record.fail(message);
        if let Err(e) = self.store.save(&record.incident_id, record) {
            error!("Failed to store failed incident {}: {}", record.incident_id, e);
        }
    }
}

/// Config records for the unified context
///
/// Inputs 0 and 1 are diffed as old and new snapshots only when both parsed.
/// Otherwise the snapshots that did parse are kept as current values.
fn config_changes(
    mut snapshots: Vec<(usize, Vec<ConfigChange>)>,
    config_count: usize,
) -> Vec<ConfigChange> {
    if config_count > 2 {
        warn!(
            "{} config snapshots given, only the first two are compared",
            config_count
        );
    }
    snapshots.sort_by_key(|(index, _)| *index);

    if matches!(snapshots.as_slice(), [(0, _), (1, _), ..]) {
        debug!("Diffing config snapshots 0 and 1");
        return ConfigParser::compare(&snapshots[0].1, &snapshots[1].1);
    }
    if config_count >= 2 {
        warn!("Config snapshot 0 or 1 failed to parse, keeping snapshots without a diff");
    }
    snapshots.into_iter().flat_map(|(_, changes)| changes).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::events::ChangeType;
    use crate::reasoning::{FocusArea, MockBackend};
    use crate::store::{InMemoryIncidentStore, MockIncidentStore};
    use mockall::Sequence;

    const LOGS: &str = r#"{"timestamp": "2024-01-15T10:00:00Z", "level": "ERROR", "service": "api", "message": "db timeout"}
{"timestamp": "2024-01-15T10:00:01Z", "level": "INFO", "service": "api", "message": "retry"}
{"timestamp": "2024-01-15T10:00:02Z", "level": "CRITICAL", "service": "db", "message": "too many connections"}"#;

    const METRICS: &str = r#"[
        {"timestamp": "2024-01-15T10:00:00Z", "metric": "db_connections", "value": 10},
        {"timestamp": "2024-01-15T10:01:00Z", "metric": "db_connections", "value": 95}
    ]"#;

    const TRACES: &str = r#"[
        {"trace_id": "t", "span_id": "1", "service": "api", "operation": "GET /orders",
         "start_time": "2024-01-15T10:00:00Z", "duration_ms": 5000, "status": "OK"},
        {"trace_id": "t", "span_id": "2", "parent_span_id": "1", "service": "db",
         "operation": "SELECT", "start_time": "2024-01-15T10:00:00.5Z", "duration_ms": 4500,
         "status": "TIMEOUT"}
    ]"#;

    fn request() -> IncidentRequest {
        IncidentRequest {
            incident_id: Some("INC-1".to_string()),
            logs: vec![LogInput {
                source: "api".to_string(),
                content: LOGS.into(),
                format: LogFormat::Auto,
            }],
            metrics: vec![SourceBlob {
                name: "metrics.json".to_string(),
                content: METRICS.into(),
            }],
            traces: vec![SourceBlob {
                name: "traces.json".to_string(),
                content: TRACES.into(),
            }],
            ..IncidentRequest::default()
        }
    }

    fn bad_trace() -> SourceBlob {
        SourceBlob {
            name: "broken.json".to_string(),
            content: "{oops".into(),
        }
    }

    fn memory_pipeline() -> (Arc<InMemoryIncidentStore>, IncidentPipeline) {
        let store = Arc::new(InMemoryIncidentStore::new());
        let pipeline = IncidentPipeline::new(store.clone());
        (store, pipeline)
    }

    #[tokio::test]
    async fn test_run_completes_and_stores() {
        let (store, pipeline) = memory_pipeline();
        let record = pipeline.run(request(), &CancellationFlag::new()).await.unwrap();

        assert_eq!(record.incident_id, "INC-1");
        assert_eq!(record.status, IncidentStatus::Completed);
        assert!(record.warnings.is_empty());

        let context = record.context.as_ref().unwrap();
        assert_eq!(context.incident_id, "INC-1");
        assert_eq!(context.logs.len(), 3);
        assert_eq!(context.metrics.len(), 1);
        assert_eq!(context.traces.len(), 2);
        assert_eq!(context.error_count, 3);
        assert!(context.services_involved.contains("db"));

        assert_eq!(store.get("INC-1").unwrap(), record);
    }

    #[tokio::test]
    async fn test_generated_incident_id() {
        let (_, pipeline) = memory_pipeline();
        let request = IncidentRequest {
            incident_id: None,
            ..request()
        };
        let record = pipeline.run(request, &CancellationFlag::new()).await.unwrap();
        assert!(Uuid::parse_str(&record.incident_id).is_ok());
    }

    #[tokio::test]
    async fn test_skip_policy_keeps_good_blobs() {
        let (_, pipeline) = memory_pipeline();
        let mut request = request();
        request.traces.push(bad_trace());

        let record = pipeline.run(request, &CancellationFlag::new()).await.unwrap();

        assert_eq!(record.status, IncidentStatus::Completed);
        assert_eq!(record.warnings.len(), 1);
        assert!(record.warnings[0].starts_with("broken.json"));
        assert_eq!(record.context.unwrap().traces.len(), 2);
    }

    #[tokio::test]
    async fn test_abort_policy_fails_incident() {
        let (store, pipeline) = memory_pipeline();
        let pipeline = pipeline.with_policy(FailurePolicy::Abort);
        let mut request = request();
        request.traces.push(bad_trace());

        let result = pipeline.run(request, &CancellationFlag::new()).await;

        match result {
            Err(PipelineError::Ingest { source_name, error }) => {
                assert_eq!(source_name, "broken.json");
                assert!(error.is_parsing());
            }
            other => panic!("expected ingest error, got {:?}", other.map(|r| r.status)),
        }
        let stored = store.get("INC-1").unwrap();
        assert_eq!(stored.status, IncidentStatus::Failed);
        assert!(stored.error.unwrap().contains("broken.json"));
    }

    #[tokio::test]
    async fn test_oversize_blob_is_validation_failure() {
        let (_, pipeline) = memory_pipeline();
        let pipeline = pipeline.with_max_blob_bytes(64);

        let record = pipeline.run(request(), &CancellationFlag::new()).await.unwrap();

        // Every blob in the request is larger than 64 bytes
        assert_eq!(record.warnings.len(), 3);
        assert!(record.warnings.iter().all(|w| w.contains("limit is 64 bytes")));
        assert!(record.context.unwrap().logs.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (store, pipeline) = memory_pipeline();
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let result = pipeline.run(request(), &cancel).await;

        assert!(matches!(result, Err(PipelineError::Cancelled(ref id)) if id == "INC-1"));
        assert_eq!(store.get("INC-1").unwrap().status, IncidentStatus::Failed);
    }

    #[tokio::test]
    async fn test_two_configs_are_diffed() {
        let (_, pipeline) = memory_pipeline();
        let request = IncidentRequest {
            configs: vec![
                ConfigInput {
                    path: "old.yaml".to_string(),
                    content: "db:\n  pool_size: 50\n  host: db1\n".into(),
                    format: ConfigFormat::Auto,
                },
                ConfigInput {
                    path: "new.yaml".to_string(),
                    content: "db:\n  pool_size: 5\n  host: db1\n".into(),
                    format: ConfigFormat::Auto,
                },
            ],
            ..request()
        };

        let record = pipeline.run(request, &CancellationFlag::new()).await.unwrap();
        let changes = record.context.unwrap().config_changes;

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
        assert_eq!(changes[0].key, "db.pool_size");
        assert_eq!(changes[0].old_value.as_deref(), Some("50"));
        assert_eq!(changes[0].new_value, "5");
    }

    #[tokio::test]
    async fn test_invalid_utf8_blob_is_skipped() {
        let (_, pipeline) = memory_pipeline();
        let mut request = request();
        request.metrics.push(SourceBlob {
            name: "latin1.json".to_string(),
            content: vec![b'[', 0xE9, 0xFF, b']'],
        });
        request.logs.push(LogInput {
            source: "worker".to_string(),
            content: vec![0xFF, 0xFE, b'x'],
            format: LogFormat::Auto,
        });

        let record = pipeline.run(request, &CancellationFlag::new()).await.unwrap();

        assert_eq!(record.status, IncidentStatus::Completed);
        assert_eq!(record.warnings.len(), 2);
        assert!(record.warnings.iter().any(|w| w.starts_with("latin1.json")));
        assert!(record.warnings.iter().any(|w| w.starts_with("worker")));
        let context = record.context.unwrap();
        assert_eq!(context.logs.len(), 3);
        assert!(!context.services_involved.contains("worker"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_blob_aborts() {
        let (store, pipeline) = memory_pipeline();
        let pipeline = pipeline.with_policy(FailurePolicy::Abort);
        let mut request = request();
        request.logs[0].content = b"{\"level\": \"ERROR\", \"message\": \"caf\xE9\"}".to_vec();

        let result = pipeline.run(request, &CancellationFlag::new()).await;

        match result {
            Err(PipelineError::Ingest { source_name, error }) => {
                assert_eq!(source_name, "api");
                assert!(error.is_parsing());
            }
            other => panic!("expected ingest error, got {:?}", other.map(|r| r.status)),
        }
        assert_eq!(store.get("INC-1").unwrap().status, IncidentStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_first_config_is_not_diffed() {
        let (_, pipeline) = memory_pipeline();
        let request = IncidentRequest {
            configs: vec![
                ConfigInput {
                    path: "old.yaml".to_string(),
                    content: vec![0xFF, 0xFE],
                    format: ConfigFormat::Auto,
                },
                ConfigInput {
                    path: "new.yaml".to_string(),
                    content: "db:\n  pool_size: 5\n".into(),
                    format: ConfigFormat::Auto,
                },
                ConfigInput {
                    path: "newer.yaml".to_string(),
                    content: "db:\n  pool_size: 1\n".into(),
                    format: ConfigFormat::Auto,
                },
            ],
            ..request()
        };

        let record = pipeline.run(request, &CancellationFlag::new()).await.unwrap();

        assert_eq!(record.warnings.len(), 1);
        assert!(record.warnings[0].starts_with("old.yaml"));
        let changes = record.context.unwrap().config_changes;
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.change_type == ChangeType::Current));
    }

    #[tokio::test]
    async fn test_third_config_is_ignored_by_diff() {
        let (_, pipeline) = memory_pipeline();
        let config = |path: &str, pool: u32| ConfigInput {
            path: path.to_string(),
            content: format!("db:\n  pool_size: {}\n", pool).into(),
            format: ConfigFormat::Auto,
        };
        let request = IncidentRequest {
            configs: vec![config("a.yaml", 50), config("b.yaml", 50), config("c.yaml", 5)],
            ..request()
        };

        let record = pipeline.run(request, &CancellationFlag::new()).await.unwrap();
        assert!(record.context.unwrap().config_changes.is_empty());
    }

    #[test]
    fn test_config_changes_selection() {
        let snapshot = |key: &str, value: &str| {
            vec![ConfigChange {
                timestamp: crate::events::now(),
                file_path: "app.yaml".to_string(),
                key: key.to_string(),
                old_value: None,
                new_value: value.to_string(),
                change_type: ChangeType::Current,
            }]
        };

        let diffed = config_changes(vec![(1, snapshot("k", "2")), (0, snapshot("k", "1"))], 2);
        assert_eq!(diffed.len(), 1);
        assert_eq!(diffed[0].change_type, ChangeType::Modified);

        let kept = config_changes(vec![(1, snapshot("k", "2")), (2, snapshot("j", "3"))], 3);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|c| c.change_type == ChangeType::Current));

        assert!(config_changes(Vec::new(), 0).is_empty());
    }

    #[tokio::test]
    async fn test_checkout_outage_end_to_end() {
        let (store, pipeline) = memory_pipeline();
        let logs = [
            r#"{"timestamp": "2024-01-15T10:00:00Z", "level": "ERROR", "service": "checkout", "message": "payment failed"}"#,
            r#"{"timestamp": "2024-01-15T10:00:01Z", "level": "ERROR", "service": "checkout", "message": "payment failed"}"#,
            r#"{"timestamp": "2024-01-15T10:00:02Z", "level": "ERROR", "service": "inventory", "message": "stock lookup failed"}"#,
            r#"{"timestamp": "2024-01-15T10:00:03Z", "level": "INFO", "service": "checkout", "message": "retrying"}"#,
        ]
        .join("\n");
        let metrics = r#"[
            {"timestamp": "2024-01-15T09:59:00Z", "metric": "error_rate", "value": 0.2},
            {"timestamp": "2024-01-15T10:00:00Z", "metric": "error_rate", "value": 100.0}
        ]"#;
        let traces = r#"{"spans": [
            {"trace_id": "t1", "span_id": "s1", "service": "gateway", "operation": "POST /pay",
             "start_time": "2024-01-15T10:00:00Z", "duration_ms": 900, "status": "OK"},
            {"trace_id": "t1", "span_id": "s2", "parent_span_id": "s1", "service": "payments",
             "operation": "charge", "start_time": "2024-01-15T10:00:00.100Z", "duration_ms": 700,
             "status": "ERROR", "error": "card processor unavailable"}
        ]}"#;
        let request = IncidentRequest {
            incident_id: Some("INC-7".to_string()),
            logs: vec![LogInput {
                source: "app".to_string(),
                content: logs.into(),
                format: LogFormat::Auto,
            }],
            metrics: vec![SourceBlob {
                name: "metrics.json".to_string(),
                content: metrics.into(),
            }],
            traces: vec![SourceBlob {
                name: "traces.json".to_string(),
                content: traces.into(),
            }],
            ..IncidentRequest::default()
        };

        let record = pipeline.run(request, &CancellationFlag::new()).await.unwrap();

        let context = record.context.as_ref().unwrap();
        assert!(context.error_count >= 4);
        for service in ["checkout", "inventory", "gateway", "payments"] {
            assert!(context.services_involved.contains(service), "missing {}", service);
        }
        assert_eq!(context.metrics.len(), 1);
        assert_eq!(context.metrics[0].current_value, 100.0);
        assert_eq!(context.metric_data_points.len(), 2);

        assert_eq!(store.get("INC-7").unwrap(), record);

        let enrichment = pipeline.enrich(context);
        assert_eq!(
            enrichment.dependency_graph["gateway"],
            std::collections::BTreeSet::from(["payments".to_string()])
        );
        assert_eq!(enrichment.error_chains.len(), 1);
    }

    #[tokio::test]
    async fn test_correlation_window_from_config() {
        let deployment = DeploymentEvent {
            timestamp: crate::parsers::time::parse_timestamp("2024-01-15T09:55:00Z").unwrap(),
            service: "api".to_string(),
            version: "v2".to_string(),
            deployed_by: None,
            environment: "production".to_string(),
            status: "success".to_string(),
        };
        let with_deployment = || IncidentRequest {
            deployments: vec![deployment.clone()],
            ..request()
        };

        let (_, wide) = memory_pipeline();
        let record = wide.run(with_deployment(), &CancellationFlag::new()).await.unwrap();
        let correlations = wide.enrich(record.context.as_ref().unwrap()).correlations;
        assert_eq!(correlations.len(), 1);
        assert_eq!(correlations[0].window_minutes, 15);
        assert_eq!(correlations[0].error_logs, 2);

        let config = Config::from_toml_str("[unifier]\ncorrelation_window_minutes = 1").unwrap();
        let narrow = IncidentPipeline::from_config(&config, Arc::new(InMemoryIncidentStore::new()));
        let record = narrow.run(with_deployment(), &CancellationFlag::new()).await.unwrap();
        let correlations = narrow.enrich(record.context.as_ref().unwrap()).correlations;
        assert_eq!(correlations[0].window_minutes, 1);
        assert_eq!(correlations[0].error_logs, 0);
        assert!(!correlations[0].has_impact());
    }

    #[tokio::test]
    async fn test_single_config_is_snapshot() {
        let (_, pipeline) = memory_pipeline();
        let request = IncidentRequest {
            configs: vec![ConfigInput {
                path: ".env".to_string(),
                content: "POOL=5\nHOST=db1".into(),
                format: ConfigFormat::Auto,
            }],
            ..request()
        };

        let record = pipeline.run(request, &CancellationFlag::new()).await.unwrap();
        let changes = record.context.unwrap().config_changes;
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.change_type == ChangeType::Current));
    }

    #[tokio::test]
    async fn test_store_sees_analyzing_then_completed() {
        let mut store = MockIncidentStore::new();
        let mut seq = Sequence::new();
        store
            .expect_save()
            .withf(|id, record| id.to_string() == "INC-1" && record.status == IncidentStatus::Analyzing)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_save()
            .withf(|_, record| record.status == IncidentStatus::Completed && record.context.is_some())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let pipeline = IncidentPipeline::new(Arc::new(store));
        pipeline.run(request(), &CancellationFlag::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut store = MockIncidentStore::new();
        store
            .expect_save()
            .returning(|_, _| Err(StoreError::Poisoned));

        let pipeline = IncidentPipeline::new(Arc::new(store));
        let result = pipeline.run(request(), &CancellationFlag::new()).await;
        assert!(matches!(result, Err(PipelineError::Store(StoreError::Poisoned))));
    }

    #[tokio::test]
    async fn test_hand_off_stores_analysis() {
        let (store, pipeline) = memory_pipeline();
        let mut record = pipeline.run(request(), &CancellationFlag::new()).await.unwrap();
        let backend = MockBackend::success("Connection pool exhausted after config change");
        let constraints = AnalysisConstraints {
            focus_area: Some(FocusArea::Configuration),
            include_summary: false,
        };

        pipeline
            .hand_off(&mut record, &backend, &constraints)
            .await
            .unwrap();

        assert_eq!(
            record.analysis.as_deref(),
            Some("Connection pool exhausted after config change")
        );
        assert_eq!(store.get("INC-1").unwrap().analysis, record.analysis);

        let (context, sent) = backend.last_call().unwrap();
        assert!(context.starts_with("## INCIDENT TIMELINE"));
        assert!(context.contains("too many connections"));
        assert_eq!(sent, constraints);
        assert!(context.contains("## SERVICE DEPENDENCIES\napi -> db"));
    }

    #[tokio::test]
    async fn test_narrative_respects_cap() {
        let config = Config::from_toml_str("[context]\nmax_context_length = 300").unwrap();
        let pipeline = IncidentPipeline::from_config(&config, Arc::new(InMemoryIncidentStore::new()));
        let record = pipeline.run(request(), &CancellationFlag::new()).await.unwrap();

        let text = pipeline.narrative(record.context.as_ref().unwrap());
        assert!(text.len() <= 300);
        assert!(!text.contains("## SERVICE DEPENDENCIES"));
    }

    #[tokio::test]
    async fn test_hand_off_backend_failure() {
        let (store, pipeline) = memory_pipeline();
        let mut record = pipeline.run(request(), &CancellationFlag::new()).await.unwrap();
        let backend = MockBackend::error("quota exceeded");

        let result = pipeline
            .hand_off(&mut record, &backend, &AnalysisConstraints::default())
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Reasoning(ReasoningError::BackendError(_)))
        ));
        assert_eq!(store.get("INC-1").unwrap().status, IncidentStatus::Failed);
    }

    #[tokio::test]
    async fn test_hand_off_without_context() {
        let (_, pipeline) = memory_pipeline();
        let mut record = IncidentRecord::new("empty");
        let backend = MockBackend::success("unused");

        let result = pipeline
            .hand_off(&mut record, &backend, &AnalysisConstraints::default())
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Reasoning(ReasoningError::MissingContext(ref id))) if id == "empty"
        ));
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_cancellation_flag_is_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
