use crate::events::{
    now, ChangeType, ConfigChange, DeploymentEvent, LogEntry, LogLevel, MetricDataPoint,
    MetricSummary, Timestamp, TraceSpan,
};
use crate::parsers::{ConfigParser, LogParser, MetricsParser, TraceParser};
use crate::unifier::context::{SummaryStats, UnifiedContext};
use chrono::Duration;
use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

/// Records produced by the parsers, before unification
#[derive(Debug, Clone, Default)]
pub struct ParsedSignals {
    pub logs: Vec<LogEntry>,
    pub metrics: Vec<MetricSummary>,
    pub metric_data_points: Vec<MetricDataPoint>,
    pub traces: Vec<TraceSpan>,
    pub config_changes: Vec<ConfigChange>,
    pub deployments: Vec<DeploymentEvent>,
}

/// Largest accepted look-back window: ten years
pub const MAX_TIME_WINDOW_MINUTES: i64 = 10 * 365 * 24 * 60;

#[derive(Debug, Clone, Default)]
pub struct UnifyOptions {
    /// Drop records older than this many minutes before `reference_time`
    pub time_window_minutes: Option<i64>,
    /// Anchor of the window; the current instant when unset
    pub reference_time: Option<Timestamp>,
    /// Caller-supplied incident id; a UUID is generated otherwise
    pub incident_id: Option<String>,
}

/// What [`DataUnifier::filter_by_severity`] keeps
#[derive(Debug, Clone, Copy)]
pub struct SeverityFilter {
    pub min_level: LogLevel,
    /// Keep only anomalous metric summaries
    pub anomalies_only: bool,
    /// Keep only ERROR / TIMEOUT spans
    pub failed_spans_only: bool,
}

impl Default for SeverityFilter {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Warning,
            anomalies_only: true,
            failed_spans_only: true,
        }
    }
}

/// The event a correlation window opens after
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrelationTrigger {
    Deployment {
        service: String,
        version: String,
    },
    ConfigChange {
        file_path: String,
        key: String,
        change_type: ChangeType,
    },
}

/// Failures observed shortly after a deployment or config change
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TemporalCorrelation {
    pub trigger: CorrelationTrigger,
    pub timestamp: Timestamp,
    pub window_minutes: i64,
    pub error_logs: usize,
    pub failed_spans: usize,
    pub anomalous_metrics: Vec<String>,
}

impl TemporalCorrelation {
    pub fn has_impact(&self) -> bool {
        self.error_logs > 0 || self.failed_spans > 0 || !self.anomalous_metrics.is_empty()
    }
}

/// Derived artifacts; never stored on the context or the incident record
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ContextEnrichment {
    pub dependency_graph: BTreeMap<String, BTreeSet<String>>,
    pub error_chains: Vec<Vec<TraceSpan>>,
    pub correlations: Vec<TemporalCorrelation>,
}

impl ContextEnrichment {
    pub fn is_empty(&self) -> bool {
        self.dependency_graph.is_empty() && self.error_chains.is_empty() && self.correlations.is_empty()
    }

    /// Text appended after the context narrative; empty sections are left out
    pub fn to_context_string(&self) -> String {
        let mut out = String::new();

        if !self.dependency_graph.is_empty() {
            out.push_str("## SERVICE DEPENDENCIES\n");
            for (caller, callees) in &self.dependency_graph {
                let callees: Vec<&str> = callees.iter().map(String::as_str).collect();
                out.push_str(&format!("{} -> {}\n", caller, callees.join(", ")));
            }
            out.push('\n');
        }

        if !self.error_chains.is_empty() {
            out.push_str("## ERROR CHAINS\n");
            for chain in &self.error_chains {
                let hops: Vec<String> = chain
                    .iter()
                    .map(|span| format!("{}.{}", span.service, span.operation))
                    .collect();
                let trace_id = chain.first().map(|span| span.trace_id.as_str()).unwrap_or("");
                out.push_str(&format!("[{}] {}\n", trace_id, hops.join(" -> ")));
                if let Some(error) = chain.last().and_then(|span| span.error.as_deref()) {
                    out.push_str(&format!("  Error: {}\n", error));
                }
            }
            out.push('\n');
        }

        if !self.correlations.is_empty() {
            out.push_str("## CHANGE CORRELATIONS\n");
            for correlation in &self.correlations {
                let trigger = match &correlation.trigger {
                    CorrelationTrigger::Deployment { service, version } => {
                        format!("{} deployed {}", service, version)
                    }
                    CorrelationTrigger::ConfigChange {
                        file_path,
                        key,
                        change_type,
                    } => format!("{}: {} {}", file_path, key, change_type.as_str()),
                };
                out.push_str(&format!(
                    "[{}] {}: {} error logs, {} failed spans within {} minutes",
                    correlation.timestamp,
                    trigger,
                    correlation.error_logs,
                    correlation.failed_spans,
                    correlation.window_minutes
                ));
                if !correlation.anomalous_metrics.is_empty() {
                    out.push_str(&format!(
                        ", anomalies: {}",
                        correlation.anomalous_metrics.join(", ")
                    ));
                }
                out.push('\n');
            }
            out.push('\n');
        }

        out
    }
}

/// Combines parsed signals into one time-ordered [`UnifiedContext`]
pub struct DataUnifier {
    log_parser: LogParser,
    metrics_parser: MetricsParser,
    config_parser: ConfigParser,
    trace_parser: TraceParser,
}

impl Default for DataUnifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DataUnifier {
    pub fn new() -> Self {
        Self::with_metrics_parser(MetricsParser::new())
    }

    /// Use a metrics parser with custom anomaly thresholds
    pub fn with_metrics_parser(metrics_parser: MetricsParser) -> Self {
        Self {
            log_parser: LogParser::new(),
            metrics_parser,
            config_parser: ConfigParser::new(),
            trace_parser: TraceParser::new(),
        }
    }

    pub fn log_parser(&self) -> &LogParser {
        &self.log_parser
    }

    pub fn metrics_parser(&self) -> &MetricsParser {
        &self.metrics_parser
    }

    pub fn config_parser(&self) -> &ConfigParser {
        &self.config_parser
    }

    pub fn trace_parser(&self) -> &TraceParser {
        &self.trace_parser
    }

    /// Window, sort and summarize parsed signals into a context
    pub fn create_unified_context(
        &self,
        signals: ParsedSignals,
        options: &UnifyOptions,
    ) -> UnifiedContext {
        let ParsedSignals {
            mut logs,
            mut metrics,
            mut metric_data_points,
            mut traces,
            mut config_changes,
            mut deployments,
        } = signals;

        if let Some(minutes) = options.time_window_minutes.filter(|m| *m > 0) {
            let anchor = options.reference_time.unwrap_or_else(now);
            match window_cutoff(anchor, minutes) {
                Some(cutoff) => {
                    debug!("Applying {} minute window, cutoff {}", minutes, cutoff);
                    logs.retain(|log| log.timestamp >= cutoff);
                    metrics.retain(|m| m.start_time >= cutoff);
                    metric_data_points.retain(|p| p.timestamp >= cutoff);
                    traces.retain(|t| t.start_time >= cutoff);
                    config_changes.retain(|c| c.timestamp >= cutoff);
                    deployments.retain(|d| d.timestamp >= cutoff);
                }
                None => debug!(
                    "{} minute window reaches past the earliest representable time, keeping all records",
                    minutes
                ),
            }
        }

        // DateTime<FixedOffset> orders by instant, whatever the offset
        logs.sort_by_key(|log| log.timestamp);
        metrics.sort_by_key(|m| m.start_time);
        metric_data_points.sort_by_key(|p| p.timestamp);
        traces.sort_by_key(|t| t.start_time);
        config_changes.sort_by_key(|c| c.timestamp);
        deployments.sort_by_key(|d| d.timestamp);

        let bounds = logs
            .iter()
            .map(|log| log.timestamp)
            .chain(metrics.iter().flat_map(|m| [m.start_time, m.end_time]))
            .chain(traces.iter().flat_map(|t| [t.start_time, t.end_time]))
            .fold(None, |acc: Option<(Timestamp, Timestamp)>, ts| match acc {
                None => Some((ts, ts)),
                Some((lo, hi)) => Some((lo.min(ts), hi.max(ts))),
            });
        let (time_range_start, time_range_end) = bounds.unwrap_or_else(|| {
            let instant = now();
            (instant, instant)
        });

        let services_involved: BTreeSet<String> = logs
            .iter()
            .map(|log| log.service.clone())
            .chain(traces.iter().map(|t| t.service.clone()))
            .chain(deployments.iter().map(|d| d.service.clone()))
            .collect();

        let error_count = count_errors(&logs, &traces);

        let incident_id = options
            .incident_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        info!(
            "Unified incident {}: {} logs, {} metrics, {} spans, {} config changes, {} deployments, {} errors",
            incident_id,
            logs.len(),
            metrics.len(),
            traces.len(),
            config_changes.len(),
            deployments.len(),
            error_count
        );

        UnifiedContext {
            incident_id,
            time_range_start,
            time_range_end,
            logs,
            metrics,
            metric_data_points,
            traces,
            config_changes,
            deployment_events: deployments,
            services_involved,
            error_count,
        }
    }

    /// Narrowed copy of a context; config changes and deployments are kept whole
    pub fn filter_by_severity(
        &self,
        context: &UnifiedContext,
        filter: &SeverityFilter,
    ) -> UnifiedContext {
        let logs: Vec<LogEntry> = context
            .logs
            .iter()
            .filter(|log| log.level >= filter.min_level)
            .cloned()
            .collect();

        let metrics: Vec<MetricSummary> = context
            .metrics
            .iter()
            .filter(|m| !filter.anomalies_only || m.anomaly_detected)
            .cloned()
            .collect();
        let kept_metrics: HashSet<&str> = metrics.iter().map(|m| m.metric_name.as_str()).collect();
        let metric_data_points = context
            .metric_data_points
            .iter()
            .filter(|p| kept_metrics.contains(p.metric_name.as_str()))
            .cloned()
            .collect();

        let traces: Vec<TraceSpan> = context
            .traces
            .iter()
            .filter(|t| !filter.failed_spans_only || t.status.is_failure())
            .cloned()
            .collect();

        let error_count = count_errors(&logs, &traces);

        UnifiedContext {
            incident_id: context.incident_id.clone(),
            time_range_start: context.time_range_start,
            time_range_end: context.time_range_end,
            logs,
            metrics,
            metric_data_points,
            traces,
            config_changes: context.config_changes.clone(),
            deployment_events: context.deployment_events.clone(),
            services_involved: context.services_involved.clone(),
            error_count,
        }
    }

    /// Dependency graph, error chains and change correlations for a context
    pub fn enrich(&self, context: &UnifiedContext, correlation_window: Duration) -> ContextEnrichment {
        let dependency_graph = TraceParser::build_dependency_graph(&context.traces);
        let error_chains = TraceParser::find_error_chains(&context.traces);
        let correlations = Self::correlate(context, correlation_window);

        info!(
            "Enriched incident {}: {} services in dependency graph, {} error chains, {} correlations",
            context.incident_id,
            dependency_graph.len(),
            error_chains.len(),
            correlations.len()
        );

        ContextEnrichment {
            dependency_graph,
            error_chains,
            correlations,
        }
    }

    /// For each deployment and non-snapshot config change, count failures in
    /// `[change, change + window]`
    pub fn correlate(context: &UnifiedContext, window: Duration) -> Vec<TemporalCorrelation> {
        let deployments = context.deployment_events.iter().map(|d| {
            (
                d.timestamp,
                CorrelationTrigger::Deployment {
                    service: d.service.clone(),
                    version: d.version.clone(),
                },
            )
        });
        let changes = context
            .config_changes
            .iter()
            .filter(|c| c.change_type != ChangeType::Current)
            .map(|c| {
                (
                    c.timestamp,
                    CorrelationTrigger::ConfigChange {
                        file_path: c.file_path.clone(),
                        key: c.key.clone(),
                        change_type: c.change_type,
                    },
                )
            });

        let mut correlations: Vec<TemporalCorrelation> = deployments
            .chain(changes)
            .map(|(start, trigger)| {
                // No representable end means the window runs open-ended
                let end = start.checked_add_signed(window);
                let in_window = |ts: Timestamp| ts >= start && end.map_or(true, |end| ts <= end);

                TemporalCorrelation {
                    trigger,
                    timestamp: start,
                    window_minutes: window.num_minutes(),
                    error_logs: context
                        .error_logs()
                        .filter(|log| in_window(log.timestamp))
                        .count(),
                    failed_spans: context
                        .traces
                        .iter()
                        .filter(|t| t.status.is_failure() && in_window(t.start_time))
                        .count(),
                    anomalous_metrics: context
                        .metrics
                        .iter()
                        .filter(|m| {
                            m.anomaly_detected
                                && end.map_or(true, |end| m.start_time <= end)
                                && m.end_time >= start
                        })
                        .map(|m| m.metric_name.clone())
                        .collect(),
                }
            })
            .collect();

        correlations.sort_by_key(|c| c.timestamp);
        correlations
    }

    pub fn summary_stats(&self, context: &UnifiedContext) -> SummaryStats {
        context.summary_stats()
    }
}

/// `anchor - minutes`, or `None` when either step leaves chrono's range
fn window_cutoff(anchor: Timestamp, minutes: i64) -> Option<Timestamp> {
    Duration::try_minutes(minutes).and_then(|window| anchor.checked_sub_signed(window))
}

/// ERROR/CRITICAL logs plus ERROR/TIMEOUT spans
fn count_errors(logs: &[LogEntry], traces: &[TraceSpan]) -> usize {
    logs.iter().filter(|log| log.level.is_error()).count()
        + traces.iter().filter(|t| t.status.is_failure()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SpanStatus;
    use crate::parsers::time::parse_timestamp;
    use serde_json::Map;

    fn ts(s: &str) -> Timestamp {
        parse_timestamp(s).unwrap()
    }

    fn log_at(timestamp: Timestamp, level: LogLevel, service: &str) -> LogEntry {
        LogEntry {
            timestamp,
            level,
            service: service.to_string(),
            message: format!("{} event", service),
            trace_id: None,
            span_id: None,
            metadata: Map::new(),
            raw: String::new(),
        }
    }

    fn span_at(start: Timestamp, service: &str, status: SpanStatus) -> TraceSpan {
        TraceSpan {
            trace_id: "t".to_string(),
            span_id: service.to_string(),
            parent_span_id: None,
            service: service.to_string(),
            operation: "op".to_string(),
            start_time: start,
            end_time: start + Duration::milliseconds(250),
            duration_ms: 250.0,
            status,
            tags: BTreeMap::new(),
            error: None,
        }
    }

    fn deployment_at(timestamp: Timestamp, service: &str) -> DeploymentEvent {
        DeploymentEvent {
            timestamp,
            service: service.to_string(),
            version: "v2".to_string(),
            deployed_by: Some("ci".to_string()),
            environment: "production".to_string(),
            status: "success".to_string(),
        }
    }

    #[test]
    fn test_time_window_keeps_recent_records() {
        let anchor = ts("2024-01-15T12:00:00Z");
        let signals = ParsedSignals {
            logs: vec![
                log_at(anchor - Duration::minutes(5), LogLevel::Error, "a"),
                log_at(anchor - Duration::minutes(20), LogLevel::Error, "b"),
                log_at(anchor - Duration::minutes(40), LogLevel::Error, "c"),
            ],
            deployments: vec![deployment_at(anchor - Duration::minutes(40), "old")],
            ..ParsedSignals::default()
        };
        let options = UnifyOptions {
            time_window_minutes: Some(30),
            reference_time: Some(anchor),
            incident_id: None,
        };

        let context = DataUnifier::new().create_unified_context(signals, &options);

        let services: Vec<&str> = context.logs.iter().map(|l| l.service.as_str()).collect();
        assert_eq!(services, vec!["b", "a"]);
        assert!(context.deployment_events.is_empty());
        assert!(!context.services_involved.contains("old"));
    }

    #[test]
    fn test_window_compares_instants_across_offsets() {
        let anchor = ts("2024-01-15T12:00:00Z");
        // 13:50 at +02:00 is 11:50Z, inside a 30 minute window
        let inside = ts("2024-01-15T13:50:00+02:00");
        // 07:20 at -04:00 is 11:20Z, outside
        let outside = ts("2024-01-15T07:20:00-04:00");
        let signals = ParsedSignals {
            logs: vec![
                log_at(inside, LogLevel::Info, "in"),
                log_at(outside, LogLevel::Info, "out"),
            ],
            ..ParsedSignals::default()
        };
        let options = UnifyOptions {
            time_window_minutes: Some(30),
            reference_time: Some(anchor),
            incident_id: None,
        };

        let context = DataUnifier::new().create_unified_context(signals, &options);
        assert_eq!(context.logs.len(), 1);
        assert_eq!(context.logs[0].service, "in");
        assert_eq!(context.logs[0].timestamp.offset().local_minus_utc(), 7200);
    }

    #[test]
    fn test_empty_context_defaults_to_now() {
        let before = now();
        let context =
            DataUnifier::new().create_unified_context(ParsedSignals::default(), &UnifyOptions::default());
        assert!(context.time_range_start >= before);
        assert_eq!(context.time_range_start, context.time_range_end);
        assert_eq!(context.error_count, 0);
        assert!(context.services_involved.is_empty());
        assert!(Uuid::parse_str(&context.incident_id).is_ok());
    }

    #[test]
    fn test_time_range_spans_logs_metrics_and_traces() {
        let base = ts("2024-01-15T10:00:00Z");
        let signals = ParsedSignals {
            logs: vec![log_at(base + Duration::minutes(1), LogLevel::Info, "api")],
            metrics: vec![MetricSummary {
                metric_name: "cpu".to_string(),
                start_time: base,
                end_time: base + Duration::minutes(2),
                min_value: 1.0,
                max_value: 1.0,
                avg_value: 1.0,
                current_value: 1.0,
                anomaly_detected: false,
                change_percent: None,
            }],
            traces: vec![span_at(base + Duration::minutes(3), "db", SpanStatus::Ok)],
            // Deployments do not widen the range
            deployments: vec![deployment_at(base - Duration::hours(1), "api")],
            ..ParsedSignals::default()
        };

        let context = DataUnifier::new().create_unified_context(signals, &UnifyOptions::default());
        assert_eq!(context.time_range_start, base);
        assert_eq!(
            context.time_range_end,
            base + Duration::minutes(3) + Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_services_and_error_count() {
        let base = ts("2024-01-15T10:00:00Z");
        let signals = ParsedSignals {
            logs: vec![
                log_at(base, LogLevel::Error, "api"),
                log_at(base, LogLevel::Critical, "api"),
                log_at(base, LogLevel::Warning, "worker"),
            ],
            traces: vec![
                span_at(base, "db", SpanStatus::Error),
                span_at(base, "cache", SpanStatus::Timeout),
                span_at(base, "api", SpanStatus::Other("CANCELLED".to_string())),
            ],
            deployments: vec![deployment_at(base, "billing")],
            ..ParsedSignals::default()
        };
        let options = UnifyOptions {
            incident_id: Some("INC-42".to_string()),
            ..UnifyOptions::default()
        };

        let context = DataUnifier::new().create_unified_context(signals, &options);
        assert_eq!(context.incident_id, "INC-42");
        assert_eq!(context.error_count, 4);
        let services: Vec<&str> = context.services_involved.iter().map(String::as_str).collect();
        assert_eq!(services, vec!["api", "billing", "cache", "db", "worker"]);
    }

    #[test]
    fn test_oversized_window_keeps_everything() {
        let anchor = ts("2024-01-15T12:00:00Z");
        let signals = || ParsedSignals {
            logs: vec![
                log_at(anchor - Duration::days(3650), LogLevel::Error, "old"),
                log_at(anchor, LogLevel::Error, "new"),
            ],
            deployments: vec![deployment_at(anchor - Duration::days(400), "api")],
            ..ParsedSignals::default()
        };

        for minutes in [i64::MAX, 1_000_000_000_000, 500_000_000_000] {
            let options = UnifyOptions {
                time_window_minutes: Some(minutes),
                reference_time: Some(anchor),
                incident_id: None,
            };
            let context = DataUnifier::new().create_unified_context(signals(), &options);
            assert_eq!(context.logs.len(), 2, "window of {} minutes", minutes);
            assert_eq!(context.deployment_events.len(), 1);
        }
    }

    #[test]
    fn test_window_cutoff_bounds() {
        let anchor = ts("2024-01-15T12:00:00Z");
        assert_eq!(window_cutoff(anchor, 30), Some(anchor - Duration::minutes(30)));
        assert!(window_cutoff(anchor, MAX_TIME_WINDOW_MINUTES).is_some());
        assert_eq!(window_cutoff(anchor, i64::MAX), None);
    }

    #[test]
    fn test_enrichment_links_failing_child() {
        let base = ts("2024-01-15T10:00:00Z");
        let mut root = span_at(base, "gateway", SpanStatus::Ok);
        root.span_id = "s1".to_string();
        let mut child = span_at(base + Duration::milliseconds(100), "payments", SpanStatus::Error);
        child.span_id = "s2".to_string();
        child.parent_span_id = Some("s1".to_string());

        let unifier = DataUnifier::new();
        let context = unifier.create_unified_context(
            ParsedSignals {
                traces: vec![root, child],
                deployments: vec![deployment_at(base - Duration::minutes(1), "payments")],
                ..ParsedSignals::default()
            },
            &UnifyOptions::default(),
        );
        let enrichment = unifier.enrich(&context, Duration::minutes(15));

        assert_eq!(
            enrichment.dependency_graph["gateway"],
            BTreeSet::from(["payments".to_string()])
        );
        assert_eq!(enrichment.error_chains.len(), 1);
        assert_eq!(enrichment.correlations.len(), 1);
        assert_eq!(enrichment.correlations[0].failed_spans, 1);

        let text = enrichment.to_context_string();
        assert!(text.contains("## SERVICE DEPENDENCIES\ngateway -> payments"));
        assert!(text.contains("[t] gateway.op -> payments.op"));
        assert!(text.contains("payments deployed v2: 0 error logs, 1 failed spans within 15 minutes"));
        assert!(ContextEnrichment::default().to_context_string().is_empty());
        assert!(ContextEnrichment::default().is_empty());
    }

    #[test]
    fn test_correlate_with_unbounded_window() {
        let base = ts("2024-01-15T10:00:00Z");
        let context = DataUnifier::new().create_unified_context(
            ParsedSignals {
                logs: vec![log_at(base + Duration::days(30), LogLevel::Error, "api")],
                deployments: vec![deployment_at(base, "api")],
                ..ParsedSignals::default()
            },
            &UnifyOptions::default(),
        );
        let correlations = DataUnifier::correlate(&context, Duration::MAX);
        assert_eq!(correlations.len(), 1);
        assert_eq!(correlations[0].error_logs, 1);
    }

    #[test]
    fn test_filter_by_severity() {
        let base = ts("2024-01-15T10:00:00Z");
        let summary = |name: &str, anomaly: bool| MetricSummary {
            metric_name: name.to_string(),
            start_time: base,
            end_time: base,
            min_value: 0.0,
            max_value: 0.0,
            avg_value: 0.0,
            current_value: 0.0,
            anomaly_detected: anomaly,
            change_percent: None,
        };
        let point = |name: &str| MetricDataPoint {
            timestamp: base,
            metric_name: name.to_string(),
            value: 0.0,
            unit: None,
            tags: BTreeMap::new(),
        };
        let signals = ParsedSignals {
            logs: vec![
                log_at(base, LogLevel::Debug, "a"),
                log_at(base, LogLevel::Warning, "a"),
                log_at(base, LogLevel::Error, "a"),
            ],
            metrics: vec![summary("cpu", false), summary("latency", true)],
            metric_data_points: vec![point("cpu"), point("latency")],
            traces: vec![
                span_at(base, "ok", SpanStatus::Ok),
                span_at(base, "bad", SpanStatus::Error),
            ],
            ..ParsedSignals::default()
        };

        let unifier = DataUnifier::new();
        let context = unifier.create_unified_context(signals, &UnifyOptions::default());
        let narrowed = unifier.filter_by_severity(&context, &SeverityFilter::default());

        assert_eq!(narrowed.logs.len(), 2);
        assert_eq!(narrowed.metrics.len(), 1);
        assert_eq!(narrowed.metrics[0].metric_name, "latency");
        assert_eq!(narrowed.metric_data_points.len(), 1);
        assert_eq!(narrowed.traces.len(), 1);
        assert_eq!(narrowed.error_count, 2);
        assert_eq!(narrowed.incident_id, context.incident_id);
        // Original untouched
        assert_eq!(context.logs.len(), 3);
        assert_eq!(context.traces.len(), 2);
    }

    #[test]
    fn test_correlate_counts_failures_after_change() {
        let deploy_time = ts("2024-01-15T10:00:00Z");
        let context = DataUnifier::new().create_unified_context(
            ParsedSignals {
                logs: vec![
                    log_at(deploy_time - Duration::minutes(1), LogLevel::Error, "api"),
                    log_at(deploy_time + Duration::minutes(2), LogLevel::Error, "api"),
                    log_at(deploy_time + Duration::minutes(30), LogLevel::Error, "api"),
                ],
                traces: vec![span_at(deploy_time + Duration::minutes(5), "db", SpanStatus::Timeout)],
                config_changes: vec![
                    ConfigChange {
                        timestamp: deploy_time + Duration::minutes(20),
                        file_path: "app.yaml".to_string(),
                        key: "pool.size".to_string(),
                        old_value: Some("50".to_string()),
                        new_value: "5".to_string(),
                        change_type: ChangeType::Modified,
                    },
                    ConfigChange {
                        timestamp: deploy_time,
                        file_path: "app.yaml".to_string(),
                        key: "snapshot".to_string(),
                        old_value: None,
                        new_value: "x".to_string(),
                        change_type: ChangeType::Current,
                    },
                ],
                deployments: vec![deployment_at(deploy_time, "api")],
                ..ParsedSignals::default()
            },
            &UnifyOptions::default(),
        );

        let correlations = DataUnifier::correlate(&context, Duration::minutes(15));
        assert_eq!(correlations.len(), 2);

        let deployment = &correlations[0];
        assert!(matches!(deployment.trigger, CorrelationTrigger::Deployment { .. }));
        assert_eq!(deployment.error_logs, 1);
        assert_eq!(deployment.failed_spans, 1);
        assert!(deployment.has_impact());

        let config = &correlations[1];
        assert_eq!(config.error_logs, 1);
        assert_eq!(config.failed_spans, 0);
        assert_eq!(config.window_minutes, 15);
    }
}
