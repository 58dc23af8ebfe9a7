use crate::events::{
    ChangeType, ConfigChange, DeploymentEvent, LogEntry, MetricDataPoint, MetricSummary,
    Timestamp, TraceSpan,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const TRUNCATION_MARKER: &str = "\n... [context truncated]";

/// All signals for one incident, ordered by time
///
/// Built by [`DataUnifier`](super::DataUnifier) and not modified afterwards;
/// narrowing operations return a new context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnifiedContext {
    pub incident_id: String,
    pub time_range_start: Timestamp,
    pub time_range_end: Timestamp,
    pub logs: Vec<LogEntry>,
    pub metrics: Vec<MetricSummary>,
    #[serde(default)]
    pub metric_data_points: Vec<MetricDataPoint>,
    pub traces: Vec<TraceSpan>,
    pub config_changes: Vec<ConfigChange>,
    pub deployment_events: Vec<DeploymentEvent>,
    pub services_involved: BTreeSet<String>,
    pub error_count: usize,
}

/// Caps applied when projecting a context to text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_error_logs: usize,
    pub max_error_traces: usize,
    /// Overall length cap in bytes
    pub max_context_length: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_error_logs: 50,
            max_error_traces: 20,
            max_context_length: 100_000,
        }
    }
}

/// Read-only counts over a context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryStats {
    pub incident_id: String,
    pub total_logs: usize,
    pub error_logs: usize,
    pub total_metrics: usize,
    pub anomalous_metrics: usize,
    pub total_traces: usize,
    pub error_traces: usize,
    pub config_changes: usize,
    pub deployments: usize,
    pub services_involved: Vec<String>,
    pub time_range_start: Timestamp,
    pub time_range_end: Timestamp,
}

impl UnifiedContext {
    pub fn error_logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter().filter(|log| log.level.is_error())
    }

    /// Spans whose status is anything but OK
    pub fn non_ok_traces(&self) -> impl Iterator<Item = &TraceSpan> {
        self.traces.iter().filter(|span| !span.status.is_ok())
    }

    pub fn summary_stats(&self) -> SummaryStats {
        SummaryStats {
            incident_id: self.incident_id.clone(),
            total_logs: self.logs.len(),
            error_logs: self.error_logs().count(),
            total_metrics: self.metrics.len(),
            anomalous_metrics: self.metrics.iter().filter(|m| m.anomaly_detected).count(),
            total_traces: self.traces.len(),
            error_traces: self
                .traces
                .iter()
                .filter(|t| t.status == crate::events::SpanStatus::Error)
                .count(),
            config_changes: self.config_changes.len(),
            deployments: self.deployment_events.len(),
            services_involved: self.services_involved.iter().cloned().collect(),
            time_range_start: self.time_range_start,
            time_range_end: self.time_range_end,
        }
    }

    /// Narrative text handed to the reasoning backend
    ///
    /// Sections in order: timeline header, deployments, configuration changes,
    /// metric summaries, error logs (capped), non-OK traces (capped). Empty
    /// sections are left out.
    pub fn to_context_string(&self, limits: &ContextLimits) -> String {
        let mut out = String::new();

        let services: Vec<&str> = self.services_involved.iter().map(String::as_str).collect();
        out.push_str("## INCIDENT TIMELINE\n");
        out.push_str(&format!(
            "Time Range: {} to {}\n",
            self.time_range_start, self.time_range_end
        ));
        out.push_str(&format!("Services Involved: {}\n", services.join(", ")));
        out.push_str(&format!("Total Errors: {}\n\n", self.error_count));

        if !self.deployment_events.is_empty() {
            out.push_str("## DEPLOYMENT EVENTS\n");
            for event in &self.deployment_events {
                out.push_str(&format!(
                    "[{}] {} deployed version {} (status: {})\n",
                    event.timestamp, event.service, event.version, event.status
                ));
            }
            out.push('\n');
        }

        if !self.config_changes.is_empty() {
            out.push_str("## CONFIGURATION CHANGES\n");
            for change in &self.config_changes {
                match change.change_type {
                    ChangeType::Current => out.push_str(&format!(
                        "[{}] {}: {} = {}\n",
                        change.timestamp, change.file_path, change.key, change.new_value
                    )),
                    change_type => out.push_str(&format!(
                        "[{}] {}: {} {} -> {} ({})\n",
                        change.timestamp,
                        change.file_path,
                        change.key,
                        change.old_value.as_deref().unwrap_or("(unset)"),
                        change.new_value,
                        change_type.as_str()
                    )),
                }
            }
            out.push('\n');
        }

        if !self.metrics.is_empty() {
            out.push_str("## METRICS SUMMARY\n");
            for metric in &self.metrics {
                let change = metric
                    .change_percent
                    .filter(|pct| *pct != 0.0)
                    .map(|pct| format!(" ({:+.1}%)", pct))
                    .unwrap_or_default();
                let anomaly = if metric.anomaly_detected {
                    " [ANOMALY]"
                } else {
                    ""
                };
                out.push_str(&format!(
                    "{}: {} (min: {}, max: {}, avg: {:.2}){}{}\n",
                    metric.metric_name,
                    metric.current_value,
                    metric.min_value,
                    metric.max_value,
                    metric.avg_value,
                    change,
                    anomaly
                ));
            }
            out.push('\n');
        }

        let error_logs: Vec<&LogEntry> = self.error_logs().collect();
        if !error_logs.is_empty() {
            out.push_str("## ERROR LOGS\n");
            for log in error_logs.iter().take(limits.max_error_logs) {
                out.push_str(&format!(
                    "[{}] [{}] {}: {}\n",
                    log.timestamp, log.level, log.service, log.message
                ));
            }
            if error_logs.len() > limits.max_error_logs {
                out.push_str(&format!(
                    "... {} more error logs\n",
                    error_logs.len() - limits.max_error_logs
                ));
            }
            out.push('\n');
        }

        let failed: Vec<&TraceSpan> = self.non_ok_traces().collect();
        if !failed.is_empty() {
            out.push_str("## TRACE ANALYSIS\n");
            for span in failed.iter().take(limits.max_error_traces) {
                out.push_str(&format!(
                    "[{}] {}.{} ({}ms) - {}\n",
                    span.start_time, span.service, span.operation, span.duration_ms, span.status
                ));
                if let Some(error) = &span.error {
                    out.push_str(&format!("  Error: {}\n", error));
                }
            }
            if failed.len() > limits.max_error_traces {
                out.push_str(&format!(
                    "... {} more failed spans\n",
                    failed.len() - limits.max_error_traces
                ));
            }
            out.push('\n');
        }

        truncate_context(out, limits.max_context_length)
    }
}

/// Cut at a char boundary so the result never exceeds `max_len`
///
/// The marker is appended only when it fits; a cap smaller than the marker
/// gets a plain cut.
fn truncate_context(mut text: String, max_len: usize) -> String {
    if text.len() <= max_len {
        return text;
    }
    let marker = if max_len >= TRUNCATION_MARKER.len() {
        TRUNCATION_MARKER
    } else {
        ""
    };
    let mut cut = max_len - marker.len();
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(marker);
    text
}
