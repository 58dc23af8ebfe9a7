//! Core record types for incident ingestion
//!
//! This module defines the typed records produced by the parsers and carried
//! through unification: log entries, metric points and summaries, trace spans,
//! configuration changes and deployment events.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type for every record
///
/// The original UTC offset is kept so a record can be reproduced exactly.
/// Ordering and equality compare the underlying instant, so records carrying
/// different offsets sort correctly against each other. Inputs without an
/// offset are read as UTC.
pub type Timestamp = DateTime<FixedOffset>;

/// Current instant as a [`Timestamp`]
pub fn now() -> Timestamp {
    Utc::now().fixed_offset()
}

/// Log severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    /// Also covers CRIT and FATAL
    Critical,
}

impl LogLevel {
    /// Map a level keyword onto the five-level scale
    ///
    /// Case-insensitive. WARN/WARNING, ERROR/ERR and CRITICAL/CRIT/FATAL are synonyms.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.trim().to_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warning),
            "ERROR" | "ERR" => Some(LogLevel::Error),
            "CRITICAL" | "CRIT" | "FATAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }

    /// Like [`LogLevel::from_keyword`] but unknown keywords become `Info`
    pub fn parse_lenient(keyword: &str) -> Self {
        Self::from_keyword(keyword).unwrap_or(LogLevel::Info)
    }

    /// ERROR and CRITICAL entries count as errors
    pub fn is_error(self) -> bool {
        self >= LogLevel::Error
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single parsed log line or JSON log object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub level: LogLevel,
    pub service: String,
    pub message: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    /// JSON keys that did not map onto a known field
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Original text, including any continuation lines
    #[serde(default)]
    pub raw: String,
}

impl LogEntry {
    /// Attach a continuation line (e.g. a stack trace frame) to this entry
    pub fn append_continuation(&mut self, line: &str) {
        self.message.push('\n');
        self.message.push_str(line);
        self.raw.push('\n');
        self.raw.push_str(line);
    }
}

/// One observation of a metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricDataPoint {
    pub timestamp: Timestamp,
    pub metric_name: String,
    pub value: f64,
    pub unit: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Statistical summary of every observation of one metric within a batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSummary {
    pub metric_name: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub min_value: f64,
    pub max_value: f64,
    pub avg_value: f64,
    /// Value of the most recent observation
    pub current_value: f64,
    pub anomaly_detected: bool,
    /// Change of `current_value` against a supplied baseline, in percent
    pub change_percent: Option<f64>,
}

/// Normalized outcome of a span
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SpanStatus {
    Ok,
    Error,
    Timeout,
    /// Unrecognized status, kept uppercased
    Other(String),
}

impl SpanStatus {
    /// Collapse a raw status code or name onto OK / ERROR / TIMEOUT
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        match upper.as_str() {
            "OK" | "200" | "0" | "SUCCESS" => SpanStatus::Ok,
            "ERROR" | "500" | "1" | "2" => SpanStatus::Error,
            "504" => SpanStatus::Timeout,
            s if s.contains("TIMEOUT") => SpanStatus::Timeout,
            _ => SpanStatus::Other(upper),
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == SpanStatus::Ok
    }

    /// ERROR and TIMEOUT spans count as errors
    pub fn is_failure(&self) -> bool {
        matches!(self, SpanStatus::Error | SpanStatus::Timeout)
    }

    pub fn as_str(&self) -> &str {
        match self {
            SpanStatus::Ok => "OK",
            SpanStatus::Error => "ERROR",
            SpanStatus::Timeout => "TIMEOUT",
            SpanStatus::Other(s) => s,
        }
    }
}

impl From<String> for SpanStatus {
    fn from(raw: String) -> Self {
        SpanStatus::normalize(&raw)
    }
}

impl From<SpanStatus> for String {
    fn from(status: SpanStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed operation within a distributed trace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub service: String,
    pub operation: String,
    pub start_time: Timestamp,
    /// Never earlier than `start_time`
    pub end_time: Timestamp,
    pub duration_ms: f64,
    pub status: SpanStatus,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub error: Option<String>,
}

/// Diff classification of a configuration key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Snapshot value, not a diff
    Current,
    Added,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Current => "current",
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
        }
    }
}

/// A configuration key/value, either as a snapshot or as a diff record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigChange {
    pub timestamp: Timestamp,
    pub file_path: String,
    /// Dot-delimited path for nested structures
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub change_type: ChangeType,
}

/// A deployment supplied by the caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentEvent {
    pub timestamp: Timestamp,
    pub service: String,
    pub version: String,
    #[serde(default)]
    pub deployed_by: Option<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_deployment_status")]
    pub status: String,
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_deployment_status() -> String {
    "success".to_string()
}
