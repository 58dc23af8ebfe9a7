use crate::error::IngestError;
use crate::events::{now, LogEntry, LogLevel, Timestamp};
use crate::parsers::fields::{decode_utf8, value_to_string, FieldCandidates, RecordOutcome};
use crate::parsers::time::{parse_or_now, value_or_now};
use log::{debug, info, warn};
use regex::Regex;
use serde_json::{Map, Value};
use std::str::FromStr;

const TIMESTAMP: FieldCandidates =
    FieldCandidates::new("timestamp", &["timestamp", "time", "@timestamp", "ts"]);
const LEVEL: FieldCandidates = FieldCandidates::new("level", &["level", "severity", "log_level"]);
const SERVICE: FieldCandidates = FieldCandidates::new(
    "service",
    &["service", "service_name", "app", "application"],
);
const MESSAGE: FieldCandidates = FieldCandidates::new("message", &["message", "msg", "text"]);
const TRACE_ID: FieldCandidates = FieldCandidates::new("trace_id", &["trace_id", "traceId"]);
const SPAN_ID: FieldCandidates = FieldCandidates::new("span_id", &["span_id", "spanId"]);

const KNOWN_FIELDS: &[FieldCandidates] = &[TIMESTAMP, LEVEL, SERVICE, MESSAGE, TRACE_ID, SPAN_ID];

/// ISO-8601 (optional offset), Apache and syslog timestamps
const TIMESTAMP_PATTERN: &str = concat!(
    r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
    r"|\d{2}/\w{3}/\d{4}:\d{2}:\d{2}:\d{2}(?:\s[+-]\d{4})?",
    r"|\w{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}",
);

const LEVEL_PATTERN: &str = r"(?i)\b(DEBUG|INFO|WARN(?:ING)?|ERROR|ERR|CRITICAL|CRIT|FATAL)\b";

/// Leading `[tag]` left over after the level, e.g. `[worker-3]`
const BRACKET_PREFIX_PATTERN: &str = r"^\[.*?\]\s*";

/// Input format of a log blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Free text, multi-line entries allowed
    Text,
    /// Decide from the first non-empty line
    Auto,
}

impl FromStr for LogFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" | "jsonl" | "json-lines" => Ok(LogFormat::Json),
            "text" | "txt" | "plain" => Ok(LogFormat::Text),
            "auto" | "" => Ok(LogFormat::Auto),
            other => Err(IngestError::Validation(format!(
                "Unsupported log format: {}",
                other
            ))),
        }
    }
}

/// Parser for JSON-lines and free-text logs
///
/// A single malformed line never fails the batch: bad JSON lines are retried
/// with the text grammar, and text lines carrying neither a timestamp nor a
/// level are attached to the previous entry as continuations.
pub struct LogParser {
    timestamp_regex: Regex,
    level_regex: Regex,
    bracket_prefix_regex: Regex,
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogParser {
    pub fn new() -> Self {
        Self {
            timestamp_regex: Regex::new(TIMESTAMP_PATTERN).expect("valid timestamp pattern"),
            level_regex: Regex::new(LEVEL_PATTERN).expect("valid level pattern"),
            bracket_prefix_regex: Regex::new(BRACKET_PREFIX_PATTERN)
                .expect("valid bracket pattern"),
        }
    }

    /// Parse raw bytes, failing only when they are not valid UTF-8
    pub fn parse_bytes(
        &self,
        content: &[u8],
        source: &str,
        format: LogFormat,
    ) -> Result<Vec<LogEntry>, IngestError> {
        let text = decode_utf8(content, source)?;
        Ok(self.parse(text, source, format))
    }

    /// Parse log text into entries
    ///
    /// # Arguments
    ///
    /// * `content` - Raw log text
    /// * `source` - Service name used when an entry does not name one
    /// * `format` - Input format, or `Auto` to detect
    pub fn parse(&self, content: &str, source: &str, format: LogFormat) -> Vec<LogEntry> {
        let format = match format {
            LogFormat::Auto => Self::detect_format(content),
            explicit => explicit,
        };
        debug!("Parsing logs from {} as {:?}", source, format);

        let entries = match format {
            LogFormat::Json => self.parse_json_lines(content, source),
            _ => self.parse_text(content, source),
        };
        info!("Parsed {} log entries from {}", entries.len(), source);
        entries
    }

    /// JSON if the first non-empty line is a JSON object, otherwise text
    pub fn detect_format(content: &str) -> LogFormat {
        let first_line = content.lines().map(str::trim).find(|line| !line.is_empty());
        match first_line.map(serde_json::from_str::<Value>) {
            Some(Ok(Value::Object(_))) => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }

    fn parse_json_lines(&self, content: &str, source: &str) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match Self::parse_json_line(line, source) {
                RecordOutcome::Parsed(entry) => entries.push(entry),
                RecordOutcome::Skipped(reason) => {
                    warn!(
                        "Invalid JSON log on line {} of {}: {}",
                        line_num + 1,
                        source,
                        reason
                    );
                    self.push_text_line(&mut entries, line, source);
                }
            }
        }

        entries
    }

    fn parse_text(&self, content: &str, source: &str) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            self.push_text_line(&mut entries, line, source);
        }
        entries
    }

    /// Add a text line as a new entry, or as a continuation of the last one
    fn push_text_line(&self, entries: &mut Vec<LogEntry>, line: &str, source: &str) {
        match self.parse_text_line(line, source) {
            Some(entry) => entries.push(entry),
            None => match entries.last_mut() {
                Some(previous) => previous.append_continuation(line),
                None => debug!("Discarding orphan line from {}: {}", source, line),
            },
        }
    }

    /// Convert one JSON-lines record
    fn parse_json_line(line: &str, source: &str) -> RecordOutcome<LogEntry> {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(object)) => RecordOutcome::Parsed(Self::json_to_entry(object, line, source)),
            Ok(other) => RecordOutcome::skipped(format!("expected a JSON object, found {}", other)),
            Err(e) => RecordOutcome::skipped(e.to_string()),
        }
    }

    fn json_to_entry(object: Map<String, Value>, line: &str, source: &str) -> LogEntry {
        let timestamp = value_or_now(TIMESTAMP.resolve(&object));
        let level = LEVEL
            .resolve_string(&object)
            .map(|s| LogLevel::parse_lenient(&s))
            .unwrap_or(LogLevel::Info);
        let service = SERVICE
            .resolve_string(&object)
            .unwrap_or_else(|| source.to_string());
        let message = MESSAGE
            .resolve_string(&object)
            .unwrap_or_else(|| Value::Object(object.clone()).to_string());
        let trace_id = TRACE_ID.resolve_string(&object);
        let span_id = SPAN_ID.resolve_string(&object);

        let metadata = object
            .into_iter()
            .filter(|(key, _)| !KNOWN_FIELDS.iter().any(|field| field.contains(key)))
            .collect();

        LogEntry {
            timestamp,
            level,
            service,
            message,
            trace_id,
            span_id,
            metadata,
            raw: line.to_string(),
        }
    }

    /// Parse one text line
    ///
    /// Returns `None` when the line has neither a timestamp nor a level, which
    /// marks it as a continuation of the previous entry.
    pub fn parse_text_line(&self, line: &str, source: &str) -> Option<LogEntry> {
        let timestamp_match = self.timestamp_regex.find(line);
        let (timestamp, remaining) = match timestamp_match {
            Some(m) => (Some(parse_or_now(m.as_str())), line[m.end()..].trim()),
            None => (None, line.trim()),
        };

        let level_match = self.level_regex.captures(remaining).and_then(|caps| {
            let whole = caps.get(0)?;
            let keyword = caps.get(1)?;
            Some((LogLevel::parse_lenient(keyword.as_str()), whole.end()))
        });

        if timestamp.is_none() && level_match.is_none() {
            return None;
        }

        let (level, message) = match level_match {
            Some((level, end)) => (level, remaining[end..].trim()),
            None => (LogLevel::Info, remaining),
        };

        let cleaned = self.bracket_prefix_regex.replace(message, "");
        let cleaned = cleaned.trim();
        let message = if cleaned.is_empty() {
            line.trim().to_string()
        } else {
            cleaned.to_string()
        };

        Some(LogEntry {
            timestamp: timestamp.unwrap_or_else(now),
            level,
            service: source.to_string(),
            message,
            trace_id: None,
            span_id: None,
            metadata: Map::new(),
            raw: line.to_string(),
        })
    }

    /// Entries whose level is one of `levels`
    pub fn filter_by_level(entries: &[LogEntry], levels: &[LogLevel]) -> Vec<LogEntry> {
        entries
            .iter()
            .filter(|entry| levels.contains(&entry.level))
            .cloned()
            .collect()
    }

    /// Entries produced by one of `services`
    pub fn filter_by_service<S: AsRef<str>>(entries: &[LogEntry], services: &[S]) -> Vec<LogEntry> {
        entries
            .iter()
            .filter(|entry| services.iter().any(|s| s.as_ref() == entry.service))
            .cloned()
            .collect()
    }

    /// Entries with `start <= timestamp <= end`
    pub fn filter_by_time_range(
        entries: &[LogEntry],
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<LogEntry> {
        entries
            .iter()
            .filter(|entry| entry.timestamp >= start && entry.timestamp <= end)
            .cloned()
            .collect()
    }
}
