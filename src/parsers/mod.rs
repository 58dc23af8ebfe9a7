/// Timestamp parsing shared by every parser
pub mod time;

/// Ordered field fallback tables and per-record outcomes
pub mod fields;

/// JSON-lines and free-text log parsing
pub mod log_parser;

/// Time-series parsing and per-metric summaries
pub mod metrics_parser;

/// YAML/JSON/ENV configuration snapshots and diffs
pub mod config_parser;

/// Distributed-trace spans, dependency graphs and error chains
pub mod trace_parser;

pub use config_parser::{ConfigFormat, ConfigParser};
pub use log_parser::{LogFormat, LogParser};
pub use metrics_parser::MetricsParser;
pub use trace_parser::TraceParser;
