/// Error types for ingestion, storage, configuration and reasoning
pub mod error;

/// Normalized record types shared by every parser
pub mod events;

/// Log, metrics, config and trace parsers
pub mod parsers;

/// Merges parsed signals into one incident context
pub mod unifier;

/// Incident record storage
pub mod store;

/// Seam for the external reasoning collaborator
pub mod reasoning;

/// Concurrent ingestion of one incident request
pub mod pipeline;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use error::{ConfigError, IngestError, PipelineError, ReasoningError, StoreError};
pub use events::{
    ChangeType, ConfigChange, DeploymentEvent, LogEntry, LogLevel, MetricDataPoint, MetricSummary,
    SpanStatus, Timestamp, TraceSpan,
};
pub use pipeline::{CancellationFlag, FailurePolicy, IncidentPipeline, IncidentRequest};
pub use store::{IncidentRecord, IncidentStatus, IncidentStore};
pub use unifier::{DataUnifier, UnifiedContext};
