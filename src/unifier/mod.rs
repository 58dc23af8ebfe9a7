/// Unified incident context and its text projection
pub mod context;

/// Windowing, ordering, narrowing and correlation of parsed signals
pub mod data_unifier;

pub use context::{ContextLimits, SummaryStats, UnifiedContext};
pub use data_unifier::{
    ContextEnrichment, CorrelationTrigger, DataUnifier, ParsedSignals, SeverityFilter,
    TemporalCorrelation, UnifyOptions, MAX_TIME_WINDOW_MINUTES,
};
