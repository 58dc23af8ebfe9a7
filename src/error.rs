use thiserror::Error;

/// Errors that can occur while ingesting a single blob
///
/// Only whole-blob failures surface here. A bad line, span or metric item
/// inside an otherwise readable blob is logged and skipped by the parser.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to parse input: {0}")]
    Parsing(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl IngestError {
    /// Whether this error means the blob could not be decoded at all
    pub fn is_parsing(&self) -> bool {
        matches!(
            self,
            IngestError::Parsing(_) | IngestError::Json(_) | IngestError::Yaml(_)
        )
    }
}

/// Errors that can occur when reading or writing incident records
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Incident not found: {0}")]
    NotFound(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize incident record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Errors that can occur when handing a context to the reasoning collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReasoningError {
    #[error("Reasoning backend failed: {0}")]
    BackendError(String),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Incident {0} has no unified context to analyze")]
    MissingContext(String),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors raised by the ingestion pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to ingest {source_name}: {error}")]
    Ingest {
        source_name: String,
        #[source]
        error: IngestError,
    },

    #[error("Parse task failed: {0}")]
    TaskFailed(String),

    #[error("Incident {0} was cancelled")]
    Cancelled(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Reasoning error: {0}")]
    Reasoning(#[from] ReasoningError),
}
