/// In-memory incident store
pub mod memory;

/// Directory of JSON documents, one per incident
pub mod file;

pub use file::JsonFileIncidentStore;
pub use memory::InMemoryIncidentStore;

use crate::error::StoreError;
use crate::events::{now, Timestamp};
use crate::unifier::{SummaryStats, UnifiedContext};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an incident analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Pending => "pending",
            IncidentStatus::Analyzing => "analyzing",
            IncidentStatus::Completed => "completed",
            IncidentStatus::Failed => "failed",
        }
    }

    /// Completed and failed incidents are not revisited
    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentStatus::Completed | IncidentStatus::Failed)
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored result of one analysis request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentRecord {
    pub incident_id: String,
    pub status: IncidentStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub context: Option<UnifiedContext>,
    #[serde(default)]
    pub stats: Option<SummaryStats>,
    /// Text returned by the reasoning backend
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Sources skipped during ingestion, with the reason
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl IncidentRecord {
    pub fn new(incident_id: impl Into<String>) -> Self {
        let created_at = now();
        Self {
            incident_id: incident_id.into(),
            status: IncidentStatus::Pending,
            created_at,
            updated_at: created_at,
            context: None,
            stats: None,
            analysis: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn set_status(&mut self, status: IncidentStatus) {
        self.status = status;
        self.updated_at = now();
    }

    /// Attach the unified context and mark the record completed
    pub fn complete(&mut self, context: UnifiedContext) {
        self.stats = Some(context.summary_stats());
        self.context = Some(context);
        self.error = None;
        self.set_status(IncidentStatus::Completed);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.set_status(IncidentStatus::Failed);
    }

    /// Services named in the attached context
    pub fn involves_service(&self, service: &str) -> bool {
        self.context
            .as_ref()
            .is_some_and(|ctx| ctx.services_involved.contains(service))
    }
}

/// Criteria for [`IncidentStore::list`]; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub service: Option<String>,
}

impl IncidentFilter {
    pub fn matches(&self, record: &IncidentRecord) -> bool {
        self.status.map_or(true, |status| record.status == status)
            && self
                .service
                .as_deref()
                .map_or(true, |service| record.involves_service(service))
    }
}

/// Storage for incident records, injected into the pipeline
///
/// Implementations must be safe to share across tasks.
#[cfg_attr(test, mockall::automock)]
pub trait IncidentStore: Send + Sync {
    /// Insert or replace the record stored under `id`
    fn save(&self, id: &str, record: &IncidentRecord) -> Result<(), StoreError>;

    /// Fetch a record, or `StoreError::NotFound`
    fn get(&self, id: &str) -> Result<IncidentRecord, StoreError>;

    /// Records matching `filter`, oldest first
    fn list(&self, filter: &IncidentFilter) -> Result<Vec<IncidentRecord>, StoreError>;
}
