/// Backend seam for the external reasoning collaborator
pub mod backends;

pub use backends::{MockBackend, ReasoningBackend};

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Area the analysis should concentrate on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusArea {
    Configuration,
    Performance,
    Deployment,
    Dependencies,
}

impl FocusArea {
    pub fn as_str(self) -> &'static str {
        match self {
            FocusArea::Configuration => "configuration",
            FocusArea::Performance => "performance",
            FocusArea::Deployment => "deployment",
            FocusArea::Dependencies => "dependencies",
        }
    }

    /// One-line instruction appended to the request
    pub fn instruction(self) -> &'static str {
        match self {
            FocusArea::Configuration => {
                "Concentrate on configuration changes and their effect on connection, capacity and timeout settings."
            }
            FocusArea::Performance => {
                "Concentrate on latency, resource saturation and anomalous metrics."
            }
            FocusArea::Deployment => {
                "Concentrate on recent deployments and failures that began after them."
            }
            FocusArea::Dependencies => {
                "Concentrate on the service call graph and how errors propagated between services."
            }
        }
    }
}

impl FromStr for FocusArea {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "configuration" | "config" => Ok(FocusArea::Configuration),
            "performance" => Ok(FocusArea::Performance),
            "deployment" | "deployments" => Ok(FocusArea::Deployment),
            "dependencies" | "dependency" => Ok(FocusArea::Dependencies),
            other => Err(IngestError::Validation(format!(
                "Unknown focus area: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for FocusArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured constraints sent alongside the context string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConstraints {
    pub focus_area: Option<FocusArea>,
    /// Ask for an executive summary in the response
    pub include_summary: bool,
}

impl Default for AnalysisConstraints {
    fn default() -> Self {
        Self {
            focus_area: None,
            include_summary: true,
        }
    }
}
