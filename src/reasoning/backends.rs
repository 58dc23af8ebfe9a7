use crate::error::ReasoningError;
use crate::reasoning::AnalysisConstraints;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// External collaborator that turns a context string into analysis text
///
/// The returned text is opaque to this crate; it is stored as-is.
pub trait ReasoningBackend: Send + Sync {
    fn analyze<'a>(
        &'a self,
        context: &'a str,
        constraints: &'a AnalysisConstraints,
    ) -> Pin<Box<dyn Future<Output = Result<String, ReasoningError>> + Send + 'a>>;

    /// Name used in log lines
    fn name(&self) -> &str {
        "reasoning-backend"
    }
}

/// Backend returning canned responses in rotation
///
/// Records every call so tests can inspect what was sent.
pub struct MockBackend {
    responses: Vec<Result<String, ReasoningError>>,
    current_index: Arc<Mutex<usize>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<(String, AnalysisConstraints)>>>,
}

impl MockBackend {
    pub fn with_response(response: Result<String, ReasoningError>) -> Self {
        Self::with_responses(vec![response])
    }

    /// Responses are returned in order, cycling after the last one
    pub fn with_responses(responses: Vec<Result<String, ReasoningError>>) -> Self {
        Self {
            responses,
            current_index: Arc::new(Mutex::new(0)),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::with_response(Ok(text.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_response(Err(ReasoningError::BackendError(message.into())))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    /// Context string and constraints of the most recent call
    pub fn last_call(&self) -> Option<(String, AnalysisConstraints)> {
        self.calls.lock().ok().and_then(|calls| calls.last().cloned())
    }
}

impl ReasoningBackend for MockBackend {
    fn analyze<'a>(
        &'a self,
        context: &'a str,
        constraints: &'a AnalysisConstraints,
    ) -> Pin<Box<dyn Future<Output = Result<String, ReasoningError>> + Send + 'a>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((context.to_string(), constraints.clone()));
            }

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.responses.is_empty() {
                return Err(ReasoningError::InvalidResponse(
                    "mock backend has no responses".to_string(),
                ));
            }

            let mut index = self
                .current_index
                .lock()
                .map_err(|_| ReasoningError::BackendError("mock state poisoned".to_string()))?;
            let response = self.responses[*index % self.responses.len()].clone();
            *index += 1;
            response
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
