use thiserror::Error;

use crate::catalog::SchemaError;
use crate::fetch::FetchError;
use crate::query::UnsafeQueryError;
use crate::reasoning::ReasoningError;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Cannot relate requested entities: no join path from '{anchor}' to '{target}'")]
    UnreachableEntity { anchor: String, target: String },

    #[error("Unsafe query rejected: {0}")]
    UnsafeQuery(#[from] UnsafeQueryError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Reasoning timed out after {timeout_ms}ms")]
    ReasoningTimeout { timeout_ms: u64 },

    #[error("Reasoning failed: {0}")]
    ReasoningFailure(ReasoningError),

    #[error("No grounded claims: {raw_claims} claim(s) returned against {facts} fact(s), none traceable")]
    Compose { raw_claims: usize, facts: usize },

    #[error("Request cancelled before {stage}")]
    Cancelled { stage: &'static str },
}

impl From<ReasoningError> for ReportError {
    fn from(e: ReasoningError) -> Self {
        match e {
            ReasoningError::Timeout { timeout_ms } => ReportError::ReasoningTimeout { timeout_ms },
            other => ReportError::ReasoningFailure(other),
        }
    }
}

impl ReportError {
    /// Stable tag for the error kind, used by the HTTP layer and the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            ReportError::Schema(_) => "schema_error",
            ReportError::UnreachableEntity { .. } => "unreachable_entity",
            ReportError::UnsafeQuery(_) => "unsafe_query",
            ReportError::Fetch(FetchError::Timeout { .. }) => "fetch_timeout",
            ReportError::Fetch(_) => "fetch_error",
            ReportError::ReasoningTimeout { .. } => "reasoning_timeout",
            ReportError::ReasoningFailure(_) => "reasoning_failure",
            ReportError::Compose { .. } => "compose_error",
            ReportError::Cancelled { .. } => "cancelled",
        }
    }
}
