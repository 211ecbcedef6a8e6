//! Crate-wide error taxonomy.
//!
//! Every component-local error (`KvError`, `ExtractError`, `LlmError`, ...) converts into
//! [`PipelineError`] via `From` at the point it crosses into the stage orchestrator, so the
//! orchestrator can categorize failures without matching on error text.

use thiserror::Error;

use crate::model::StageName;

/// The seven error kinds a task-facing caller can observe, independent of which component
/// raised them.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("LLM output failed schema validation: {0}")]
    LlmSchema(String),

    #[error("stage {stage:?} exceeded its timeout budget")]
    StageTimeout { stage: StageName },

    #[error("task was cancelled")]
    Cancelled,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// The stable string tag used in persisted `StageState::error` and in terminal progress
    /// events, matching the kinds enumerated in the design.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::ParseFailed(_) => "parse_failed",
            PipelineError::Transient(_) => "transient_failure",
            PipelineError::LlmSchema(_) => "llm_schema_failure",
            PipelineError::StageTimeout { .. } => "stage_timeout",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Internal(_) => "internal_error",
        }
    }
}

#[derive(Error, Debug)]
pub enum KvError {
    #[error("key not found: {namespace}/{task_id}/{field}")]
    NotFound {
        namespace: String,
        task_id: String,
        field: String,
    },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    Unsupported(String),
    #[error("corrupt input: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExtractError> for PipelineError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Unsupported(msg) => PipelineError::Validation(msg),
            ExtractError::Corrupt(msg) => PipelineError::ParseFailed(msg),
            ExtractError::Io(err) => PipelineError::ParseFailed(err.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("rate limited, retry after {retry_after_secs}s: {message}")]
    RateLimit {
        message: String,
        retry_after_secs: u64,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl LlmError {
    /// Whether this error represents a transient condition worth retrying, mirroring the
    /// retry/no-retry split used by the surrounding error-recovery logic.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimit { .. } | LlmError::Network(_) | LlmError::Timeout(_)
        )
    }
}

impl From<LlmError> for PipelineError {
    fn from(e: LlmError) -> Self {
        match &e {
            LlmError::RateLimit { .. } | LlmError::Network(_) | LlmError::Timeout(_) => {
                PipelineError::Transient(e.to_string())
            }
            LlmError::Authentication(_) | LlmError::InvalidRequest(_) => {
                PipelineError::Validation(e.to_string())
            }
            LlmError::ProviderUnavailable(_) => PipelineError::Transient(e.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum BinderError {
    #[error("no binding exists for task {0}")]
    NotBound(String),
}
