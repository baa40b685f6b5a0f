use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("response too large: {url} exceeded {limit_bytes} bytes")]
    ResponseTooLarge { url: String, limit_bytes: u64 },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("step {step} timed out after {timeout_ms} ms")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("global time budget exhausted during {stage}")]
    BudgetExhausted { stage: String },

    #[error("quality gate {gate} not met: {detail}")]
    Quality { gate: String, detail: String },

    #[error("timed out after {waited_ms} ms waiting for lock: {path}")]
    LockBusy { path: String, waited_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("pipeline error: {0}")]
    Pipeline(String),
}

impl PipelineError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn quality(gate: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Quality {
            gate: gate.into(),
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::ResponseTooLarge { .. } => "network-too-large",
            Self::Schema(_) => "schema",
            Self::Extraction(_) => "extraction",
            Self::StepTimeout { .. } => "step-timeout",
            Self::BudgetExhausted { .. } => "budget-exhausted",
            Self::Quality { .. } => "quality",
            Self::LockBusy { .. } => "lock-busy",
            Self::Cancelled => "cancelled",
            Self::Pipeline(_) => "pipeline",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Extraction(_)
                | Self::StepTimeout { .. }
                | Self::LockBusy { .. }
                | Self::Cancelled
        )
    }
}

/// Classifies an arbitrary error chain. Errors that are not `PipelineError` count as
/// non-retryable pipeline failures.
pub fn classify(err: &anyhow::Error) -> (&'static str, bool) {
    match err.downcast_ref::<PipelineError>() {
        Some(pipeline) => (pipeline.code(), pipeline.retryable()),
        None => ("pipeline", false),
    }
}
