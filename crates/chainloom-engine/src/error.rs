use chainloom_core::errors::ProviderError;
use chainloom_core::finalize::FinalizeError;

/// Terminal outcomes of a chain operation.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("failed to finalize message: {0}")]
    Finalize(#[from] FinalizeError),

    #[error("exceeded failure count: {count} consecutive failures")]
    ExceededFailureCount { count: u32 },

    #[error("exceeded max runs: {0}")]
    ExceededMaxRuns(u32),

    #[error("all fallbacks failed after {attempts} attempts: {last_error}")]
    AllFallbacksFailed { attempts: u32, last_error: ProviderError },

    #[error("tool {0} is not registered")]
    InvalidToolName(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("model returned no message")]
    NoModelResponse,
}

impl ChainError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Provider(e) => e.error_kind(),
            Self::Finalize(_) => "finalize",
            Self::ExceededFailureCount { .. } => "exceeded_failure_count",
            Self::ExceededMaxRuns(_) => "exceeded_max_runs",
            Self::AllFallbacksFailed { .. } => "all_fallbacks_failed",
            Self::InvalidToolName(_) => "invalid_tool_name",
            Self::Cancelled => "cancelled",
            Self::NoModelResponse => "no_model_response",
        }
    }
}
