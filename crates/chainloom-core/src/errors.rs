use std::time::Duration;

/// Failure reported by a backing model call.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ProviderError {
    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("context window exceeded: {actual} > {limit}")]
    ContextWindowExceeded { limit: usize, actual: usize },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Whether another attempt (same model or a fallback) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Overloaded
                | Self::Network(_)
                | Self::StreamInterrupted(_)
                | Self::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_)
                | Self::ContextWindowExceeded { .. }
                | Self::InvalidRequest(_)
                | Self::MalformedResponse(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ContextWindowExceeded { .. } => "context_window_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MalformedResponse(_) => "malformed_response",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited { retry_after: None },
            503 | 529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }

    /// Classify an in-stream error event by its provider `type` string.
    pub fn from_event_type(kind: &str, message: String) -> Self {
        match kind {
            "overloaded_error" | "serviceUnavailableException" => Self::Overloaded,
            "rate_limit_error" | "throttlingException" => Self::RateLimited { retry_after: None },
            "authentication_error" | "permission_error" | "accessDeniedException" => {
                Self::AuthenticationFailed(message)
            }
            "invalid_request_error" | "validationException" => Self::InvalidRequest(message),
            "modelStreamErrorException" | "internalServerException" | "api_error" => {
                Self::ServerError { status: 500, body: message }
            }
            _ => Self::StreamInterrupted(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(ProviderError::Overloaded.is_retryable());
        assert!(ProviderError::Network("tcp reset".into()).is_retryable());
        assert!(ProviderError::StreamInterrupted("eof".into()).is_retryable());
        assert!(ProviderError::Timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ProviderError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(ProviderError::ContextWindowExceeded { limit: 200_000, actual: 250_000 }.is_fatal());
        assert!(ProviderError::InvalidRequest("bad".into()).is_fatal());
        assert!(ProviderError::MalformedResponse("garbage".into()).is_fatal());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(5)));
        assert_eq!(ProviderError::Overloaded.suggested_delay(), None);
    }

    #[test]
    fn from_status_mapping() {
        assert!(ProviderError::from_status(401, "unauthorized".into()).is_fatal());
        assert!(ProviderError::from_status(400, "bad request".into()).is_fatal());
        assert!(ProviderError::from_status(429, "slow down".into()).is_retryable());
        assert!(ProviderError::from_status(529, "overloaded".into()).is_retryable());
        assert!(ProviderError::from_status(502, "bad gateway".into()).is_retryable());
        assert!(matches!(
            ProviderError::from_status(503, String::new()),
            ProviderError::Overloaded
        ));
    }

    #[test]
    fn from_event_type_mapping() {
        assert_eq!(
            ProviderError::from_event_type("overloaded_error", "busy".into()),
            ProviderError::Overloaded
        );
        assert!(ProviderError::from_event_type("throttlingException", "slow".into()).is_retryable());
        assert!(ProviderError::from_event_type("validationException", "bad".into()).is_fatal());
        assert!(ProviderError::from_event_type("something_new", "?".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ProviderError::Overloaded.error_kind(), "overloaded");
        assert_eq!(
            ProviderError::RateLimited { retry_after: None }.error_kind(),
            "rate_limited"
        );
    }
}
