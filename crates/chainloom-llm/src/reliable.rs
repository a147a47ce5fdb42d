use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use rand::Rng;
use tracing::warn;

use chainloom_core::errors::ProviderError;
use chainloom_core::messages::Message;
use chainloom_core::settings::RetrySettings;
use chainloom_core::tools::ToolDefinition;

use crate::model::{ChatModel, ModelConfig, ModelStream};

/// Backoff applied to retryable failures of a single model.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.base_delay(),
            max_delay: settings.max_delay(),
            jitter_factor: settings.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based). A server hint wins.
    pub fn delay_for(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);

        let spread = capped * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(100.0) as u64)
    }
}

/// Wraps a [`ChatModel`] with retry and exponential backoff.
///
/// A call is retried when the request itself fails with a retryable error,
/// or when the stream's first item is one. Once any output has been
/// yielded the stream is committed and later errors pass through.
pub struct ReliableModel<M: ChatModel> {
    inner: M,
    policy: RetryPolicy,
    total_retries: Arc<AtomicU64>,
}

impl<M: ChatModel> ReliableModel<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults(inner: M) -> Self {
        Self::new(inner, RetryPolicy::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Call once and pull the first item so an immediate stream error can
    /// be retried like a request error.
    async fn attempt(&self, messages: &[Message], tools: &[ToolDefinition]) -> Result<ModelStream, ProviderError> {
        let mut stream = self.inner.call(messages, tools).await?;
        match stream.next().await {
            Some(Err(e)) => Err(e),
            Some(Ok(first)) => Ok(Box::pin(stream::once(async move { Ok(first) }).chain(stream))),
            None => Ok(stream),
        }
    }
}

#[async_trait]
impl<M: ChatModel> ChatModel for ReliableModel<M> {
    fn config(&self) -> &ModelConfig {
        self.inner.config()
    }

    async fn call(&self, messages: &[Message], tools: &[ToolDefinition]) -> Result<ModelStream, ProviderError> {
        let mut attempt = 0;
        loop {
            let e = match self.attempt(messages, tools).await {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };

            if e.is_fatal() || !e.is_retryable() || attempt >= self.policy.max_retries {
                return Err(e);
            }

            let delay = self.policy.delay_for(attempt, e.suggested_delay());
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                model = self.name(),
                attempt = attempt + 1,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "retrying after error"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockModel, MockResponse};
    use crate::model::ModelOutput;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.2,
        }
    }

    fn server_error() -> MockResponse {
        MockResponse::Error(ProviderError::ServerError {
            status: 500,
            body: "internal".into(),
        })
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let reliable = ReliableModel::with_defaults(MockModel::new(vec![MockResponse::text("hello")]));
        let stream = reliable.call(&[], &[]).await;
        assert!(stream.is_ok());
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_retryable_error() {
        let mock = MockModel::new(vec![server_error(), server_error(), MockResponse::text("recovered")]);
        let reliable = ReliableModel::new(mock, fast());

        let outputs: Vec<_> = reliable.call(&[], &[]).await.unwrap().collect().await;
        assert!(matches!(&outputs[0], Ok(ModelOutput::Message(m)) if m.text_content() == "recovered"));
        assert_eq!(reliable.total_retries(), 2);
        assert_eq!(reliable.inner().call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_when_stream_fails_before_output() {
        let mock = MockModel::new(vec![
            MockResponse::StreamError(vec![], ProviderError::Overloaded),
            MockResponse::streamed_text(&["a", "b"]),
        ]);
        let reliable = ReliableModel::new(mock, fast());

        let outputs: Vec<_> = reliable.call(&[], &[]).await.unwrap().collect().await;
        assert_eq!(outputs.len(), 3);
        assert!(outputs.iter().all(Result::is_ok));
        assert_eq!(reliable.total_retries(), 1);
    }

    #[tokio::test]
    async fn committed_stream_is_not_retried() {
        let mock = MockModel::new(vec![
            MockResponse::StreamError(
                vec![ModelOutput::Delta(chainloom_core::delta::MessageDelta::text("par"))],
                ProviderError::StreamInterrupted("eof".into()),
            ),
            MockResponse::text("unreachable"),
        ]);
        let reliable = ReliableModel::new(mock, fast());

        let outputs: Vec<_> = reliable.call(&[], &[]).await.unwrap().collect().await;
        assert!(outputs[0].is_ok());
        assert!(matches!(outputs[1], Err(ProviderError::StreamInterrupted(_))));
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test]
    async fn fatal_error_not_retried() {
        let mock = MockModel::new(vec![
            MockResponse::Error(ProviderError::AuthenticationFailed("bad key".into())),
            MockResponse::text("should not reach"),
        ]);
        let reliable = ReliableModel::with_defaults(mock);

        let err = reliable.call(&[], &[]).await.err().expect("expected error");
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn max_retries_exhausted() {
        let mock = MockModel::new(vec![server_error(), server_error(), server_error(), server_error()]);
        let reliable = ReliableModel::new(mock, fast());

        assert!(reliable.call(&[], &[]).await.is_err());
        assert_eq!(reliable.total_retries(), 3);
        assert_eq!(reliable.inner().call_count(), 4);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(4_000),
            jitter_factor: 0.0,
        };
        assert_eq!(policy.delay_for(0, None), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(5, None), Duration::from_millis(4_000));
    }

    #[test]
    fn delay_respects_hint_and_floor() {
        let policy = fast();
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(7))), Duration::from_secs(7));
        assert!(policy.delay_for(0, None) >= Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.2,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for(0, None).as_millis();
            assert!((800..=1_200).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn policy_from_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
