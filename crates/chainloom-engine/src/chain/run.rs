//! Driving a chain: model calls, fallback, and the run loops.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use chainloom_core::messages::{Message, ToolResult};
use chainloom_llm::{ChatModel, ModelOutput};

use super::{Chain, MergeOutcome};
use crate::callbacks::ChainEvent;
use crate::error::ChainError;

/// Hook run before each fallback model is tried. It may rewrite the
/// conversation, e.g. to drop content the next provider cannot accept.
pub type BeforeFallback = Arc<dyn Fn(&mut Chain, &dyn ChatModel) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Perform exactly one step.
    Step,
    /// Keep stepping while the conversation is waiting on the model.
    WhileNeedsResponse,
    /// Repeat a model call (and its tool calls) until one run has no failure.
    UntilSuccess,
}

#[derive(Clone, Default)]
pub struct RunOptions {
    pub fallbacks: Vec<Arc<dyn ChatModel>>,
    pub before_fallback: Option<BeforeFallback>,
    pub cancel: CancellationToken,
    /// Overrides `ChainSettings::max_runs` for this run.
    pub max_runs: Option<u32>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<Arc<dyn ChatModel>>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn before_fallback(mut self, hook: impl Fn(&mut Chain, &dyn ChatModel) + Send + Sync + 'static) -> Self {
        self.before_fallback = Some(Arc::new(hook));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fallbacks: Vec<String> = self.fallbacks.iter().map(|m| m.config().label()).collect();
        f.debug_struct("RunOptions")
            .field("fallbacks", &fallbacks)
            .field("before_fallback", &self.before_fallback.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("max_runs", &self.max_runs)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub steps: u32,
    pub last_message: Option<Message>,
}

/// What a single step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was pending.
    Idle,
    /// Pending tool calls were executed.
    ToolsExecuted { errors: usize },
    /// The model answered; `halted` when a processor rejected the answer.
    Responded { halted: bool },
    /// The response could not be turned into a message.
    ProcessingFailed,
}

impl StepOutcome {
    pub fn is_failure(self) -> bool {
        match self {
            Self::Idle => false,
            Self::ToolsExecuted { errors } => errors > 0,
            Self::Responded { halted } => halted,
            Self::ProcessingFailed => true,
        }
    }
}

impl Chain {
    /// Run the chain in `mode`.
    ///
    /// `exchanged_messages` is reset at the start so it holds only what this
    /// run appended.
    #[instrument(skip_all, fields(chain_id = %self.id, mode = ?mode))]
    pub async fn run(&mut self, mode: RunMode, options: RunOptions) -> Result<RunResult, ChainError> {
        self.exchanged_messages.clear();
        let steps = match mode {
            RunMode::Step => {
                self.step(&options).await?;
                1
            }
            RunMode::WhileNeedsResponse => self.run_while_needs_response(&options).await?,
            RunMode::UntilSuccess => self.run_until_success(&options).await?,
        };
        info!(steps, messages = self.messages.len(), "chain run finished");
        Ok(RunResult {
            steps,
            last_message: self.last_message().cloned(),
        })
    }

    /// Run until one of `tool_names` produces a result, and return it.
    /// Error results are returned too; check `is_error`.
    #[instrument(skip_all, fields(chain_id = %self.id, tools = ?tool_names))]
    pub async fn run_until_tool_used(
        &mut self,
        tool_names: &[&str],
        options: RunOptions,
    ) -> Result<ToolResult, ChainError> {
        if tool_names.is_empty() {
            return Err(ChainError::InvalidToolName(String::new()));
        }
        if let Some(unknown) = tool_names.iter().find(|name| !self.tools.contains(name)) {
            return Err(ChainError::InvalidToolName((*unknown).to_string()));
        }

        self.exchanged_messages.clear();
        let max_runs = self.max_runs(&options);
        let mut runs = 0;
        loop {
            if runs >= max_runs {
                warn!(max_runs, "tool was never used");
                return Err(ChainError::ExceededMaxRuns(max_runs));
            }
            runs += 1;

            let outcome = if self.needs_response || self.pending_tool_calls().is_some() {
                self.step(&options).await?
            } else {
                // The model answered without using a tool; ask again.
                self.call_with_fallback(&options).await?
            };

            if let StepOutcome::ToolsExecuted { .. } = outcome {
                let found = self.last_message().and_then(|m| {
                    m.tool_results
                        .iter()
                        .find(|r| tool_names.contains(&r.name.as_str()))
                });
                if let Some(result) = found {
                    return Ok(result.clone());
                }
            }
            self.check_failure_budget()?;
        }
    }

    /// Perform the next pending action: run tool calls if the last message
    /// requested any, otherwise ask the model if a response is needed.
    pub async fn step(&mut self, options: &RunOptions) -> Result<StepOutcome, ChainError> {
        if options.cancel.is_cancelled() {
            return Err(ChainError::Cancelled);
        }

        if self.pending_tool_calls().is_some() {
            let batch = self.execute_tool_calls_with(&options.cancel).await;
            if options.cancel.is_cancelled() {
                self.callbacks.emit(&ChainEvent::Interrupted { reason: "cancelled" });
                return Err(ChainError::Cancelled);
            }
            let errors = batch.map_or(0, |b| b.errors);
            return Ok(StepOutcome::ToolsExecuted { errors });
        }

        if !self.needs_response {
            return Ok(StepOutcome::Idle);
        }
        self.call_with_fallback(options).await
    }

    async fn run_while_needs_response(&mut self, options: &RunOptions) -> Result<u32, ChainError> {
        let max_runs = self.max_runs(options);
        let mut steps = 0;
        while self.needs_response {
            if steps >= max_runs {
                warn!(max_runs, "chain still needs a response after max runs");
                return Err(ChainError::ExceededMaxRuns(max_runs));
            }
            let outcome = self.step(options).await?;
            steps += 1;
            self.check_failure_budget()?;
            if outcome == StepOutcome::Idle {
                break;
            }
        }
        Ok(steps)
    }

    async fn run_until_success(&mut self, options: &RunOptions) -> Result<u32, ChainError> {
        let max_runs = self.max_runs(options);
        let mut runs = 0;
        loop {
            if runs >= max_runs {
                warn!(max_runs, "no successful run within max runs");
                return Err(ChainError::ExceededMaxRuns(max_runs));
            }
            runs += 1;

            let mut failed = self.step(options).await?.is_failure();
            if !failed && self.pending_tool_calls().is_some() {
                failed = self.step(options).await?.is_failure();
            }
            if !failed {
                return Ok(runs);
            }
            debug!(run = runs, failure_count = self.current_failure_count, "run failed, retrying");
            self.check_failure_budget()?;
        }
    }

    fn max_runs(&self, options: &RunOptions) -> u32 {
        options.max_runs.unwrap_or(self.settings.max_runs)
    }

    fn check_failure_budget(&self) -> Result<(), ChainError> {
        let count = self.current_failure_count;
        if count < self.settings.max_retry_count {
            return Ok(());
        }
        error!(chain_id = %self.id, failure_count = count, "failure count exceeded");
        self.callbacks.emit(&ChainEvent::RetriesExceeded { failure_count: count });
        Err(ChainError::ExceededFailureCount { count })
    }

    /// Ask the current model, then each fallback in order while the error
    /// is retryable. The model that answers becomes the chain's model.
    /// Fallbacks configured like the current model are skipped.
    async fn call_with_fallback(&mut self, options: &RunOptions) -> Result<StepOutcome, ChainError> {
        let primary = self.llm.clone();
        let candidates: Vec<&Arc<dyn ChatModel>> = options
            .fallbacks
            .iter()
            .filter(|f| f.config() != primary.config())
            .collect();
        let mut last_error = match self.call_model(primary.as_ref(), &options.cancel).await {
            Err(ChainError::Provider(e)) if e.is_retryable() && !candidates.is_empty() => e,
            other => return other,
        };

        let mut attempts = 1;
        let mut from = primary.config().label();
        for fallback in candidates {
            let to = fallback.config().label();
            warn!(from = %from, to = %to, error = %last_error, "falling back to next model");
            self.callbacks.emit(&ChainEvent::FallbackActivated {
                from: &from,
                to: &to,
                error: &last_error,
            });
            if let Some(metrics) = &self.metrics {
                metrics.counter_inc("chain_fallbacks_total", &[("model", to.as_str())], 1);
            }
            if let Some(hook) = &options.before_fallback {
                hook(self, fallback.as_ref());
            }

            attempts += 1;
            match self.call_model(fallback.as_ref(), &options.cancel).await {
                Ok(outcome) => {
                    self.llm = Arc::clone(fallback);
                    return Ok(outcome);
                }
                Err(ChainError::Provider(e)) if e.is_retryable() => {
                    last_error = e;
                    from = to;
                }
                Err(e) => return Err(e),
            }
        }

        error!(attempts, error = %last_error, "all fallback models failed");
        Err(ChainError::AllFallbacksFailed { attempts, last_error })
    }

    async fn call_model(&mut self, model: &dyn ChatModel, cancel: &CancellationToken) -> Result<StepOutcome, ChainError> {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("chain_model_calls_total", &[("model", model.name())], 1);
        }
        let tools = self.tools.definitions();
        debug!(model = model.name(), messages = self.messages.len(), tools = tools.len(), "calling model");

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.callbacks.emit(&ChainEvent::Interrupted { reason: "cancelled" });
                return Err(ChainError::Cancelled);
            }
            result = model.call(&self.messages, &tools) => result?,
        };

        let mut responded = false;
        let mut halted = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if !self.cancel_delta("cancelled") {
                        self.callbacks.emit(&ChainEvent::Interrupted { reason: "cancelled" });
                    }
                    return Err(ChainError::Cancelled);
                }
                item = stream.next() => item,
            };

            match item {
                None => break,
                Some(Ok(ModelOutput::Message(message))) => {
                    if let Some(usage) = &message.metadata.usage {
                        self.callbacks.emit(&ChainEvent::TokenUsage { usage });
                    }
                    responded = true;
                    halted |= self.accept_response(message);
                }
                Some(Ok(ModelOutput::Delta(fragment))) => match self.merge_delta(fragment) {
                    Ok(MergeOutcome::Pending) => {}
                    Ok(MergeOutcome::Finalized) => responded = true,
                    Ok(MergeOutcome::Halted) => {
                        responded = true;
                        halted = true;
                    }
                    Err(ChainError::Finalize(_)) => return Ok(StepOutcome::ProcessingFailed),
                    Err(e) => return Err(e),
                },
                Some(Ok(ModelOutput::Usage(usage))) => self.merge_usage(usage),
                Some(Err(e)) => {
                    if self.delta.take().is_some() {
                        warn!(error = %e, "discarding partial response after stream error");
                    }
                    return Err(e.into());
                }
            }
        }

        if let Some(delta) = self.delta.take() {
            if !delta.merged_content.is_empty() || !delta.tool_calls.is_empty() || !responded {
                self.record_processing_error("response stream ended before the message completed");
                return Ok(StepOutcome::ProcessingFailed);
            }
        }
        if !responded {
            return Err(ChainError::NoModelResponse);
        }
        Ok(StepOutcome::Responded { halted })
    }
}
