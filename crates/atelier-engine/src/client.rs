use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use atelier_contracts::config::RetryConfig;
use atelier_contracts::error::ErrorKind;
use atelier_contracts::events::{EventPayload, EventWriter};
use atelier_contracts::vocabulary::VocabularyTier;
use serde::Serialize;
use serde_json::Value;

use crate::composer::{ComposedRequest, CompositionInput, RequestComposer};
use crate::providers::{GenerationProvider, ProviderError, ProviderPayload};

const POLICY_RETRY_LIMIT: u32 = 1;

/// Waits out a backoff interval.
pub trait BackoffSleeper: Send + Sync {
    fn sleep(&self, wait: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl BackoffSleeper for ThreadSleeper {
    fn sleep(&self, wait: Duration) {
        thread::sleep(wait);
    }
}

/// Cooperative cancellation flag shared between a caller and in-flight runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Success,
    Failed,
    Cancelled,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub status: GenerationStatus,
    pub payload: Option<ProviderPayload>,
    pub attempts: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error_message: Option<String>,
    pub backoff_waits: u32,
    /// The last request handed to the provider (or that would have been).
    pub request: ComposedRequest,
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        self.status == GenerationStatus::Success
    }
}

#[derive(Debug, Default)]
struct RetryCounters {
    rate_limited: u32,
    transport: u32,
    server: u32,
    policy: u32,
}

/// Drives one composed request to a terminal state against a provider.
pub struct GenerationClient {
    provider: Arc<dyn GenerationProvider>,
    retry: RetryConfig,
    sleeper: Arc<dyn BackoffSleeper>,
    events: EventWriter,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn GenerationProvider>, retry: RetryConfig) -> Self {
        Self {
            provider,
            retry,
            sleeper: Arc::new(ThreadSleeper),
            events: EventWriter::detached(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn BackoffSleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Errors are reported through the outcome, never returned.
    pub fn execute(
        &self,
        composer: &RequestComposer,
        input: &CompositionInput<'_>,
        cancel: &CancelToken,
    ) -> GenerationOutcome {
        let mut request = composer.compose(input, VocabularyTier::Default);
        self.record_composed(&request);
        let mut counters = RetryCounters::default();
        let mut attempts = 0u32;
        let mut backoff_waits = 0u32;

        loop {
            if cancel.is_cancelled() {
                return self.finish(cancelled(request, attempts, backoff_waits));
            }
            attempts += 1;
            self.record_attempt(&request, attempts);
            let err = match self.provider.submit(&request) {
                Ok(payload) => {
                    return self.finish(GenerationOutcome {
                        status: GenerationStatus::Success,
                        payload: Some(payload),
                        attempts,
                        last_error_kind: None,
                        last_error_message: None,
                        backoff_waits,
                        request,
                    });
                }
                Err(err) => err,
            };
            log::debug!(
                "attempt {attempts} for request {} failed: {err}",
                request.request_id
            );

            let retry_allowed = match &err {
                ProviderError::PolicyRejected { .. } => {
                    if counters.policy < POLICY_RETRY_LIMIT {
                        counters.policy += 1;
                        request = composer.compose(input, VocabularyTier::Fallback);
                        self.record_composed(&request);
                        continue;
                    }
                    false
                }
                _ if err.kind().uses_backoff() => {
                    let (used, limit) = match err.kind() {
                        ErrorKind::RateLimited => {
                            (&mut counters.rate_limited, self.retry.max_rate_limit_retries)
                        }
                        ErrorKind::Transport => {
                            (&mut counters.transport, self.retry.max_transport_retries)
                        }
                        _ => (&mut counters.server, self.retry.max_server_retries),
                    };
                    bump(used, limit)
                }
                _ => false,
            };
            if !retry_allowed {
                return self.finish(failed(request, attempts, backoff_waits, &err));
            }

            if cancel.is_cancelled() {
                return self.finish(cancelled(request, attempts, backoff_waits));
            }
            let wait = err.retry_after().unwrap_or_else(|| self.retry.backoff());
            self.record_backoff(&request, &err, wait);
            self.sleeper.sleep(wait);
            backoff_waits += 1;
        }
    }

    fn record_composed(&self, request: &ComposedRequest) {
        let mut payload = EventPayload::new();
        payload.insert("request".to_string(), request.preview());
        self.events.record("request_composed", payload);
    }

    fn record_attempt(&self, request: &ComposedRequest, attempt: u32) {
        let mut payload = request_fields(request);
        payload.insert("attempt".to_string(), Value::from(attempt));
        payload.insert("provider".to_string(), Value::from(self.provider.name()));
        self.events.record("generation_attempt", payload);
    }

    fn record_backoff(&self, request: &ComposedRequest, err: &ProviderError, wait: Duration) {
        let mut payload = request_fields(request);
        payload.insert("error_kind".to_string(), Value::from(err.kind().as_str()));
        payload.insert("wait_ms".to_string(), Value::from(wait.as_millis() as u64));
        self.events.record("generation_backoff", payload);
    }

    fn finish(&self, outcome: GenerationOutcome) -> GenerationOutcome {
        let mut payload = request_fields(&outcome.request);
        payload.insert("status".to_string(), Value::from(outcome.status.as_str()));
        payload.insert("attempts".to_string(), Value::from(outcome.attempts));
        payload.insert("backoff_waits".to_string(), Value::from(outcome.backoff_waits));
        payload.insert(
            "error_kind".to_string(),
            outcome
                .last_error_kind
                .map(|kind| Value::from(kind.as_str()))
                .unwrap_or(Value::Null),
        );
        self.events.record("generation_finished", payload);
        if outcome.status == GenerationStatus::Failed {
            log::warn!(
                "generation for '{}' failed after {} attempt(s): {}",
                outcome.request.persona_id,
                outcome.attempts,
                outcome.last_error_message.as_deref().unwrap_or_default()
            );
        }
        outcome
    }
}

fn bump(counter: &mut u32, limit: u32) -> bool {
    if *counter >= limit {
        return false;
    }
    *counter += 1;
    true
}

fn request_fields(request: &ComposedRequest) -> EventPayload {
    let mut payload = EventPayload::new();
    payload.insert("request_id".to_string(), Value::from(request.request_id.clone()));
    payload.insert("persona_id".to_string(), Value::from(request.persona_id.clone()));
    payload.insert(
        "vocabulary_tier".to_string(),
        Value::from(request.vocabulary_tier.as_str()),
    );
    payload
}

fn cancelled(request: ComposedRequest, attempts: u32, backoff_waits: u32) -> GenerationOutcome {
    GenerationOutcome {
        status: GenerationStatus::Cancelled,
        payload: None,
        attempts,
        last_error_kind: Some(ErrorKind::Cancelled),
        last_error_message: Some("cancelled by caller".to_string()),
        backoff_waits,
        request,
    }
}

fn failed(
    request: ComposedRequest,
    attempts: u32,
    backoff_waits: u32,
    err: &ProviderError,
) -> GenerationOutcome {
    GenerationOutcome {
        status: GenerationStatus::Failed,
        payload: None,
        attempts,
        last_error_kind: Some(err.kind()),
        last_error_message: Some(err.to_string()),
        backoff_waits,
        request,
    }
}
