//! Severity-driven retry with exponential backoff and jitter.
//!
//! Only `RETRYABLE` errors are retried. Anything else is returned unchanged
//! on the first failure. When retries run out the last error is escalated to
//! `CRITICAL`, keeping its code, message and stage, with the retry history
//! merged into its context.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::errors::{ErrorSummary, NexusError, Severity};

const DEFAULT_MAX_RETRIES: i64 = 3;
const DEFAULT_BASE_DELAY_MS: i64 = 1000;
const DEFAULT_MAX_DELAY_MS: i64 = 30_000;

/// Retry policy.
///
/// Fields are signed because policies arrive from configuration files;
/// negative values are rejected by [`RetryOptions::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    /// Retries after the first call.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: i64,
    /// Cap applied before jitter.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: i64,
    /// Stage name stamped on errors raised by the retry loop itself.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stage: String,
}

fn default_max_retries() -> i64 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> i64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> i64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            stage: String::new(),
        }
    }
}

impl RetryOptions {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that retries immediately, used by tests and benches.
    #[must_use]
    pub fn immediate(max_retries: i64) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
            stage: String::new(),
        }
    }

    /// Sets the number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: i64) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: i64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: i64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the stage name.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    fn stage_label(&self) -> &str {
        if self.stage.is_empty() {
            "retry"
        } else {
            &self.stage
        }
    }

    /// Rejects negative counts and delays.
    pub fn validate(&self) -> Result<(), NexusError> {
        let invalid = [
            ("maxRetries", self.max_retries),
            ("baseDelay", self.base_delay_ms),
            ("maxDelay", self.max_delay_ms),
        ]
        .into_iter()
        .find(|(_, value)| *value < 0);

        match invalid {
            Some((field, value)) => Err(NexusError::critical(
                "RETRY_INVALID_OPTIONS",
                format!("{field} must be non-negative, got {value}"),
                self.stage_label(),
            )
            .with_context_entry("field", field)
            .with_context_entry("value", value)),
            None => Ok(()),
        }
    }
}

/// One failed attempt in a retry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEvent {
    /// 1-based attempt number that failed.
    pub attempt: u32,
    /// The failure.
    pub error: ErrorSummary,
    /// Sleep before the next attempt; 0 for the final failure.
    pub delay: u64,
}

/// Successful outcome of [`with_retry`].
#[derive(Debug, Clone)]
pub struct RetryResult<T> {
    /// The operation's value.
    pub result: T,
    /// Calls made, counting the first call as attempt 1.
    pub attempts: u32,
    /// Sum of backoff sleeps.
    pub total_delay_ms: u64,
    /// Failed attempts that preceded success.
    pub history: Vec<RetryEvent>,
}

/// Observer notified before each backoff sleep.
pub trait RetryObserver: Send + Sync {
    /// Called once per retry with the retry number, the delay, and the error.
    fn on_retry(&self, attempt: u32, delay: Duration, error: &NexusError);
}

impl<F> RetryObserver for F
where
    F: Fn(u32, Duration, &NexusError) + Send + Sync,
{
    fn on_retry(&self, attempt: u32, delay: Duration, error: &NexusError) {
        self(attempt, delay, error);
    }
}

/// Computes `min(base * 2^attempt, max) * jitter`.
///
/// `attempt` is 0 for the first retry.
#[must_use]
pub fn backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, jitter: f64) -> Duration {
    let exp = base_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped = exp.min(max_delay_ms);
    if capped == 0 {
        return Duration::ZERO;
    }
    let jitter = jitter.clamp(0.0, 1.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let millis = (capped as f64 * jitter).round() as u64;
    Duration::from_millis(millis)
}

/// Samples a jitter factor uniformly from `[0.5, 1.0]`.
#[must_use]
pub fn sample_jitter() -> f64 {
    rand::thread_rng().gen_range(0.5..=1.0)
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn exhausted(last: NexusError, attempts: u32, history: Vec<RetryEvent>) -> NexusError {
    let mut context = last.context.clone();
    context.insert("originalSeverity".to_string(), serde_json::json!(Severity::Retryable));
    context.insert("retryAttempts".to_string(), serde_json::json!(attempts));
    context.insert("exhaustedRetries".to_string(), serde_json::json!(true));
    context.insert("retryHistory".to_string(), serde_json::json!(history));

    NexusError::critical(last.code, last.message, last.stage).with_context(context)
}

/// Runs `operation`, retrying `RETRYABLE` failures with backoff.
///
/// Options are validated before the first call; invalid options fail with
/// `RETRY_INVALID_OPTIONS` without invoking `operation`.
pub async fn with_retry<T, F, Fut>(
    mut operation: F,
    options: &RetryOptions,
    observer: Option<&dyn RetryObserver>,
) -> Result<RetryResult<T>, NexusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NexusError>>,
{
    options.validate()?;

    let max_retries = u32::try_from(options.max_retries).unwrap_or(u32::MAX);
    let base = non_negative(options.base_delay_ms);
    let max = non_negative(options.max_delay_ms);

    let mut history = Vec::new();
    let mut total_delay_ms = 0u64;
    let mut retries = 0u32;

    loop {
        let attempt = retries + 1;
        let err = match operation().await {
            Ok(result) => {
                return Ok(RetryResult {
                    result,
                    attempts: attempt,
                    total_delay_ms,
                    history,
                })
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if retries >= max_retries {
            tracing::warn!(
                stage = %err.stage,
                code = %err.code,
                attempts = attempt,
                "Retries exhausted"
            );
            history.push(RetryEvent {
                attempt,
                error: err.summary(),
                delay: 0,
            });
            return Err(exhausted(err, attempt, history));
        }

        let delay = backoff_delay(retries, base, max, sample_jitter());
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        history.push(RetryEvent {
            attempt,
            error: err.summary(),
            delay: delay_ms,
        });

        if let Some(observer) = observer {
            observer.on_retry(attempt, delay, &err);
        }
        tracing::debug!(
            stage = %err.stage,
            code = %err.code,
            attempt,
            delay_ms,
            "Retrying after error"
        );

        total_delay_ms = total_delay_ms.saturating_add(delay_ms);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> NexusError {
        NexusError::retryable("API_TIMEOUT", "upstream timed out", "research")
    }

    #[test]
    fn test_retry_options_default() {
        let options = RetryOptions::default();
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.base_delay_ms, 1000);
        assert_eq!(options.max_delay_ms, 30_000);
    }

    #[test]
    fn test_backoff_delay_exponential_without_jitter() {
        assert_eq!(backoff_delay(0, 100, 10_000, 1.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, 100, 10_000, 1.0), Duration::from_millis(200));
        assert_eq!(backoff_delay(2, 100, 10_000, 1.0), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_delay_capped_then_jittered() {
        assert_eq!(backoff_delay(10, 1000, 5000, 1.0), Duration::from_millis(5000));
        assert_eq!(backoff_delay(10, 1000, 5000, 0.5), Duration::from_millis(2500));
        assert_eq!(backoff_delay(63, u64::MAX, 7, 1.0), Duration::from_millis(7));
    }

    #[test]
    fn test_backoff_delay_zero_stays_zero() {
        assert_eq!(backoff_delay(3, 0, 1000, 0.7), Duration::ZERO);
        assert_eq!(backoff_delay(3, 100, 0, 0.7), Duration::ZERO);
    }

    #[test]
    fn test_jitter_range() {
        for _ in 0..100 {
            let j = sample_jitter();
            assert!((0.5..=1.0).contains(&j));
        }
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, NexusError>(42) }
            },
            &RetryOptions::immediate(3),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.result, 42);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.total_delay_ms, 0);
        assert!(result.history.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(transient())
                    } else {
                        Ok("done")
                    }
                }
            },
            &RetryOptions::immediate(3),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(result.history.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_invokes_n_plus_one_times() {
        let calls = AtomicU32::new(0);
        let err = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient().with_context_entry("provider", "gemini")) }
            },
            &RetryOptions::immediate(4),
            None,
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(err.severity, Severity::Critical);
        assert_eq!(err.code, "API_TIMEOUT");
        assert_eq!(err.message, "upstream timed out");
        assert_eq!(err.stage, "research");
        assert_eq!(err.context["retryAttempts"], 5);
        assert_eq!(err.context["exhaustedRetries"], true);
        assert_eq!(err.context["originalSeverity"], "RETRYABLE");
        assert_eq!(err.context["provider"], "gemini");
        assert_eq!(err.context["retryHistory"].as_array().unwrap().len(), 5);
        assert!(err.exhausted_retries());
    }

    #[tokio::test]
    async fn test_zero_retries_escalates_after_one_call() {
        let calls = AtomicU32::new(0);
        let err = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient()) }
            },
            &RetryOptions::immediate(0),
            None,
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_critical());
        assert_eq!(err.context["retryAttempts"], 1);
    }

    #[tokio::test]
    async fn test_non_retryable_severities_fail_immediately() {
        for original in [
            NexusError::critical("SCRIPT_INVALID_INPUT", "bad", "script-gen"),
            NexusError::degraded("VISUAL_PARTIAL", "bad", "visual-gen"),
            NexusError::fallback("TTS_PROVIDER_DOWN", "bad", "tts"),
            NexusError::recoverable("TWITTER_POST_FAILED", "bad", "twitter"),
        ] {
            let calls = AtomicU32::new(0);
            let err = with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let e = original.clone();
                    async move { Err::<(), _>(e) }
                },
                &RetryOptions::immediate(5),
                None,
            )
            .await
            .unwrap_err();

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(err, original);
        }
    }

    #[tokio::test]
    async fn test_invalid_options_never_invoke() {
        for options in [
            RetryOptions::immediate(-1),
            RetryOptions::immediate(1).with_base_delay_ms(-5),
            RetryOptions::immediate(1).with_max_delay_ms(-1),
        ] {
            let calls = AtomicU32::new(0);
            let err = with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, NexusError>(()) }
                },
                &options.with_stage("tts"),
                None,
            )
            .await
            .unwrap_err();

            assert_eq!(err.code, "RETRY_INVALID_OPTIONS");
            assert_eq!(err.stage, "tts");
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_observer_fires_once_per_retry() {
        let seen: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        let observer = |attempt: u32, _delay: Duration, err: &NexusError| {
            assert_eq!(err.code, "API_TIMEOUT");
            seen.lock().push(attempt);
        };

        let _ = with_retry(
            || async { Err::<(), _>(transient()) },
            &RetryOptions::immediate(3),
            Some(&observer),
        )
        .await;
        assert_eq!(*seen.lock(), vec![1, 2, 3]);

        seen.lock().clear();
        let _ = with_retry(|| async { Ok::<_, NexusError>(1) }, &RetryOptions::immediate(3), Some(&observer)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_total_delay_is_jittered_sum() {
        let options = RetryOptions::new()
            .with_max_retries(2)
            .with_base_delay_ms(4)
            .with_max_delay_ms(4);
        let calls = AtomicU32::new(0);

        let result = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(transient()) } else { Ok(()) } }
            },
            &options,
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 3);
        assert!((4..=8).contains(&result.total_delay_ms));
        assert!(result.history.iter().all(|e| (2..=4).contains(&e.delay)));
    }
}
