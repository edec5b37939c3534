//! Ordered provider fallback.
//!
//! Providers are tried strictly in order, one at a time. Any error moves on
//! to the next provider; the first success wins and is tagged `primary` or
//! `fallback` depending on its position.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Instant;

use crate::core::ProviderTier;
use crate::errors::{ErrorSummary, NexusError};

/// Anything that can be tried as a provider.
pub trait NamedProvider {
    /// Provider name used in attempt logs and `stage:provider` entries.
    fn name(&self) -> &str;
}

impl NamedProvider for String {
    fn name(&self) -> &str {
        self
    }
}

impl NamedProvider for &str {
    fn name(&self) -> &str {
        self
    }
}

/// Options for [`with_fallback`].
#[derive(Debug, Clone, Default)]
pub struct FallbackOptions {
    /// Stage name stamped on errors raised by the fallback loop.
    pub stage: Option<String>,
}

impl FallbackOptions {
    /// Options for a specific stage.
    #[must_use]
    pub fn for_stage(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
        }
    }

    fn stage_label(&self) -> &str {
        self.stage.as_deref().unwrap_or("fallback")
    }
}

/// One provider attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackAttempt {
    /// Provider name.
    pub provider: String,
    /// Whether the provider succeeded.
    pub success: bool,
    /// Time spent on this provider.
    pub duration_ms: u64,
    /// The failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

/// Successful outcome of [`with_fallback`].
#[derive(Debug, Clone)]
pub struct FallbackResult<T> {
    /// The provider's value.
    pub result: T,
    /// Name of the provider that succeeded.
    pub provider: String,
    /// `Primary` if the first provider succeeded.
    pub tier: ProviderTier,
    /// Every attempt, in order, including the successful one.
    pub attempts: Vec<FallbackAttempt>,
}

/// Observer notified on each provider switch.
pub trait FallbackObserver: Send + Sync {
    /// Called when moving from `from` to `to` after `error`.
    fn on_fallback(&self, from: &str, to: &str, error: &NexusError);
}

impl<F> FallbackObserver for F
where
    F: Fn(&str, &str, &NexusError) + Send + Sync,
{
    fn on_fallback(&self, from: &str, to: &str, error: &NexusError) {
        self(from, to, error);
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Runs `executor` against each provider until one succeeds.
///
/// Fails with `FALLBACK_NO_PROVIDERS` on an empty list and with
/// `FALLBACK_EXHAUSTED` once every provider has failed.
pub async fn with_fallback<P, T, F, Fut>(
    providers: &[P],
    mut executor: F,
    options: &FallbackOptions,
    observer: Option<&dyn FallbackObserver>,
) -> Result<FallbackResult<T>, NexusError>
where
    P: NamedProvider,
    F: FnMut(&P) -> Fut,
    Fut: Future<Output = Result<T, NexusError>>,
{
    if providers.is_empty() {
        return Err(NexusError::critical(
            "FALLBACK_NO_PROVIDERS",
            "No providers configured",
            options.stage_label(),
        ));
    }

    let mut attempts = Vec::with_capacity(providers.len());
    for (index, provider) in providers.iter().enumerate() {
        let start = Instant::now();
        match executor(provider).await {
            Ok(result) => {
                attempts.push(FallbackAttempt {
                    provider: provider.name().to_string(),
                    success: true,
                    duration_ms: elapsed_ms(start),
                    error: None,
                });
                let tier = if index == 0 {
                    ProviderTier::Primary
                } else {
                    ProviderTier::Fallback
                };
                return Ok(FallbackResult {
                    result,
                    provider: provider.name().to_string(),
                    tier,
                    attempts,
                });
            }
            Err(err) => {
                attempts.push(FallbackAttempt {
                    provider: provider.name().to_string(),
                    success: false,
                    duration_ms: elapsed_ms(start),
                    error: Some(err.summary()),
                });

                if let Some(next) = providers.get(index + 1) {
                    tracing::warn!(
                        stage = options.stage_label(),
                        from = provider.name(),
                        to = next.name(),
                        code = %err.code,
                        "Provider failed, falling back"
                    );
                    if let Some(observer) = observer {
                        observer.on_fallback(provider.name(), next.name(), &err);
                    }
                }
            }
        }
    }

    let summary: Vec<serde_json::Value> = attempts
        .iter()
        .map(|a| {
            serde_json::json!({
                "provider": a.provider,
                "success": false,
                "errorCode": a.error.as_ref().map(|e| e.code.clone()),
                "durationMs": a.duration_ms,
            })
        })
        .collect();

    Err(NexusError::critical(
        "FALLBACK_EXHAUSTED",
        format!("All {} providers failed", providers.len()),
        options.stage_label(),
    )
    .with_context_entry("attempts", summary))
}
