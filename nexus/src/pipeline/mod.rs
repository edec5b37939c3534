//! Pipeline execution.
//!
//! This module provides:
//! - The retry and fallback primitives stages and the executor build on
//! - The resumable executor driving the fixed stage order
//! - The aggregate run result

mod executor;
mod fallback;
mod result;
mod retry;

#[cfg(test)]
mod executor_tests;

pub use executor::{ExecutorBuilder, PipelineExecutor};
pub use fallback::{
    with_fallback, FallbackAttempt, FallbackObserver, FallbackOptions, FallbackResult, NamedProvider,
};
pub use result::PipelineResult;
pub use retry::{
    backoff_delay, sample_jitter, with_retry, RetryEvent, RetryObserver, RetryOptions, RetryResult,
};
pub use crate::state::SkipInfo;
