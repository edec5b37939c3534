//! Observability utilities.

mod logging;
mod timer;

pub use logging::{init_tracing, LogFormat, DEFAULT_LOG_FILTER};
pub use timer::SpanTimer;
