//! TaskSync Telemetry - Observability
//!
//! Provides:
//! - `MetricsRegistry`: Prometheus metrics for sync transactions, conflicts and batch runs
//! - `logging::init`: `tracing-subscriber` setup driven by `LoggingConfig`

pub mod logging;
pub mod metrics;

pub use metrics::MetricsRegistry;
