//! Observability for the consumer pipeline
//!
//! Structured logging via tracing and a global metrics collector covering
//! connection health, inbox pressure and dispatch outcomes.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{dispatch_span, mqtt_span};
