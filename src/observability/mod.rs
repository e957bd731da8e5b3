//! Observability for the relay
//!
//! Structured logging through `tracing` and a process-wide metrics collector
//! served by the HTTP surface.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{gateway_span, session_span};
