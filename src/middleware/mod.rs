//! HTTP middleware: request logging with request ids, and request metrics.

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
