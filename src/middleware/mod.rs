//! # Middleware
//!
//! - **RequestLogging**: structured request and WebSocket-upgrade logging
//! - **MetricsMiddleware**: per-route request counts, latency and error rates

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
