//! Logging bootstrap and HTTP observability middleware shared by the
//! Phoenix binaries.

pub mod logging;
pub mod metrics;
pub mod middleware;

pub use logging::{init_logging, init_logging_json};
pub use metrics::ApiMetrics;
