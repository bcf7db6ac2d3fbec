//! Control REST surface and process entry point.

mod http;
mod metrics;

pub use http::{create_router, AppState};
pub use metrics::metrics_handler;
