//! Configuration for the voice gateway.
//!
//! Settings are read from the process environment, with an optional `.env`
//! file loaded first. The `.env` file deliberately *overrides* already-set
//! environment variables; deployments rely on dropping a dotenv next to the
//! binary to pin a configuration regardless of what the container injects.

mod constants;
mod settings;

pub use constants::*;
pub use settings::{load_settings, Settings};

use thiserror::Error;

/// Configuration errors. Any of these aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),
}
