//! Shared primitives for the voice gateway: PCM sample handling, WAV
//! framing, and the small text/URL utilities the call path depends on.

pub mod audio;
pub mod metrics;
pub mod text;
pub mod urls;
pub mod wav;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid WAV payload: {0}")]
    Wav(String),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}
