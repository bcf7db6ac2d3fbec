//! Per-call audio pipeline: the audio port at the SIP media boundary, the
//! streaming voice-activity detector with its pause classifier, the TTS
//! pipeline, and the ordered playback queue.

pub mod player;
pub mod port;
pub mod tts;
pub mod vad;

use thiserror::Error;

/// Errors surfaced by pipeline components.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("model error: {0}")]
    Model(String),

    #[error("audio error: {0}")]
    Audio(String),

    #[error("tts error: {0}")]
    Tts(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
