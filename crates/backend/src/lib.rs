//! Client side of the conversational backend: HTTP session operations and
//! the per-session WebSocket reply stream.

mod client;
mod protocol;
mod ws;

pub use client::{BackendClient, GenerationBackend, LocalSttConfig};
pub use protocol::{CommitResponse, CreateSessionRequest, CreatedSession};
pub use ws::{BackendWsClient, WsEvent, WsEventHandler};

use thiserror::Error;

/// Errors from backend interaction.
///
/// Public operations surface these to their caller; background handlers log
/// and continue.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend returned 403.
    #[error("backend permission error: {0}")]
    Permission(String),

    /// Backend returned any other non-2xx status.
    #[error("backend error ({status}): {message}")]
    Status { status: u16, message: String },

    /// Socket-level failure.
    #[error("backend request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Malformed payload from the backend.
    #[error("backend protocol error: {0}")]
    Protocol(String),
}
