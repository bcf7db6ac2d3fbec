//! Per-call conversational control plane: the call state machine, the
//! admission registry, and the narrow capability traits the SIP adapter
//! implements.

mod call;
mod gateway;
mod sip;
mod status;
mod synth;

pub use call::{CallConfig, CallController, CallState};
pub use gateway::{Gateway, PlacedCall};
pub use sip::{CallActions, SipStack, TransferStatus};
pub use status::close_status_for;
pub use synth::BackendSynthesizer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelephonyError {
    #[error("SIP stack is not initialized")]
    SipUnavailable,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("call is not active")]
    CallNotActive,

    #[error(transparent)]
    Backend(#[from] voice_gateway_backend::BackendError),

    #[error(transparent)]
    Pipeline(#[from] voice_gateway_pipeline::PipelineError),
}
