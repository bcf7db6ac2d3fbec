//! Typed payloads of the backend protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters for `POST /session_v2`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub name: String,
    pub conversation_id: String,
    pub communication_id: Option<String>,
    /// Opaque environment info forwarded as `kwargs`.
    pub kwargs: Value,
}

impl CreateSessionRequest {
    /// The multipart `body` field content. Session type is always `sip` and
    /// `args` is always empty for gateway-created sessions.
    pub fn to_body_json(&self) -> Value {
        serde_json::json!({
            "user_id": self.user_id,
            "name": self.name,
            "type": "sip",
            "conversation_id": self.conversation_id,
            "communication_id": self.communication_id,
            "args": [],
            "kwargs": self.kwargs,
        })
    }
}

/// Result of session creation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedSession {
    pub session_id: String,
    /// Optional greeting the gateway plays once the call is confirmed.
    pub greeting: Option<String>,
}

/// Response of `POST /session/{id}/commit`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitResponse {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl CommitResponse {
    /// Whether the backend marked the conversation as over.
    pub fn session_ends(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("SESSION_ENDS"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
