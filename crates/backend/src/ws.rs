//! Backend WebSocket reply stream.
//!
//! One connection per session at `ws(s)://backend/ws/{session_id}`. The
//! client never pings; on close or error it reconnects after a fixed delay
//! until stopped. Messages are dispatched in arrival order on the reader
//! task.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use voice_gateway_config::ws::RECONNECT_DELAY_SECS;
use voice_gateway_core::urls;

/// Decoded backend WebSocket events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    /// A streamed reply fragment.
    Message { text: String },
    /// End of the current reply stream.
    Eos,
    /// End of the conversation.
    Eoc,
    /// Backend-side session timeout.
    Timeout,
    /// Backend asked to close the session.
    Close,
}

/// Receives events in arrival order on the WebSocket reader task.
pub type WsEventHandler = Arc<dyn Fn(WsEvent) + Send + Sync>;

/// Reconnecting WebSocket client for one backend session.
pub struct BackendWsClient {
    base_url: String,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackendWsClient {
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            base_url: backend_url.into(),
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Start the connection loop. A second call is ignored while running.
    pub fn connect(&self, session_id: &str, handler: WsEventHandler) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);
        let url = format!(
            "{}/ws/{}",
            urls::websocket_base(&self.base_url),
            session_id
        );
        let session_id = session_id.to_string();
        *worker = Some(tokio::spawn(run_loop(url, session_id, handler, shutdown_rx)));
    }

    /// Stop the loop and wait for the reader task to finish.
    pub async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }
    }
}

async fn run_loop(
    url: String,
    session_id: String,
    handler: WsEventHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tracing::info!(session_id = %session_id, url = %url, "Connecting backend WebSocket");
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                let (_sink, mut reader) = stream.split();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        frame = reader.next() => {
                            match frame {
                                Some(Ok(Message::Text(payload))) => {
                                    dispatch(&session_id, &payload, &handler);
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    tracing::info!(session_id = %session_id, "Backend WebSocket disconnected");
                                    handler(WsEvent::Close);
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    tracing::warn!(session_id = %session_id, error = %e, "Backend WebSocket error");
                                    handler(WsEvent::Close);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Backend WebSocket connect failed");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
        }
    }
}

fn dispatch(session_id: &str, payload: &str, handler: &WsEventHandler) {
    let Some(event) = parse_event(payload) else {
        tracing::debug!(session_id = %session_id, payload = %payload, "Ignoring malformed WS payload");
        return;
    };
    handler(event);
}

fn parse_event(payload: &str) -> Option<WsEvent> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let kind = value.get("type").and_then(serde_json::Value::as_str)?;
    match kind {
        "eos" => Some(WsEvent::Eos),
        "eoc" => Some(WsEvent::Eoc),
        "timeout" => Some(WsEvent::Timeout),
        "close" => Some(WsEvent::Close),
        _ => {
            // Anything else carries a reply fragment.
            let text = value
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(WsEvent::Message { text })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_event_types() {
        assert_eq!(
            parse_event(r#"{"type":"message","message":"Sure, when?"}"#),
            Some(WsEvent::Message {
                text: "Sure, when?".to_string()
            })
        );
        assert_eq!(parse_event(r#"{"type":"eos"}"#), Some(WsEvent::Eos));
        assert_eq!(parse_event(r#"{"type":"eoc"}"#), Some(WsEvent::Eoc));
        assert_eq!(parse_event(r#"{"type":"timeout"}"#), Some(WsEvent::Timeout));
        assert_eq!(parse_event(r#"{"type":"close"}"#), Some(WsEvent::Close));
    }

    #[test]
    fn unknown_types_fall_back_to_message() {
        assert_eq!(
            parse_event(r#"{"type":"note","message":"hi"}"#),
            Some(WsEvent::Message {
                text: "hi".to_string()
            })
        );
    }

    #[test]
    fn malformed_payloads_are_skipped() {
        assert_eq!(parse_event("not json"), None);
        assert_eq!(parse_event(r#"{"no_type":1}"#), None);
    }
}
