//! Admission layer: owns the call registry and creates backend sessions
//! for inbound and outbound calls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use voice_gateway_backend::{BackendWsClient, CreateSessionRequest, GenerationBackend};
use voice_gateway_config::Settings;
use voice_gateway_pipeline::vad::{SpeechEstimator, VadProcessorConfig};

use crate::call::{CallConfig, CallController};
use crate::sip::{CallActions, SipStack};
use crate::TelephonyError;

/// Result of a successful outbound call placement.
#[derive(Debug, Clone)]
pub struct PlacedCall {
    pub session_id: String,
}

/// Registry plus the operations the control REST exposes.
pub struct Gateway {
    backend: Arc<dyn GenerationBackend>,
    backend_url: String,
    sip: Arc<dyn SipStack>,
    estimator: Arc<dyn SpeechEstimator>,
    call_config: CallConfig,
    vad_config: VadProcessorConfig,
    calls: Mutex<HashMap<String, Arc<CallController>>>,
}

impl Gateway {
    pub fn new(
        settings: &Settings,
        backend: Arc<dyn GenerationBackend>,
        sip: Arc<dyn SipStack>,
        estimator: Arc<dyn SpeechEstimator>,
    ) -> Self {
        Self {
            backend,
            backend_url: settings.backend_url.clone(),
            sip,
            estimator,
            call_config: CallConfig::from_settings(settings),
            vad_config: VadProcessorConfig::from_settings(settings),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Place an outbound call bound to a fresh backend session.
    pub async fn place_call(
        &self,
        to_uri: &str,
        env_info: Value,
        communication_id: Option<String>,
    ) -> Result<PlacedCall, TelephonyError> {
        if !self.sip.is_ready() {
            return Err(TelephonyError::SipUnavailable);
        }
        tracing::info!(
            to_uri,
            communication_id = communication_id.as_deref().unwrap_or(""),
            "Making outbound call"
        );

        let created = self
            .backend
            .create_session(CreateSessionRequest {
                user_id: to_uri.to_string(),
                name: String::new(),
                conversation_id: String::new(),
                communication_id,
                kwargs: env_info,
            })
            .await?;

        let actions = self.sip.make_call(to_uri)?;
        let call = self.build_call(&created.session_id, created.greeting, actions);
        self.register(&call);
        call.connect_ws();
        Ok(PlacedCall {
            session_id: created.session_id,
        })
    }

    /// Accept an inbound call: open a backend session and answer 200. On
    /// backend failure the leg is rejected with 503.
    pub async fn accept_incoming(
        &self,
        actions: Arc<dyn CallActions>,
        from_uri: &str,
        sip_call_id: &str,
    ) -> Result<Arc<CallController>, TelephonyError> {
        let created = match self
            .backend
            .create_session(CreateSessionRequest {
                user_id: from_uri.to_string(),
                name: String::new(),
                conversation_id: sip_call_id.to_string(),
                communication_id: None,
                kwargs: serde_json::json!({}),
            })
            .await
        {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(from_uri, error = %e, "Backend session creation failed, rejecting");
                actions.answer(503);
                return Err(e.into());
            }
        };

        let call = self.build_call(&created.session_id, created.greeting, actions);
        self.register(&call);
        call.connect_ws();
        call.answer_ok();
        Ok(call)
    }

    /// Record a transfer target for an active call.
    pub fn transfer(
        &self,
        session_id: &str,
        to_uri: &str,
        transfer_delay: f64,
    ) -> Result<(), TelephonyError> {
        let call = self
            .get(session_id)
            .ok_or_else(|| TelephonyError::SessionNotFound(session_id.to_string()))?;
        if !call.is_confirmed() {
            return Err(TelephonyError::CallNotActive);
        }
        call.set_transfer_target(to_uri, transfer_delay);
        tracing::info!(
            session_id,
            to_uri,
            transfer_delay,
            "Transfer target set"
        );
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<CallController>> {
        self.calls.lock().get(session_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    /// The SIP leg disconnected: tear down, close the backend session with
    /// the derived status, and drop the registration.
    pub async fn finish_call(&self, session_id: &str, last_status_code: u16) {
        let call = self.calls.lock().remove(session_id);
        let Some(call) = call else {
            return;
        };
        call.handle_disconnected(last_status_code).await;
        tracing::info!(session_id, "Call unregistered");
    }

    /// Tear down every live call. Used at shutdown.
    pub async fn shutdown(&self) {
        let calls: Vec<Arc<CallController>> = {
            let mut registry = self.calls.lock();
            registry.drain().map(|(_, call)| call).collect()
        };
        for call in calls {
            call.handle_disconnected(200).await;
        }
    }

    fn build_call(
        &self,
        session_id: &str,
        greeting: Option<String>,
        actions: Arc<dyn CallActions>,
    ) -> Arc<CallController> {
        CallController::new(
            session_id,
            greeting,
            self.call_config.clone(),
            Arc::clone(&self.backend),
            actions,
            BackendWsClient::new(self.backend_url.clone()),
            Arc::clone(&self.estimator),
            self.vad_config.clone(),
        )
    }

    fn register(&self, call: &Arc<CallController>) {
        self.calls
            .lock()
            .insert(call.session_id().to_string(), Arc::clone(call));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use voice_gateway_backend::{BackendError, CommitResponse, CreatedSession};
    use voice_gateway_pipeline::player::{MediaPlayback, PlaybackHandle};
    use voice_gateway_pipeline::PipelineError;

    struct FakeBackend {
        fail_create: bool,
    }

    #[async_trait]
    impl GenerationBackend for FakeBackend {
        async fn capabilities(&self) -> Result<Value, BackendError> {
            Ok(serde_json::json!({}))
        }

        async fn create_session(
            &self,
            request: CreateSessionRequest,
        ) -> Result<CreatedSession, BackendError> {
            if self.fail_create {
                return Err(BackendError::Status {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(CreatedSession {
                session_id: format!("session-for-{}", request.user_id),
                greeting: Some("Hello".to_string()),
            })
        }

        async fn start(&self, _s: &str, _m: &str) -> Result<Value, BackendError> {
            Ok(serde_json::json!({}))
        }

        async fn commit(&self, _s: &str) -> Result<CommitResponse, BackendError> {
            Ok(CommitResponse::default())
        }

        async fn rollback(&self, _s: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn close_session(&self, _s: &str, _st: Option<&str>) -> Result<(), BackendError> {
            Ok(())
        }

        async fn synthesize(&self, _s: &str, _t: &str) -> Result<Vec<u8>, BackendError> {
            Ok(vec![0; 1000])
        }

        async fn transcribe(&self, _wav: &[u8]) -> Result<String, BackendError> {
            Ok(String::new())
        }
    }

    struct NullHandle;
    impl PlaybackHandle for NullHandle {
        fn stop(&mut self) {}
    }

    struct NullPlayback;
    impl MediaPlayback for NullPlayback {
        fn start(&self, _p: &Path) -> Result<Box<dyn PlaybackHandle>, PipelineError> {
            Ok(Box::new(NullHandle))
        }
    }

    #[derive(Default)]
    struct FakeActions {
        confirmed: bool,
    }

    impl CallActions for FakeActions {
        fn answer(&self, _status_code: u16) {}
        fn hangup_with_tag(&self, _tag: &str) {}
        fn dial_dtmf(&self, _digits: &str) {}
        fn refer(&self, _to_uri: &str) {}
        fn is_confirmed(&self) -> bool {
            self.confirmed
        }
        fn playback(&self) -> Arc<dyn MediaPlayback> {
            Arc::new(NullPlayback)
        }
    }

    struct FakeStack {
        ready: bool,
    }

    impl SipStack for FakeStack {
        fn make_call(&self, _to_uri: &str) -> Result<Arc<dyn CallActions>, TelephonyError> {
            Ok(Arc::new(FakeActions { confirmed: true }))
        }
        fn is_ready(&self) -> bool {
            self.ready
        }
    }

    struct SilentEstimator;
    impl SpeechEstimator for SilentEstimator {
        fn sampling_rate(&self) -> u32 {
            16_000
        }
        fn initialize_state(&self) -> Vec<f32> {
            Vec::new()
        }
        fn speech_probability(&self, _w: &[f32], _s: &mut Vec<f32>) -> f32 {
            0.0
        }
    }

    fn settings() -> Settings {
        Settings {
            backend_url: "http://backend:8000".to_string(),
            ..Default::default()
        }
    }

    fn gateway(fail_create: bool, sip_ready: bool) -> Gateway {
        Gateway::new(
            &settings(),
            Arc::new(FakeBackend { fail_create }),
            Arc::new(FakeStack { ready: sip_ready }),
            Arc::new(SilentEstimator),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn place_call_registers_session() {
        let gateway = gateway(false, true);
        let placed = gateway
            .place_call("sip:bob@example.com", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(placed.session_id, "session-for-sip:bob@example.com");
        assert_eq!(gateway.count(), 1);
        assert!(gateway.get(&placed.session_id).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn place_call_without_sip_is_rejected() {
        let gateway = gateway(false, false);
        let err = gateway
            .place_call("sip:bob@example.com", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TelephonyError::SipUnavailable));
        assert_eq!(gateway.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backend_failure_creates_no_call() {
        let gateway = gateway(true, true);
        let err = gateway
            .place_call("sip:bob@example.com", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TelephonyError::Backend(_)));
        assert_eq!(gateway.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transfer_requires_known_confirmed_session() {
        let gateway = gateway(false, true);
        let err = gateway.transfer("nope", "sip:op@example.com", 1.0).unwrap_err();
        assert!(matches!(err, TelephonyError::SessionNotFound(_)));

        let placed = gateway
            .place_call("sip:bob@example.com", serde_json::json!({}), None)
            .await
            .unwrap();
        assert!(gateway
            .transfer(&placed.session_id, "sip:op@example.com", 1.0)
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finish_call_unregisters() {
        let gateway = gateway(false, true);
        let placed = gateway
            .place_call("sip:bob@example.com", serde_json::json!({}), None)
            .await
            .unwrap();
        gateway.finish_call(&placed.session_id, 200).await;
        assert_eq!(gateway.count(), 0);
        // A second disconnect for the same session is a no-op.
        gateway.finish_call(&placed.session_id, 200).await;
    }
}
