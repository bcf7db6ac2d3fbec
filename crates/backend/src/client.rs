//! Backend HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use voice_gateway_config::Settings;
use voice_gateway_core::urls;

use crate::protocol::{CommitResponse, CreateSessionRequest, CreatedSession};
use crate::BackendError;

/// The conversational backend as seen by the call controller.
///
/// The controller is written against this trait so tests can drive it with
/// scripted backends.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn capabilities(&self) -> Result<Value, BackendError>;

    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, BackendError>;

    /// Speculative or committed generation input for the session.
    async fn start(&self, session_id: &str, message: &str) -> Result<Value, BackendError>;

    async fn commit(&self, session_id: &str) -> Result<CommitResponse, BackendError>;

    async fn rollback(&self, session_id: &str) -> Result<(), BackendError>;

    async fn close_session(
        &self,
        session_id: &str,
        status: Option<&str>,
    ) -> Result<(), BackendError>;

    /// Synthesize `text` with the session's voice; returns a WAV blob.
    async fn synthesize(&self, session_id: &str, text: &str) -> Result<Vec<u8>, BackendError>;

    /// Transcribe a WAV blob; an empty string means nothing was recognized.
    async fn transcribe(&self, wav: &[u8]) -> Result<String, BackendError>;
}

/// Local speech-to-text sidecar, used instead of the backend `/transcribe`
/// when configured.
#[derive(Debug, Clone)]
pub struct LocalSttConfig {
    pub url: String,
    pub lang: String,
}

/// reqwest-backed [`GenerationBackend`].
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    authorization_token: Option<String>,
    local_stt: Option<LocalSttConfig>,
}

impl BackendClient {
    pub fn new(
        base_url: impl Into<String>,
        authorization_token: Option<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            authorization_token,
            local_stt: None,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, BackendError> {
        let mut client = Self::new(
            settings.backend_url.clone(),
            settings.authorization_token.clone(),
            Duration::from_secs_f64(settings.backend_request_timeout),
            Duration::from_secs_f64(settings.backend_connect_timeout),
            Duration::from_secs_f64(settings.backend_sock_read_timeout),
        )?;
        if settings.use_local_stt && !settings.local_stt_url.is_empty() {
            client.local_stt = Some(LocalSttConfig {
                url: settings.local_stt_url.clone(),
                lang: settings.local_stt_lang.clone(),
            });
        }
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.authorization_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Map a non-2xx response into the error taxonomy, extracting the
    /// backend's `message` field when the body is JSON.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        if status.as_u16() == 403 {
            Err(BackendError::Permission(message))
        } else {
            Err(BackendError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value, BackendError> {
        let response = self.authorized(self.http.get(self.endpoint(path))).send().await?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        let response = self
            .authorized(self.http.post(self.endpoint(path)))
            .json(body)
            .send()
            .await?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))
    }

    async fn transcribe_local(&self, cfg: &LocalSttConfig, wav: &[u8]) -> Result<String, BackendError> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("file.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| BackendError::Protocol(e.to_string()))?,
            )
            .text("lang", cfg.lang.clone());
        let response = self.http.post(&cfg.url).multipart(form).send().await?;
        let response = Self::check(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        Ok(extract_transcription(&value))
    }
}

/// `/transcribe` may answer with a bare JSON string or `{"text": ...}`.
fn extract_transcription(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

#[async_trait]
impl GenerationBackend for BackendClient {
    async fn capabilities(&self) -> Result<Value, BackendError> {
        self.get_json("/capabilities").await
    }

    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, BackendError> {
        let body = request.to_body_json().to_string();
        let form = reqwest::multipart::Form::new().part(
            "body",
            reqwest::multipart::Part::text(body)
                .mime_str("application/json")
                .map_err(|e| BackendError::Protocol(e.to_string()))?,
        );
        let response = self
            .authorized(self.http.post(self.endpoint("/session_v2")))
            .multipart(form)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))?;

        let session_id = value
            .pointer("/session/session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Protocol("missing session.session_id".to_string()))?
            .to_string();
        let greeting = value
            .get("greeting")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(CreatedSession {
            session_id,
            greeting,
        })
    }

    async fn start(&self, session_id: &str, message: &str) -> Result<Value, BackendError> {
        let body = serde_json::json!({"message": message, "kwargs": {}});
        self.post_json(&format!("/session/{session_id}/start"), &body)
            .await
    }

    async fn commit(&self, session_id: &str) -> Result<CommitResponse, BackendError> {
        let value = self
            .post_json(&format!("/session/{session_id}/commit"), &serde_json::json!({}))
            .await?;
        serde_json::from_value(value).map_err(|e| BackendError::Protocol(e.to_string()))
    }

    async fn rollback(&self, session_id: &str) -> Result<(), BackendError> {
        self.post_json(&format!("/session/{session_id}/rollback"), &serde_json::json!({}))
            .await
            .map(|_| ())
    }

    async fn close_session(
        &self,
        session_id: &str,
        status: Option<&str>,
    ) -> Result<(), BackendError> {
        let mut request = self.http.delete(self.endpoint(&format!("/session/{session_id}")));
        if let Some(status) = status {
            request = request.query(&[("status", status)]);
        }
        let response = self.authorized(request).send().await?;
        Self::check(response).await.map(|_| ())
    }

    async fn synthesize(&self, session_id: &str, text: &str) -> Result<Vec<u8>, BackendError> {
        let path = format!(
            "/session/{session_id}/synthesize?text={}&format=wav",
            urls::url_encode(text)
        );
        let response = self.authorized(self.http.get(self.endpoint(&path))).send().await?;
        let response = Self::check(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn transcribe(&self, wav: &[u8]) -> Result<String, BackendError> {
        if let Some(cfg) = self.local_stt.clone() {
            return self.transcribe_local(&cfg, wav).await;
        }
        let response = self
            .authorized(self.http.post(self.endpoint("/transcribe")))
            .header("Content-Type", "audio/wav")
            .body(wav.to_vec())
            .send()
            .await?;
        let response = Self::check(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        Ok(extract_transcription(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcription_accepts_both_shapes() {
        assert_eq!(
            extract_transcription(&serde_json::json!("hello there")),
            "hello there"
        );
        assert_eq!(
            extract_transcription(&serde_json::json!({"text": "hi"})),
            "hi"
        );
        assert_eq!(extract_transcription(&serde_json::json!(42)), "");
        assert_eq!(extract_transcription(&serde_json::json!({"other": 1})), "");
    }

    #[test]
    fn base_url_is_normalized() {
        let client = BackendClient::new(
            "http://backend:8000/",
            None,
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(client.base_url(), "http://backend:8000");
        assert_eq!(client.endpoint("/capabilities"), "http://backend:8000/capabilities");
    }
}
