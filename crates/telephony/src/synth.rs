//! Synthesis of reply text through the backend session voice.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use voice_gateway_backend::GenerationBackend;
use voice_gateway_config::call::MIN_TTS_WAV_BYTES;
use voice_gateway_core::metrics;
use voice_gateway_pipeline::tts::SpeechSynthesizer;
use voice_gateway_pipeline::PipelineError;

/// [`SpeechSynthesizer`] that fetches WAV audio from the backend's
/// per-session synthesize endpoint and stages it in the temp audio dir.
pub struct BackendSynthesizer {
    backend: Arc<dyn GenerationBackend>,
    session_id: String,
    tmp_dir: PathBuf,
}

impl BackendSynthesizer {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        session_id: impl Into<String>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            session_id: session_id.into(),
            tmp_dir: tmp_dir.into(),
        }
    }

    fn make_path(&self) -> PathBuf {
        self.tmp_dir.join(format!("tts-{}.wav", uuid::Uuid::now_v7()))
    }
}

#[async_trait]
impl SpeechSynthesizer for BackendSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        canceled: &AtomicBool,
    ) -> Result<Option<PathBuf>, PipelineError> {
        if canceled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let started = Instant::now();
        let blob = self
            .backend
            .synthesize(&self.session_id, text)
            .await
            .map_err(|e| PipelineError::Tts(e.to_string()))?;
        metrics::observe_response_time("synthesize", started.elapsed().as_secs_f64());

        if canceled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if blob.len() < MIN_TTS_WAV_BYTES {
            tracing::info!(
                session_id = %self.session_id,
                blob_len = blob.len(),
                "Synthesized audio too short, skipping"
            );
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.tmp_dir).await?;
        let path = self.make_path();
        tokio::fs::write(&path, &blob).await?;
        tracing::debug!(
            session_id = %self.session_id,
            path = %path.display(),
            blob_len = blob.len(),
            "Synthesized reply staged"
        );
        Ok(Some(path))
    }
}
