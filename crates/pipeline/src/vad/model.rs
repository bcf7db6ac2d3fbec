//! Silero VAD model wrapper.
//!
//! Runs the ONNX speech-probability estimator on fixed 512-sample windows.
//! The recurrent state is opaque to callers: they hold a flat `Vec<f32>`,
//! pass it in, and receive the updated state out, which lets a single model
//! instance serve many calls concurrently.

use std::path::{Path, PathBuf};

use voice_gateway_config::vad::{STATE_LEN, WINDOW_SIZE_SAMPLES};
use voice_gateway_core::urls;

#[cfg(any(feature = "onnx", test))]
use voice_gateway_config::vad::QUIET_PEAK;
#[cfg(not(feature = "onnx"))]
use voice_gateway_config::vad::ENERGY_FLOOR_DB;
#[cfg(not(feature = "onnx"))]
use voice_gateway_core::audio;

use crate::PipelineError;

#[cfg(feature = "onnx")]
use ndarray::{Array1, Array2, Array3};
#[cfg(feature = "onnx")]
use ort::{session::builder::GraphOptimizationLevel, session::Session, value::Tensor};
#[cfg(feature = "onnx")]
use parking_lot::Mutex;

/// Speech-probability estimator over a fixed-size window.
///
/// The processor is written against this trait so tests can drive it with
/// scripted probabilities.
pub trait SpeechEstimator: Send + Sync {
    fn sampling_rate(&self) -> u32;

    /// Fresh per-call recurrent state.
    fn initialize_state(&self) -> Vec<f32>;

    /// Probability in `[0, 1]` that `window` contains speech. `window` must
    /// be exactly 512 float32 samples in `[-1, 1]`. On inference failure the
    /// state is left untouched and 0.0 is returned; callers treat that as
    /// continuous silence.
    fn speech_probability(&self, window: &[f32], state: &mut Vec<f32>) -> f32;
}

/// Silero VAD v5 over ONNX Runtime.
pub struct VadModel {
    #[cfg(feature = "onnx")]
    session: Mutex<Session>,
    sampling_rate: u32,
}

impl VadModel {
    #[cfg(feature = "onnx")]
    pub fn new(model_path: impl AsRef<Path>, sampling_rate: u32) -> Result<Self, PipelineError> {
        let session = Session::builder()
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        Ok(Self {
            session: Mutex::new(session),
            sampling_rate,
        })
    }

    #[cfg(not(feature = "onnx"))]
    pub fn new(_model_path: impl AsRef<Path>, sampling_rate: u32) -> Result<Self, PipelineError> {
        tracing::warn!("ONNX support compiled out; using energy-based speech detection");
        Ok(Self { sampling_rate })
    }

    /// Renormalize very quiet or clipping windows before inference.
    #[cfg(any(feature = "onnx", test))]
    fn normalized(window: &[f32]) -> Vec<f32> {
        let peak = window.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        if peak > 0.0 && (peak > 1.0 || peak < QUIET_PEAK) {
            window.iter().map(|&v| v / peak).collect()
        } else {
            window.to_vec()
        }
    }

    #[cfg(feature = "onnx")]
    fn run_inference(&self, window: &[f32], state: &mut Vec<f32>) -> Result<f32, PipelineError> {
        let input = Array2::from_shape_vec((1, window.len()), window.to_vec())
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let sr = Array1::from_vec(vec![i64::from(self.sampling_rate)]);
        if state.len() != STATE_LEN {
            *state = vec![0.0; STATE_LEN];
        }
        let state_in = Array3::from_shape_vec((2, 1, 128), state.clone())
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let input_tensor =
            Tensor::from_array(input).map_err(|e| PipelineError::Model(e.to_string()))?;
        let sr_tensor = Tensor::from_array(sr).map_err(|e| PipelineError::Model(e.to_string()))?;
        let state_tensor =
            Tensor::from_array(state_in).map_err(|e| PipelineError::Model(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![
                "input" => input_tensor,
                "sr" => sr_tensor,
                "state" => state_tensor,
            ])
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let (_, prob_data) = outputs
            .get("output")
            .ok_or_else(|| PipelineError::Model("missing output tensor".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        if let Some(state_out) = outputs.get("stateN") {
            let (_, data) = state_out
                .try_extract_tensor::<f32>()
                .map_err(|e| PipelineError::Model(e.to_string()))?;
            if data.len() == STATE_LEN {
                state.clear();
                state.extend_from_slice(data);
            }
        }

        Ok(prob)
    }
}

impl SpeechEstimator for VadModel {
    fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    fn initialize_state(&self) -> Vec<f32> {
        vec![0.0; STATE_LEN]
    }

    #[cfg(feature = "onnx")]
    fn speech_probability(&self, window: &[f32], state: &mut Vec<f32>) -> f32 {
        if window.len() != WINDOW_SIZE_SAMPLES {
            tracing::warn!(len = window.len(), "VAD window has unexpected length");
        }
        let normalized = Self::normalized(window);
        let mut scratch = state.clone();
        match self.run_inference(&normalized, &mut scratch) {
            Ok(prob) => {
                *state = scratch;
                prob
            }
            Err(e) => {
                tracing::error!(error = %e, "VAD inference failed");
                0.0
            }
        }
    }

    /// Energy-based fallback when the ONNX runtime is compiled out. Far
    /// cruder than the model but keeps the call flow functional.
    #[cfg(not(feature = "onnx"))]
    fn speech_probability(&self, window: &[f32], _state: &mut Vec<f32>) -> f32 {
        if window.len() != WINDOW_SIZE_SAMPLES {
            tracing::warn!(len = window.len(), "VAD window has unexpected length");
        }
        let rms = audio::frame_energy(window);
        let energy_db = 20.0 * rms.max(1e-10).log10();
        let threshold_db = ENERGY_FLOOR_DB + 10.0;
        if energy_db > threshold_db {
            ((energy_db - threshold_db) / 30.0).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Make sure the model file exists, downloading it when missing.
///
/// Redirects are followed manually (at most 5 hops) so the gateway can log
/// each hop; an empty file after download is rejected.
pub async fn ensure_model_file(path: &Path, url: &str) -> Result<PathBuf, PipelineError> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if url.is_empty() {
        return Err(PipelineError::Model(format!(
            "VAD model missing at {} and no download URL configured",
            path.display()
        )));
    }

    tracing::info!(path = %path.display(), url, "VAD model file missing, downloading");
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| PipelineError::Model(e.to_string()))?;

    let mut current_url = url.to_string();
    for _ in 0..5 {
        let response = client
            .get(&current_url)
            .header("User-Agent", "voice-gateway/1.0")
            .send()
            .await
            .map_err(|e| PipelineError::Model(format!("model download failed: {e}")))?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get("Location")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    PipelineError::Model(format!("redirect from {current_url} without location"))
                })?;
            let next = urls::resolve_redirect(&current_url, location)
                .map_err(|e| PipelineError::Model(e.to_string()))?;
            tracing::info!(from = %current_url, to = %next, "Model download redirect");
            current_url = next;
            continue;
        }
        if !status.is_success() {
            return Err(PipelineError::Model(format!(
                "model download failed with status {status} from {current_url}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        if body.is_empty() {
            return Err(PipelineError::Model("downloaded model file is empty".to_string()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &body).await?;
        tracing::info!(path = %path.display(), bytes = body.len(), "VAD model downloaded");
        return Ok(path.to_path_buf());
    }

    Err(PipelineError::Model(format!(
        "model download failed: too many redirects from {url}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_windows_are_renormalized() {
        let window = vec![0.001f32; WINDOW_SIZE_SAMPLES];
        let normalized = VadModel::normalized(&window);
        assert!((normalized[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nominal_windows_pass_through() {
        let window = vec![0.5f32; WINDOW_SIZE_SAMPLES];
        let normalized = VadModel::normalized(&window);
        assert_eq!(normalized, window);
    }

    #[test]
    fn silence_is_not_scaled() {
        let window = vec![0.0f32; WINDOW_SIZE_SAMPLES];
        assert_eq!(VadModel::normalized(&window), window);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn energy_fallback_separates_speech_from_silence() {
        let model = VadModel::new("unused.onnx", 16_000).unwrap();
        let mut state = model.initialize_state();

        let silence = vec![0.0f32; WINDOW_SIZE_SAMPLES];
        assert_eq!(model.speech_probability(&silence, &mut state), 0.0);

        let speech: Vec<f32> = (0..WINDOW_SIZE_SAMPLES)
            .map(|i| (i as f32 * 0.1).sin() * 0.5)
            .collect();
        assert!(model.speech_probability(&speech, &mut state) > 0.5);
    }
}
