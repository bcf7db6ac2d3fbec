//! Voice activity detection.
//!
//! [`VadModel`] wraps the Silero ONNX estimator; [`StreamingVadProcessor`]
//! turns a continuous PCM stream into semantic events; [`DynamicCorrection`]
//! optionally refines the per-frame speech decision with SNR and energy
//! statistics.

mod correction;
mod model;
mod processor;

pub use correction::{DynamicCorrection, VadCorrectionConfig};
pub use model::{ensure_model_file, SpeechEstimator, VadModel};
pub use processor::{StreamingVadProcessor, VadEvent, VadProcessorConfig};
