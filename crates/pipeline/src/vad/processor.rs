//! Streaming VAD processor.
//!
//! Accumulates PCM16 audio, runs the estimator on 512-sample windows and
//! classifies the stream into semantic events: speech-start, speech-end,
//! short-pause, long-pause and user-silence-timeout. Pause thresholds are
//! expressed in samples so all comparisons are exact regardless of frame
//! cadence.

use std::sync::Arc;

use voice_gateway_config::vad::WINDOW_SIZE_SAMPLES;
use voice_gateway_config::Settings;
use voice_gateway_core::audio;

use super::correction::{DynamicCorrection, VadCorrectionConfig};
use super::model::SpeechEstimator;

/// Semantic events produced by the processor, in sample order.
///
/// `start`/`duration` are seconds relative to the beginning of the call.
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// First confirmed speech frame after silence. Carries the faded-in
    /// padding taken from the preceding silence.
    SpeechStart {
        audio: Vec<f32>,
        start: f64,
        duration: f64,
    },
    /// Speech stopped long enough to count as silence.
    SpeechEnd {
        audio: Vec<f32>,
        start: f64,
        duration: f64,
    },
    /// Pause long enough to speculate on. Carries the padded utterance.
    ShortPause {
        audio: Vec<f32>,
        start: f64,
        duration: f64,
    },
    /// Pause long enough to commit on. Carries the padded utterance.
    LongPause {
        audio: Vec<f32>,
        start: f64,
        duration: f64,
    },
    /// The caller has been silent past the configured hard limit.
    UserSilenceTimeout { at: f64 },
}

/// Processor tuning, derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct VadProcessorConfig {
    pub threshold: f32,
    pub min_speech_duration_ms: u32,
    pub min_silence_duration_ms: u32,
    pub speech_pad_ms: u32,
    pub short_pause_offset_ms: u32,
    pub long_pause_offset_ms: u32,
    pub user_silence_timeout_ms: u32,
    pub speech_prob_window: usize,
    pub use_dynamic_correction: bool,
    pub correction: VadCorrectionConfig,
}

impl Default for VadProcessorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.65,
            min_speech_duration_ms: 150,
            min_silence_duration_ms: 300,
            speech_pad_ms: 700,
            short_pause_offset_ms: 200,
            long_pause_offset_ms: 850,
            user_silence_timeout_ms: 60_000,
            speech_prob_window: 3,
            use_dynamic_correction: true,
            correction: VadCorrectionConfig::default(),
        }
    }
}

impl VadProcessorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            threshold: settings.vad_threshold,
            min_speech_duration_ms: settings.vad_min_speech_duration_ms,
            min_silence_duration_ms: settings.vad_min_silence_duration_ms,
            speech_pad_ms: settings.vad_speech_pad_ms,
            short_pause_offset_ms: settings.short_pause_offset_ms,
            long_pause_offset_ms: settings.long_pause_offset_ms,
            user_silence_timeout_ms: settings.user_silence_timeout_ms,
            speech_prob_window: settings.vad_speech_prob_window.max(1),
            use_dynamic_correction: settings.vad_use_dynamic_corrections,
            correction: VadCorrectionConfig {
                enter_thres: settings.vad_correction_enter_threshold,
                exit_thres: settings.vad_correction_exit_threshold,
                debug: settings.vad_correction_debug,
                ..Default::default()
            },
        }
    }
}

/// Streaming VAD over a shared estimator with per-call state.
pub struct StreamingVadProcessor {
    model: Arc<dyn SpeechEstimator>,
    threshold: f32,
    sampling_rate: u32,
    speech_prob_window: usize,

    min_speech_samples: usize,
    min_silence_samples: usize,
    speech_pad_samples: usize,
    short_pause_samples: usize,
    long_pause_samples: usize,
    user_silence_samples: u64,
    max_silence_samples: usize,

    buffer: Vec<f32>,
    speech_buffer: Vec<f32>,
    silence_buffer: Vec<f32>,
    silence_pad_buffer: Vec<f32>,
    prob_history: Vec<f32>,
    model_state: Vec<f32>,

    current_sample: u64,
    active_speech: bool,
    active_long_speech: bool,
    short_pause_fired: bool,
    long_pause_suspended: bool,
    speech_start_sample: u64,
    user_silence_start: u64,
    user_silence_timeout_fired: bool,
    empty_transcriptions: u64,

    correction: Option<DynamicCorrection>,
}

impl StreamingVadProcessor {
    pub fn new(model: Arc<dyn SpeechEstimator>, config: VadProcessorConfig) -> Self {
        let rate = model.sampling_rate();
        let per_ms = |ms: u32| (rate * ms / 1000) as usize;

        let min_silence_samples = per_ms(config.min_silence_duration_ms);
        let short_pause_samples = min_silence_samples + per_ms(config.short_pause_offset_ms);
        let long_pause_samples = short_pause_samples + per_ms(config.long_pause_offset_ms);
        let max_silence_ms = (config.speech_pad_ms * 2).max(config.min_silence_duration_ms);
        let model_state = model.initialize_state();

        Self {
            threshold: config.threshold,
            sampling_rate: rate,
            speech_prob_window: config.speech_prob_window.max(1),
            min_speech_samples: per_ms(config.min_speech_duration_ms),
            min_silence_samples,
            speech_pad_samples: per_ms(config.speech_pad_ms),
            short_pause_samples,
            long_pause_samples,
            user_silence_samples: u64::from(rate * config.user_silence_timeout_ms / 1000),
            max_silence_samples: per_ms(max_silence_ms),
            buffer: Vec::new(),
            speech_buffer: Vec::new(),
            silence_buffer: Vec::new(),
            silence_pad_buffer: Vec::new(),
            prob_history: Vec::new(),
            model_state,
            current_sample: 0,
            active_speech: false,
            active_long_speech: false,
            short_pause_fired: false,
            long_pause_suspended: false,
            speech_start_sample: 0,
            user_silence_start: 0,
            user_silence_timeout_fired: false,
            empty_transcriptions: 0,
            correction: if config.use_dynamic_correction {
                Some(DynamicCorrection::new(config.correction))
            } else {
                None
            },
            model,
        }
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    /// Feed PCM16 audio; returns the events fired by complete windows.
    pub fn process_samples(&mut self, samples: &[i16]) -> Vec<VadEvent> {
        let mut events = Vec::new();
        if samples.is_empty() {
            return events;
        }
        self.buffer.extend(audio::pcm16_to_f32(samples));
        while self.buffer.len() >= WINDOW_SIZE_SAMPLES {
            let window: Vec<f32> = self.buffer.drain(..WINDOW_SIZE_SAMPLES).collect();
            self.process_window(&window, &mut events);
        }
        events
    }

    /// Flush at teardown: an utterance still in the speech buffer is emitted
    /// as a final long pause.
    pub fn finalize(&mut self) -> Vec<VadEvent> {
        let mut events = Vec::new();
        if self.speech_buffer.len() >= self.min_speech_samples {
            self.fire_long_pause(&mut events);
        }
        events
    }

    /// (Re)start the user-silence timer from now. Also arms the corrector's
    /// early-detection phase: the floor just opened for the user.
    pub fn start_user_silence(&mut self) {
        self.user_silence_start = self.current_sample;
        self.user_silence_timeout_fired = false;
        if let Some(dc) = self.correction.as_mut() {
            dc.start_early_detection();
        }
        tracing::debug!(time_sec = self.current_time_sec(), "User silence period started");
    }

    /// Disable the user-silence timeout until the next speech-end.
    pub fn reset_user_silence(&mut self) {
        self.user_silence_start = 0;
        self.user_silence_timeout_fired = true;
    }

    /// Cancel the running user-silence timer (the user spoke).
    pub fn cancel_user_silence(&mut self) {
        self.user_silence_start = 0;
        tracing::debug!(time_sec = self.current_time_sec(), "User silence timeout cancelled");
    }

    /// Suspend long-pause while a commit is running, so the classifier does
    /// not fire a second commit for the same gap.
    pub fn set_long_pause_suspended(&mut self, suspended: bool) {
        self.long_pause_suspended = suspended;
    }

    /// Transcription of an emitted buffer came back empty.
    pub fn track_empty_transcription(&mut self) {
        self.empty_transcriptions += 1;
        tracing::debug!(total = self.empty_transcriptions, "Empty transcription tracked");
    }

    pub fn current_time_sec(&self) -> f64 {
        self.current_sample as f64 / f64::from(self.sampling_rate)
    }

    fn smoothed_prob(&mut self, window: &[f32]) -> f32 {
        let prob = self
            .model
            .speech_probability(window, &mut self.model_state);
        self.prob_history.push(prob);
        if self.prob_history.len() > self.speech_prob_window {
            self.prob_history.remove(0);
        }
        if self.prob_history.len() <= 1 {
            return prob;
        }
        let mut weighted_sum = 0.0f32;
        let mut weight_total = 0.0f32;
        for (i, &p) in self.prob_history.iter().enumerate() {
            let weight = (i + 1) as f32;
            weighted_sum += p * weight;
            weight_total += weight;
        }
        weighted_sum / weight_total
    }

    fn process_window(&mut self, window: &[f32], events: &mut Vec<VadEvent>) {
        let speech_prob = self.smoothed_prob(window);
        let is_speech_frame = match self.correction.as_mut() {
            Some(dc) => {
                let energy = f64::from(audio::frame_energy(window));
                dc.process_frame(f64::from(speech_prob), energy)
            }
            None => speech_prob > self.threshold,
        };

        self.current_sample += window.len() as u64;

        if self.active_long_speech {
            self.speech_buffer.extend_from_slice(window);
            if is_speech_frame {
                self.silence_buffer.clear();
            } else {
                self.grow_silence_buffer(window);
            }
        } else if is_speech_frame {
            self.speech_buffer.extend_from_slice(window);
        } else {
            if !self.speech_buffer.is_empty() {
                let stale = std::mem::take(&mut self.speech_buffer);
                self.grow_silence_buffer(&stale);
            }
            self.grow_silence_buffer(window);
        }

        if is_speech_frame {
            if !self.active_speech {
                self.speech_start_sample = self.current_sample - window.len() as u64;
                if self.speech_buffer.len() >= self.min_speech_samples {
                    self.fire_speech_start(events);
                }
            }
        } else {
            if self.active_speech {
                if self.silence_buffer.len() >= self.min_silence_samples {
                    self.fire_speech_end(events);
                }
            } else if !self.user_silence_timeout_fired
                && self.current_sample.saturating_sub(self.user_silence_start)
                    > self.user_silence_samples
            {
                self.fire_user_silence_timeout(events);
            }
            if self.active_long_speech {
                if !self.short_pause_fired && self.silence_buffer.len() >= self.short_pause_samples
                {
                    self.fire_short_pause(events);
                }
                if !self.long_pause_suspended
                    && self.silence_buffer.len() >= self.long_pause_samples
                {
                    self.fire_long_pause(events);
                }
            }
        }
    }

    fn grow_silence_buffer(&mut self, window: &[f32]) {
        self.silence_buffer.extend_from_slice(window);
        if self.silence_buffer.len() > self.max_silence_samples {
            let overflow = self.silence_buffer.len() - self.max_silence_samples;
            self.silence_buffer.drain(..overflow);
        }
    }

    fn fire_speech_start(&mut self, events: &mut Vec<VadEvent>) {
        self.active_speech = true;
        if !self.active_long_speech {
            self.active_long_speech = true;
            let padding = self.speech_pad_samples.min(self.silence_buffer.len());
            let tail = self.silence_buffer[self.silence_buffer.len() - padding..].to_vec();
            self.silence_pad_buffer = apply_fade(&tail, true);
        }
        self.silence_buffer.clear();
        let (start, duration) = self.times_sec(self.silence_pad_buffer.len());
        events.push(VadEvent::SpeechStart {
            audio: self.silence_pad_buffer.clone(),
            start,
            duration,
        });
    }

    fn fire_speech_end(&mut self, events: &mut Vec<VadEvent>) {
        self.active_speech = false;
        if !self.active_long_speech {
            self.speech_buffer.clear();
        }
        self.short_pause_fired = false;
        self.user_silence_start = self
            .current_sample
            .saturating_sub(self.silence_buffer.len() as u64);
        self.user_silence_timeout_fired = false;

        let len = self.speech_buffer.len() as i64;
        let start_offset = self.speech_start_sample as i64 - self.current_sample as i64;
        let start_index = (len + start_offset).max(0) as usize;
        let end_index = (len - self.silence_buffer.len() as i64).max(0) as usize;
        let buffer = if end_index > start_index {
            self.speech_buffer[start_index..end_index].to_vec()
        } else {
            Vec::new()
        };
        let (start, duration) = self.times_sec(buffer.len());
        events.push(VadEvent::SpeechEnd {
            audio: buffer,
            start,
            duration,
        });
    }

    fn fire_short_pause(&mut self, events: &mut Vec<VadEvent>) {
        let buffer = self.padded_utterance();
        let (start, duration) = self.times_sec(buffer.len());
        events.push(VadEvent::ShortPause {
            audio: buffer,
            start,
            duration,
        });
        self.short_pause_fired = true;
    }

    fn fire_long_pause(&mut self, events: &mut Vec<VadEvent>) {
        let buffer = self.padded_utterance();
        let (start, duration) = self.times_sec(buffer.len());
        events.push(VadEvent::LongPause {
            audio: buffer,
            start,
            duration,
        });
        self.short_pause_fired = false;
        self.active_long_speech = false;
        self.speech_buffer.clear();
    }

    fn fire_user_silence_timeout(&mut self, events: &mut Vec<VadEvent>) {
        events.push(VadEvent::UserSilenceTimeout {
            at: self.current_time_sec(),
        });
        self.user_silence_timeout_fired = true;
    }

    /// Faded-in padding + speech minus the trailing silence + faded-out
    /// silence.
    fn padded_utterance(&self) -> Vec<f32> {
        let silence_len = self.silence_buffer.len();
        let mut buffer = self.silence_pad_buffer.clone();
        if self.speech_buffer.len() > silence_len {
            buffer.extend_from_slice(&self.speech_buffer[..self.speech_buffer.len() - silence_len]);
        }
        buffer.extend(apply_fade(&self.silence_buffer, false));
        buffer
    }

    fn times_sec(&self, audio_len: usize) -> (f64, f64) {
        let rate = f64::from(self.sampling_rate);
        let start = self.current_sample.saturating_sub(audio_len as u64) as f64 / rate;
        (start, audio_len as f64 / rate)
    }
}

/// Raised-sine fade. `curve(i) = sin(pi/2 * i / (N-1))` for fade-in,
/// mirrored for fade-out. Buffers of length <= 1 pass through unchanged.
fn apply_fade(audio: &[f32], fade_in: bool) -> Vec<f32> {
    if audio.len() <= 1 {
        return audio.to_vec();
    }
    let last = (audio.len() - 1) as f32;
    audio
        .iter()
        .enumerate()
        .map(|(i, &sample)| {
            let ratio = i as f32 / last;
            let mut curve = (ratio * std::f32::consts::FRAC_PI_2).sin();
            if !fade_in {
                curve = 1.0 - curve;
            }
            sample * curve
        })
        .collect()
}
