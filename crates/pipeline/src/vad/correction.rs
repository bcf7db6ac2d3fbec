//! Dynamic correction of the per-frame speech decision.
//!
//! The raw model probability is blended with SNR, probability variance and
//! normalized energy into a score, and the binary decision comes from
//! hysteretic thresholds over the recent score mean. An "early" phase after
//! the AI stops speaking boosts sensitivity so quiet openings are not lost.

use std::collections::VecDeque;

/// Tuning for [`DynamicCorrection`].
#[derive(Debug, Clone)]
pub struct VadCorrectionConfig {
    pub score_window: usize,
    pub prob_window: usize,

    pub enter_thres: f64,
    pub exit_thres: f64,

    pub early_enter_thres: f64,
    pub early_phase_frames: u64,
    pub early_prob_boost: f64,

    pub w_prob: f64,
    pub w_snr: f64,
    pub w_var: f64,
    pub w_energy: f64,

    /// Probabilities above this count as foreground when computing variance.
    pub speech_prob_threshold: f64,
    pub min_speech_frames: usize,
    pub transition_threshold: f64,

    pub snr_clip: (f64, f64),
    pub var_clip: (f64, f64),

    pub noise_alpha: f64,
    pub peak_decay: f64,

    pub initial_noise_alpha: f64,
    pub initial_adapt_frames: usize,

    pub debug: bool,
}

impl Default for VadCorrectionConfig {
    fn default() -> Self {
        Self {
            score_window: 5,
            prob_window: 15,
            enter_thres: 0.40,
            exit_thres: 0.25,
            early_enter_thres: 0.30,
            early_phase_frames: 200,
            early_prob_boost: 0.20,
            w_prob: 0.60,
            w_snr: 0.15,
            w_var: 0.05,
            w_energy: 0.20,
            speech_prob_threshold: 0.3,
            min_speech_frames: 3,
            transition_threshold: 0.4,
            snr_clip: (0.0, 20.0),
            var_clip: (0.0, 0.05),
            noise_alpha: 0.02,
            peak_decay: 0.05,
            initial_noise_alpha: 0.15,
            initial_adapt_frames: 50,
            debug: false,
        }
    }
}

/// Per-call correction state.
pub struct DynamicCorrection {
    cfg: VadCorrectionConfig,
    score_buf: VecDeque<f64>,
    prob_buf: VecDeque<f64>,
    noise_energy: f64,
    peak_energy: f64,
    initial_energy_samples: Vec<f64>,
    state: bool,
    frame_index: u64,
    in_early_phase: bool,
    early_phase_start_frame: Option<u64>,
}

impl DynamicCorrection {
    pub fn new(cfg: VadCorrectionConfig) -> Self {
        Self {
            cfg,
            score_buf: VecDeque::new(),
            prob_buf: VecDeque::new(),
            noise_energy: 0.01,
            peak_energy: 0.1,
            initial_energy_samples: Vec::new(),
            state: false,
            frame_index: 0,
            in_early_phase: false,
            early_phase_start_frame: None,
        }
    }

    /// Enter the boosted early-detection phase. Called when the AI finishes
    /// speaking and the floor is open for the user.
    pub fn start_early_detection(&mut self) {
        if self.early_phase_start_frame.is_none() {
            self.in_early_phase = true;
            self.early_phase_start_frame = Some(self.frame_index);
        }
    }

    /// Feed one frame; returns the corrected speech/silence decision.
    pub fn process_frame(&mut self, speech_prob: f64, frame_energy: f64) -> bool {
        self.update_energy_profile(frame_energy, speech_prob);

        let adjusted_prob = self.apply_early_boost(speech_prob);
        let snr = frame_energy / (self.noise_energy + 1e-6);
        let snr_n = clip_norm(snr, self.cfg.snr_clip.0, self.cfg.snr_clip.1);

        self.prob_buf.push_back(adjusted_prob);
        if self.prob_buf.len() > self.cfg.prob_window {
            self.prob_buf.pop_front();
        }

        let (_, fg_var) = self.foreground_variance();
        let fg_var_n = clip_norm(fg_var, self.cfg.var_clip.0, self.cfg.var_clip.1);

        let eng_n = if self.peak_energy > self.noise_energy {
            ((frame_energy - self.noise_energy) / (self.peak_energy - self.noise_energy + 1e-6))
                .clamp(0.0, 1.0)
        } else if frame_energy > self.noise_energy {
            0.5
        } else {
            0.0
        };

        let weight_sum = self.cfg.w_prob + self.cfg.w_snr + self.cfg.w_var + self.cfg.w_energy;
        let mut score = self.cfg.w_prob * adjusted_prob
            + self.cfg.w_snr * snr_n
            + self.cfg.w_var * fg_var_n
            + self.cfg.w_energy * eng_n;
        score /= if weight_sum > 0.0 { weight_sum } else { 1.0 };

        self.score_buf.push_back(score);
        if self.score_buf.len() > self.cfg.score_window {
            self.score_buf.pop_front();
        }

        let mean_score = mean(self.score_buf.iter());
        let enter_thres = if self.in_early_phase {
            self.cfg.early_enter_thres
        } else {
            self.cfg.enter_thres
        };
        if !self.state && mean_score >= enter_thres {
            self.state = true;
        } else if self.state && mean_score <= self.cfg.exit_thres {
            self.state = false;
        }

        if self.in_early_phase {
            if self.state {
                self.in_early_phase = false;
            } else if let Some(start) = self.early_phase_start_frame {
                if self.frame_index >= start + self.cfg.early_phase_frames {
                    self.in_early_phase = false;
                }
            }
        }

        if self.cfg.debug {
            tracing::debug!(
                frame = self.frame_index,
                prob = speech_prob,
                score = mean_score,
                state = if self.state { "SPEECH" } else { "SILENCE" },
                "VAD correction frame"
            );
        }

        self.frame_index += 1;
        self.state
    }

    fn update_energy_profile(&mut self, energy: f64, speech_prob: f64) {
        if self.initial_energy_samples.len() < self.cfg.initial_adapt_frames {
            self.initial_energy_samples.push(energy);
            if self.initial_energy_samples.len() == self.cfg.initial_adapt_frames {
                let mut sorted = self.initial_energy_samples.clone();
                sorted.sort_by(|a, b| a.total_cmp(b));
                self.noise_energy = sorted[sorted.len() / 10];
            }
        }

        let alpha = if (self.frame_index as usize) < self.cfg.initial_adapt_frames {
            self.cfg.initial_noise_alpha
        } else {
            self.cfg.noise_alpha
        };
        if !self.state && speech_prob < 0.3 {
            self.noise_energy = (1.0 - alpha) * self.noise_energy + alpha * energy;
        }

        if energy > self.peak_energy {
            self.peak_energy = energy;
        } else {
            self.peak_energy = (1.0 - self.cfg.peak_decay) * self.peak_energy
                + self.cfg.peak_decay * self.noise_energy;
        }
        self.peak_energy = self.peak_energy.max(self.noise_energy + 1e-6);
    }

    /// `(raw, foreground)` probability variance over the recent window.
    /// During detected transitions only the last few speech-likely frames
    /// count, so a decaying tail does not inflate the variance.
    fn foreground_variance(&self) -> (f64, f64) {
        if self.prob_buf.len() < 2 {
            return (0.0, 0.0);
        }
        let raw_var = population_variance(self.prob_buf.iter());
        if !self.state {
            return (raw_var, 0.0);
        }

        let speech_probs: Vec<f64> = self
            .prob_buf
            .iter()
            .copied()
            .filter(|&p| p > self.cfg.speech_prob_threshold)
            .collect();
        if speech_probs.len() < self.cfg.min_speech_frames {
            return (raw_var, 0.0);
        }

        let mut foreground = population_variance(speech_probs.iter());
        if self.is_transition_period() {
            let recent: Vec<f64> = self
                .prob_buf
                .iter()
                .rev()
                .copied()
                .filter(|&p| p > self.cfg.speech_prob_threshold)
                .take(6)
                .collect();
            foreground = if recent.len() >= 3 {
                population_variance(recent.iter())
            } else {
                0.0
            };
        }
        (raw_var, foreground)
    }

    fn is_transition_period(&self) -> bool {
        if self.prob_buf.len() < 4 {
            return false;
        }
        let tail: Vec<f64> = self.prob_buf.iter().rev().take(4).copied().collect();
        let min = tail.iter().copied().fold(f64::INFINITY, f64::min);
        let max = tail.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (max - min) > self.cfg.transition_threshold
    }

    fn apply_early_boost(&self, speech_prob: f64) -> f64 {
        if self.in_early_phase {
            (speech_prob + self.cfg.early_prob_boost).min(1.0)
        } else {
            speech_prob
        }
    }
}

fn clip_norm(value: f64, low: f64, high: f64) -> f64 {
    if high <= low {
        return 0.0;
    }
    (value.clamp(low, high) - low) / (high - low)
}

fn mean<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn population_variance<'a>(values: impl Iterator<Item = &'a f64> + Clone) -> f64 {
    let m = mean(values.clone());
    let mut acc = 0.0;
    let mut count = 0usize;
    for v in values {
        let diff = v - m;
        acc += diff * diff;
        count += 1;
    }
    if count < 2 {
        0.0
    } else {
        acc / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_norm_bounds() {
        assert_eq!(clip_norm(-1.0, 0.0, 20.0), 0.0);
        assert_eq!(clip_norm(30.0, 0.0, 20.0), 1.0);
        assert_eq!(clip_norm(10.0, 0.0, 20.0), 0.5);
        assert_eq!(clip_norm(1.0, 5.0, 5.0), 0.0);
    }

    #[test]
    fn silence_keeps_state_false() {
        let mut dc = DynamicCorrection::new(VadCorrectionConfig::default());
        for _ in 0..100 {
            assert!(!dc.process_frame(0.01, 0.001));
        }
    }

    #[test]
    fn loud_confident_frames_enter_and_exit() {
        let mut dc = DynamicCorrection::new(VadCorrectionConfig::default());
        // Establish the noise floor.
        for _ in 0..60 {
            dc.process_frame(0.02, 0.001);
        }
        // Strong speech enters.
        let mut entered = false;
        for _ in 0..10 {
            entered = dc.process_frame(0.95, 0.2);
        }
        assert!(entered);
        // Sustained silence exits again.
        let mut state = true;
        for _ in 0..30 {
            state = dc.process_frame(0.02, 0.001);
        }
        assert!(!state);
    }

    #[test]
    fn early_phase_lowers_the_bar() {
        let cfg = VadCorrectionConfig::default();
        let mut boosted = DynamicCorrection::new(cfg.clone());
        let mut plain = DynamicCorrection::new(cfg);
        boosted.start_early_detection();

        // Borderline frames that clear only the early threshold.
        let mut boosted_state = false;
        let mut plain_state = false;
        for _ in 0..5 {
            boosted_state = boosted.process_frame(0.35, 0.05);
            plain_state = plain.process_frame(0.35, 0.05);
        }
        assert!(boosted_state);
        assert!(!plain_state);
    }

    #[test]
    fn early_phase_expires() {
        let mut dc = DynamicCorrection::new(VadCorrectionConfig {
            early_phase_frames: 3,
            ..Default::default()
        });
        dc.start_early_detection();
        for _ in 0..5 {
            dc.process_frame(0.01, 0.001);
        }
        assert!(!dc.in_early_phase);
    }
}
