//! Centralized tuning constants.
//!
//! Values that are not expected to vary per deployment live here instead of
//! in [`crate::Settings`], so every crate reads the same numbers.

/// Voice-activity detection.
pub mod vad {
    /// Samples per analysis window. Silero operates on 512-sample chunks
    /// at 16 kHz (32 ms).
    pub const WINDOW_SIZE_SAMPLES: usize = 512;

    /// Flattened size of the model's recurrent state tensor (2 x 1 x 128).
    pub const STATE_LEN: usize = 2 * 128;

    /// Windows with a peak below this are renormalized before inference.
    pub const QUIET_PEAK: f32 = 0.01;

    /// Energy floor in dB for the energy-based detector used when the
    /// ONNX runtime is compiled out.
    pub const ENERGY_FLOOR_DB: f32 = -50.0;
}

/// Audio port between the SIP media stack and the application.
pub mod port {
    /// Capacity of the inbound frame queue. The realtime thread never
    /// blocks; the oldest frame is dropped on overflow.
    pub const MAX_QUEUE_SIZE: usize = 64;
}

/// Call control.
pub mod call {
    /// A synthesized WAV shorter than this is treated as empty. Guards
    /// against backends that return a bare header with no samples
    /// (44-byte header + ~10 ms of PCM16 at 16 kHz).
    pub const MIN_TTS_WAV_BYTES: usize = 364;

    /// How long the commit path waits for an in-flight speculative start
    /// before giving up on it.
    pub const COMMIT_START_WAIT_SECS: u64 = 2;

    /// Delay before a soft hangup re-checks playback state.
    pub const SOFT_HANGUP_PAUSE_SECS: f64 = 0.3;
}

/// Backend WebSocket.
pub mod ws {
    /// Fixed delay between reconnect attempts.
    pub const RECONNECT_DELAY_SECS: u64 = 5;
}
