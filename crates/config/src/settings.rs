//! Main settings module.

use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::ConfigError;

/// Application settings.
///
/// Every field maps 1:1 to an environment variable with the same name in
/// upper case (`backend_url` <- `BACKEND_URL`). Defaults match the legacy
/// gateway so an existing deployment's environment keeps working unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // SIP identity and transport.
    pub sip_user: String,
    pub sip_login: String,
    pub sip_domain: String,
    pub sip_password: String,
    pub sip_caller_id: Option<String>,
    pub sip_null_device: bool,
    pub sip_port: u16,
    pub sip_max_calls: u32,
    pub sip_use_tcp: bool,
    pub sip_use_ice: bool,
    /// Comma-separated STUN server list.
    pub sip_stun_servers: String,
    /// Comma-separated outbound proxy list.
    pub sip_proxy_servers: String,
    /// JSON object mapping codec id to priority, e.g.
    /// `{"opus/48000": 254, "G722/16000": 253}`.
    pub codecs_priority: String,

    // Media stack knobs forwarded to the SIP adapter.
    pub ua_zero_thread_cnt: bool,
    pub ua_main_thread_only: bool,
    pub sip_media_thread_cnt: u32,
    pub ec_tail_len: u32,
    /// Disables the SIP stack's own VAD. Interacts with our detector:
    /// leave `false` in production so silence frames still reach it.
    pub ec_no_vad: bool,
    pub frame_time_usec: u32,
    pub events_delay: f64,
    pub async_delay: f64,

    // Audio storage.
    pub sip_audio_dir: String,
    pub sip_audio_tmp_dir: String,
    pub record_audio_parts: bool,

    // Voice-activity detection.
    pub vad_model_path: String,
    pub vad_model_url: String,
    pub vad_sampling_rate: u32,
    pub vad_threshold: f32,
    pub vad_min_speech_duration_ms: u32,
    pub vad_min_silence_duration_ms: u32,
    pub vad_speech_pad_ms: u32,
    pub vad_speech_prob_window: usize,
    pub vad_use_dynamic_corrections: bool,
    pub vad_correction_debug: bool,
    pub vad_correction_enter_threshold: f64,
    pub vad_correction_exit_threshold: f64,

    // Pause classification.
    pub short_pause_offset_ms: u32,
    pub long_pause_offset_ms: u32,
    pub user_silence_timeout_ms: u32,
    /// Utterances shorter than this never trigger speculation.
    pub min_speech_duration_sec: f64,

    // Backend.
    pub backend_url: String,
    pub authorization_token: Option<String>,
    pub backend_request_timeout: f64,
    pub backend_connect_timeout: f64,
    pub backend_sock_read_timeout: f64,
    pub session_type: String,
    /// Raw `IS_STREAMING` flag; see [`Settings::is_streaming`].
    pub is_streaming: bool,
    pub sip_early_eoc: bool,

    // Transcription.
    pub use_local_stt: bool,
    pub local_stt_url: String,
    pub local_stt_lang: String,

    // Playback and interruptions.
    pub greeting_delay_sec: f64,
    pub interruptions_are_allowed: bool,
    pub tts_max_inflight: usize,

    // Control REST.
    pub sip_rest_api_port: u16,

    // Logging.
    pub log_level: String,
    pub log_name: String,
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sip_user: "user".to_string(),
            sip_login: String::new(),
            sip_domain: "sip.linphone.org".to_string(),
            sip_password: "password".to_string(),
            sip_caller_id: None,
            sip_null_device: true,
            sip_port: 5060,
            sip_max_calls: 32,
            sip_use_tcp: true,
            sip_use_ice: false,
            sip_stun_servers: String::new(),
            sip_proxy_servers: String::new(),
            codecs_priority: String::new(),
            ua_zero_thread_cnt: true,
            ua_main_thread_only: true,
            sip_media_thread_cnt: 1,
            ec_tail_len: 200,
            ec_no_vad: false,
            frame_time_usec: 60_000,
            events_delay: 0.010,
            async_delay: 0.005,
            sip_audio_dir: "wav".to_string(),
            sip_audio_tmp_dir: "tmp".to_string(),
            record_audio_parts: false,
            vad_model_path: "silero_vad.onnx".to_string(),
            vad_model_url:
                "https://huggingface.co/onnx-community/silero-vad/resolve/main/onnx/model.onnx"
                    .to_string(),
            vad_sampling_rate: 16_000,
            vad_threshold: 0.65,
            vad_min_speech_duration_ms: 150,
            vad_min_silence_duration_ms: 300,
            vad_speech_pad_ms: 700,
            vad_speech_prob_window: 3,
            vad_use_dynamic_corrections: true,
            vad_correction_debug: false,
            vad_correction_enter_threshold: 0.6,
            vad_correction_exit_threshold: 0.4,
            short_pause_offset_ms: 200,
            long_pause_offset_ms: 850,
            user_silence_timeout_ms: 60_000,
            min_speech_duration_sec: 1.5,
            backend_url: String::new(),
            authorization_token: None,
            backend_request_timeout: 60.0,
            backend_connect_timeout: 60.0,
            backend_sock_read_timeout: 60.0,
            session_type: "inbound".to_string(),
            is_streaming: true,
            sip_early_eoc: false,
            use_local_stt: false,
            local_stt_url: String::new(),
            local_stt_lang: "en".to_string(),
            greeting_delay_sec: 0.0,
            interruptions_are_allowed: true,
            tts_max_inflight: 3,
            sip_rest_api_port: 8000,
            log_level: "info".to_string(),
            log_name: "voice_gateway".to_string(),
            log_json: false,
        }
    }
}

impl Settings {
    /// STUN servers as a list.
    pub fn stun_servers(&self) -> Vec<String> {
        split_csv(&self.sip_stun_servers)
    }

    /// Outbound proxies as a list.
    pub fn proxy_servers(&self) -> Vec<String> {
        split_csv(&self.sip_proxy_servers)
    }

    /// Codec priority map, falling back to the legacy defaults when unset.
    pub fn codec_priorities(&self) -> Result<BTreeMap<String, u8>, ConfigError> {
        if self.codecs_priority.trim().is_empty() {
            return Ok(BTreeMap::from([
                ("opus/48000".to_string(), 254),
                ("G722/16000".to_string(), 253),
            ]));
        }
        serde_json::from_str(&self.codecs_priority).map_err(|e| ConfigError::InvalidValue {
            field: "codecs_priority".to_string(),
            message: e.to_string(),
        })
    }

    /// Path of the VAD model on disk.
    pub fn vad_model_file(&self) -> PathBuf {
        PathBuf::from(&self.vad_model_path)
    }

    /// Whether backend replies stream over the WebSocket.
    ///
    /// Legacy computation kept as-is: streaming is only honored for session
    /// types other than `inbound`/`outbound`, gated by `IS_STREAMING`.
    pub fn streaming_replies(&self) -> bool {
        self.session_type != "inbound" && self.session_type != "outbound" && self.is_streaming
    }

    /// SIP account login, defaulting to the SIP user.
    pub fn effective_sip_login(&self) -> &str {
        if self.sip_login.is_empty() {
            &self.sip_user
        } else {
            &self.sip_login
        }
    }

    /// Validate settings. Called once at startup; failures are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_url.is_empty() {
            return Err(ConfigError::Missing("BACKEND_URL"));
        }
        if self.sip_user.is_empty() {
            return Err(ConfigError::Missing("SIP_USER"));
        }
        if self.sip_domain.is_empty() {
            return Err(ConfigError::Missing("SIP_DOMAIN"));
        }
        if self.sip_password.is_empty() {
            return Err(ConfigError::Missing("SIP_PASSWORD"));
        }
        if self.sip_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sip_port".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.sip_rest_api_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sip_rest_api_port".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.sip_max_calls == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sip_max_calls".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.tts_max_inflight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tts_max_inflight".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.vad_speech_prob_window == 0 {
            return Err(ConfigError::InvalidValue {
                field: "vad_speech_prob_window".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "vad_threshold".to_string(),
                message: format!("must be within [0, 1], got {}", self.vad_threshold),
            });
        }
        self.codec_priorities().map(|_| ())
    }
}

/// Load settings from `.env` (overriding the process environment, matching
/// the legacy gateway) and then from the environment itself.
pub fn load_settings() -> Result<Settings, ConfigError> {
    match dotenvy::dotenv_override() {
        Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "Failed to read .env"),
    }

    let source = Config::builder()
        .add_source(Environment::default().try_parsing(true))
        .build()?;
    let mut settings: Settings = source.try_deserialize()?;

    // Empty strings in optional slots mean "unset".
    if settings
        .authorization_token
        .as_deref()
        .is_some_and(str::is_empty)
    {
        settings.authorization_token = None;
    }
    if settings.sip_caller_id.as_deref().is_some_and(str::is_empty) {
        settings.sip_caller_id = None;
    }

    Ok(settings)
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_backend_url() {
        let settings = Settings {
            backend_url: "http://backend:8000".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn missing_backend_url_is_fatal() {
        let settings = Settings::default();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Missing("BACKEND_URL"))
        ));
    }

    #[test]
    fn csv_lists_are_trimmed() {
        let settings = Settings {
            sip_stun_servers: " stun1.example.com , stun2.example.com,".to_string(),
            ..Default::default()
        };
        assert_eq!(
            settings.stun_servers(),
            vec!["stun1.example.com", "stun2.example.com"]
        );
        assert!(settings.proxy_servers().is_empty());
    }

    #[test]
    fn codec_priorities_fall_back_to_defaults() {
        let settings = Settings::default();
        let codecs = settings.codec_priorities().unwrap();
        assert_eq!(codecs.get("opus/48000"), Some(&254));
        assert_eq!(codecs.get("G722/16000"), Some(&253));
    }

    #[test]
    fn codec_priorities_reject_non_object() {
        let settings = Settings {
            codecs_priority: "[1, 2]".to_string(),
            ..Default::default()
        };
        assert!(settings.codec_priorities().is_err());
    }

    #[test]
    fn streaming_only_outside_inbound_outbound() {
        let mut settings = Settings {
            is_streaming: true,
            ..Default::default()
        };
        assert!(!settings.streaming_replies());
        settings.session_type = "outbound".to_string();
        assert!(!settings.streaming_replies());
        settings.session_type = "widget".to_string();
        assert!(settings.streaming_replies());
        settings.is_streaming = false;
        assert!(!settings.streaming_replies());
    }

    #[test]
    fn sip_login_defaults_to_user() {
        let settings = Settings {
            sip_user: "alice".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.effective_sip_login(), "alice");
        let settings = Settings {
            sip_user: "alice".to_string(),
            sip_login: "alice-login".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.effective_sip_login(), "alice-login");
    }
}
