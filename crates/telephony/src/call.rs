//! Per-call conversational state machine.
//!
//! The controller binds the audio port, VAD processor, TTS pipeline and
//! player to one backend session and mediates speculation, commit,
//! rollback, interruption and hangup. All cross-thread generation state
//! lives behind one per-call mutex; every transition that depends on a
//! fallible step is applied only after that step succeeds, so a failed
//! request leaves the machine consistent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use voice_gateway_backend::{BackendWsClient, GenerationBackend, WsEvent};
use voice_gateway_config::call::{COMMIT_START_WAIT_SECS, SOFT_HANGUP_PAUSE_SECS};
use voice_gateway_config::Settings;
use voice_gateway_core::{metrics, text, wav};
use voice_gateway_pipeline::player::SmartPlayer;
use voice_gateway_pipeline::port::AudioMediaPort;
use voice_gateway_pipeline::tts::TtsPipeline;
use voice_gateway_pipeline::vad::{
    SpeechEstimator, StreamingVadProcessor, VadEvent, VadProcessorConfig,
};

use crate::sip::{CallActions, TransferStatus};
use crate::status::close_status_for;
use crate::synth::BackendSynthesizer;

/// Conversational FSM states.
///
/// Transitions only move forward, except the two rollback edges
/// (`SpeculativeGenerate -> WaitForUser` and `CommitGenerate ->
/// WaitForUser`). `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    WaitForUser,
    SpeculativeGenerate,
    CommitGenerate,
    Finished,
}

/// Per-call configuration derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub streaming_replies: bool,
    pub sip_early_eoc: bool,
    pub interruptions_are_allowed: bool,
    pub greeting_delay_sec: f64,
    /// Utterances shorter than this never trigger speculation.
    pub min_speech_duration_sec: f64,
    pub tmp_audio_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub record_audio_parts: bool,
    pub sampling_rate: u32,
    pub tts_max_inflight: usize,
}

impl CallConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            streaming_replies: settings.streaming_replies(),
            sip_early_eoc: settings.sip_early_eoc,
            interruptions_are_allowed: settings.interruptions_are_allowed,
            greeting_delay_sec: settings.greeting_delay_sec,
            min_speech_duration_sec: settings.min_speech_duration_sec,
            tmp_audio_dir: PathBuf::from(&settings.sip_audio_tmp_dir),
            audio_dir: PathBuf::from(&settings.sip_audio_dir),
            record_audio_parts: settings.record_audio_parts,
            sampling_rate: settings.vad_sampling_rate,
            tts_max_inflight: settings.tts_max_inflight,
        }
    }
}

/// Generation state shared across the worker tasks of one call.
struct Flags {
    state: CallState,
    finished: bool,
    hangup_issued: bool,
    user_speaking: bool,
    start_in_flight: bool,
    commit_in_flight: bool,
    spec_active: bool,
    last_unstable_transcription: Option<String>,
    transfer_target: Option<String>,
    transfer_delay_sec: f64,
    transfer_started: bool,
    close_status: Option<String>,
    start_reply_generation: Option<Instant>,
    start_response_generation: Option<Instant>,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            state: CallState::WaitForUser,
            finished: false,
            hangup_issued: false,
            user_speaking: false,
            start_in_flight: false,
            commit_in_flight: false,
            spec_active: false,
            last_unstable_transcription: None,
            transfer_target: None,
            transfer_delay_sec: 1.0,
            transfer_started: false,
            close_status: None,
            start_reply_generation: None,
            start_response_generation: None,
        }
    }
}

/// One live call.
pub struct CallController {
    weak_self: std::sync::Weak<CallController>,
    session_id: String,
    greeting: Option<String>,
    config: CallConfig,
    backend: Arc<dyn GenerationBackend>,
    actions: Arc<dyn CallActions>,
    ws: BackendWsClient,
    flags: Mutex<Flags>,
    start_task: Mutex<Option<JoinHandle<()>>>,
    commit_task: Mutex<Option<JoinHandle<()>>>,
    processor: Mutex<StreamingVadProcessor>,
    tts: TtsPipeline,
    player: Arc<SmartPlayer>,
    port: AudioMediaPort,
    runtime: tokio::runtime::Handle,
}

impl CallController {
    /// Build a controller bound to an open backend session. Must run inside
    /// a tokio runtime; worker tasks are spawned on the current handle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        greeting: Option<String>,
        config: CallConfig,
        backend: Arc<dyn GenerationBackend>,
        actions: Arc<dyn CallActions>,
        ws: BackendWsClient,
        estimator: Arc<dyn SpeechEstimator>,
        vad_config: VadProcessorConfig,
    ) -> Arc<Self> {
        let session_id = session_id.into();
        let runtime = tokio::runtime::Handle::current();

        let controller = Arc::new_cyclic(|weak: &std::sync::Weak<CallController>| {
            let synthesizer = Arc::new(BackendSynthesizer::new(
                Arc::clone(&backend),
                session_id.clone(),
                config.tmp_audio_dir.clone(),
            ));
            let ready_weak = weak.clone();
            let signal_weak = weak.clone();
            let drained_weak = weak.clone();
            let tts = TtsPipeline::new(
                config.tts_max_inflight,
                synthesizer,
                Box::new(move |path, text| {
                    if let Some(call) = ready_weak.upgrade() {
                        call.on_tts_ready(path, text);
                    }
                }),
                Box::new(move || {
                    if let Some(call) = signal_weak.upgrade() {
                        call.try_play_tts();
                    }
                }),
            );
            let player = Arc::new(SmartPlayer::new(
                actions.playback(),
                Box::new(move || {
                    if let Some(call) = drained_weak.upgrade() {
                        call.playback_finished();
                    }
                }),
            ));

            CallController {
                weak_self: weak.clone(),
                processor: Mutex::new(StreamingVadProcessor::new(estimator, vad_config)),
                session_id,
                greeting,
                config,
                backend,
                actions,
                ws,
                flags: Mutex::new(Flags::default()),
                start_task: Mutex::new(None),
                commit_task: Mutex::new(None),
                tts,
                player,
                port: AudioMediaPort::new(),
                runtime,
            }
        });

        let frame_weak = Arc::downgrade(&controller);
        controller
            .port
            .set_on_frame_received(Arc::new(move |frame: &[i16]| {
                if let Some(call) = frame_weak.upgrade() {
                    call.on_audio_frame(frame);
                }
            }));

        controller
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> CallState {
        self.flags.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.flags.lock().finished
    }

    /// The audio port the SIP adapter ferries frames through.
    pub fn port(&self) -> &AudioMediaPort {
        &self.port
    }

    pub fn is_confirmed(&self) -> bool {
        self.actions.is_confirmed()
    }

    /// Open the backend reply stream.
    pub fn connect_ws(&self) {
        let weak = self.weak_self.clone();
        self.ws.connect(
            &self.session_id,
            Arc::new(move |event| {
                if let Some(call) = weak.upgrade() {
                    let runtime = call.runtime.clone();
                    runtime.spawn(async move {
                        call.handle_ws_event(event).await;
                    });
                }
            }),
        );
    }

    /// Record the transfer target applied at the next hangup decision.
    /// Overrides any previous target; a no-op once a transfer has started.
    pub fn set_transfer_target(&self, to_uri: &str, delay_sec: f64) {
        let mut flags = self.flags.lock();
        if flags.transfer_started {
            tracing::debug!(session_id = %self.session_id, "Transfer already started, ignoring new target");
            return;
        }
        flags.transfer_target = Some(to_uri.to_string());
        flags.transfer_delay_sec = delay_sec;
    }

    /// Answer an inbound leg with 200 OK.
    pub fn answer_ok(&self) {
        self.actions.answer(200);
    }

    /// Immediate SIP termination requested by the admission layer.
    pub fn hangup(&self) {
        {
            let mut flags = self.flags.lock();
            if flags.hangup_issued {
                return;
            }
            flags.hangup_issued = true;
        }
        self.actions.hangup_with_tag("hangup");
    }

    /// The call reached SIP confirmed state: start the conversation.
    pub fn handle_confirmed(&self) {
        tracing::debug!(session_id = %self.session_id, "Call connected");
        if let Some(greeting) = self.greeting.clone() {
            self.flags.lock().start_response_generation = Some(Instant::now());
            self.tts.enqueue(greeting, self.config.greeting_delay_sec);
        }
    }

    /// REFER progress from the SIP stack.
    pub fn handle_transfer_status(&self, status: TransferStatus) {
        tracing::debug!(
            session_id = %self.session_id,
            status_code = status.status_code,
            final_notify = status.final_notify,
            "Transfer status"
        );
        if status.final_notify && (200..300).contains(&status.status_code) {
            {
                let mut flags = self.flags.lock();
                if flags.hangup_issued {
                    return;
                }
                flags.hangup_issued = true;
            }
            self.actions.hangup_with_tag("final_notify");
        }
    }

    /// The SIP leg disconnected: tear the call down and close the backend
    /// session with a derived status.
    pub async fn handle_disconnected(&self, last_status_code: u16) {
        let status = {
            let flags = self.flags.lock();
            flags
                .close_status
                .clone()
                .unwrap_or_else(|| close_status_for(last_status_code).to_string())
        };
        tracing::debug!(
            session_id = %self.session_id,
            status = %status,
            last_status_code,
            "Call disconnected"
        );
        self.set_state(CallState::Finished);

        self.tts.cancel();
        self.player.interrupt();
        let trailing = self.processor.lock().finalize();
        if !trailing.is_empty() {
            tracing::debug!(session_id = %self.session_id, "Discarding trailing utterance at teardown");
        }

        if let Some(task) = self.start_task.lock().take() {
            task.abort();
        }
        let commit = self.commit_task.lock().take();
        if let Some(task) = commit {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(session_id = %self.session_id, error = %e, "Commit task failed");
                }
            }
        }

        metrics::add_dropped_frames(self.port.dropped_frames());
        self.ws.stop().await;
        if let Err(e) = self
            .backend
            .close_session(&self.session_id, Some(&status))
            .await
        {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to close backend session");
        }
    }

    // ------------------------------------------------------------------
    // Audio path
    // ------------------------------------------------------------------

    /// Frame delivery off the audio-port worker thread.
    fn on_audio_frame(&self, frame: &[i16]) {
        let (finished, commit_in_flight, ai_can_speak) = {
            let flags = self.flags.lock();
            (
                flags.finished,
                flags.commit_in_flight,
                ai_can_speak(&flags),
            )
        };
        if finished {
            return;
        }
        // With interruptions disabled the caller cannot cut the AI off:
        // frames are dropped before they reach the detector.
        if !self.config.interruptions_are_allowed {
            let ai_speaking = self.player.is_active()
                || (self.tts.has_queue() && ai_can_speak)
                || commit_in_flight;
            if ai_speaking {
                return;
            }
        }

        let events = self.processor.lock().process_samples(frame);
        for event in events {
            self.dispatch_event(event);
        }
    }

    fn dispatch_event(&self, event: VadEvent) {
        match event {
            VadEvent::SpeechStart { .. } => self.handle_speech_start(),
            VadEvent::SpeechEnd {
                start, duration, ..
            } => {
                tracing::debug!(
                    session_id = %self.session_id,
                    speech_end_sec = start + duration,
                    duration_sec = duration,
                    "User speech ended"
                );
            }
            VadEvent::ShortPause {
                audio, duration, ..
            } => self.handle_short_pause(audio, duration),
            VadEvent::LongPause { audio, .. } => self.handle_long_pause(audio),
            VadEvent::UserSilenceTimeout { at } => self.handle_user_silence_timeout(at),
        }
    }

    fn handle_speech_start(&self) {
        tracing::debug!(session_id = %self.session_id, "User speech started");
        self.flags.lock().user_speaking = true;
        self.set_state(CallState::WaitForUser);
        self.tts.cancel();
        self.player.interrupt();
        self.processor.lock().cancel_user_silence();

        let needs_rollback = {
            let mut flags = self.flags.lock();
            let needed = flags.spec_active && !flags.commit_in_flight;
            if needed {
                flags.spec_active = false;
                flags.start_in_flight = false;
            }
            needed
        };
        if needs_rollback {
            if let Some(task) = self.start_task.lock().take() {
                task.abort();
            }
            if let Some(this) = self.weak_self.upgrade() {
                self.runtime.spawn(async move {
                    this.rollback_session().await;
                });
            }
        }
    }

    fn handle_short_pause(&self, audio: Vec<f32>, duration: f64) {
        {
            let mut flags = self.flags.lock();
            if flags.finished || flags.hangup_issued {
                return;
            }
            if flags.commit_in_flight {
                tracing::debug!(session_id = %self.session_id, "Skipping speculation, commit in flight");
                return;
            }
            if flags.start_in_flight {
                tracing::debug!(session_id = %self.session_id, "Skipping speculation, start in flight");
                return;
            }
            if duration < self.config.min_speech_duration_sec {
                tracing::debug!(
                    session_id = %self.session_id,
                    duration_sec = duration,
                    "Speech too short, waiting for long pause"
                );
                return;
            }
            flags.start_in_flight = true;
            flags.start_response_generation = Some(Instant::now());
        }
        tracing::debug!(
            session_id = %self.session_id,
            duration_sec = duration,
            buffer_len = audio.len(),
            "Short pause detected"
        );

        self.tts.cancel();
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let task = self.runtime.spawn(async move {
            this.rollback_and_speculate(audio).await;
        });
        *self.start_task.lock() = Some(task);
    }

    fn handle_long_pause(&self, audio: Vec<f32>) {
        {
            let mut flags = self.flags.lock();
            if flags.finished || flags.hangup_issued || flags.commit_in_flight {
                return;
            }
            flags.commit_in_flight = true;
        }
        tracing::debug!(
            session_id = %self.session_id,
            buffer_len = audio.len(),
            "Long pause detected"
        );

        if self.config.record_audio_parts {
            self.record_audio_part(&audio);
        }

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let task = self.runtime.spawn(async move {
            this.commit_generate(audio).await;
        });
        *self.commit_task.lock() = Some(task);
    }

    fn handle_user_silence_timeout(&self, at: f64) {
        tracing::debug!(session_id = %self.session_id, timeout_sec = at, "User silence timeout, finishing");
        self.set_state(CallState::Finished);
        if let Some(this) = self.weak_self.upgrade() {
            self.runtime.spawn(async move {
                this.hangup_if_no_active_speech().await;
            });
        }
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    async fn rollback_and_speculate(self: Arc<Self>, audio: Vec<f32>) {
        let needs_rollback = {
            let mut flags = self.flags.lock();
            let needed = flags.spec_active && !flags.commit_in_flight;
            if needed {
                flags.spec_active = false;
            }
            needed
        };
        if needs_rollback {
            self.rollback_session().await;
        }
        self.speculative_generate(audio).await;
        self.flags.lock().start_in_flight = false;
    }

    async fn speculative_generate(&self, audio: Vec<f32>) {
        if audio.is_empty() {
            return;
        }
        self.set_state(CallState::SpeculativeGenerate);

        let Some(text) = self.transcribe(&audio).await else {
            return;
        };
        {
            let flags = self.flags.lock();
            if flags.state != CallState::SpeculativeGenerate || flags.finished {
                tracing::debug!(
                    session_id = %self.session_id,
                    state = ?flags.state,
                    "Speculation superseded, discarding result"
                );
                return;
            }
        }
        if self.is_same_unstable(&text) {
            tracing::debug!(session_id = %self.session_id, "Unstable transcription unchanged, skipping");
            return;
        }

        self.start_generate(text).await;
    }

    /// Clear queued playback and post `/start` for the transcription.
    async fn start_generate(&self, text: String) {
        tracing::debug!(session_id = %self.session_id, text = %text, "Starting response generation");
        self.tts.cancel();
        self.player.interrupt();
        {
            let mut flags = self.flags.lock();
            flags.last_unstable_transcription = Some(text.clone());
            flags.start_reply_generation = Some(Instant::now());
        }
        match self.backend.start(&self.session_id, &text).await {
            Ok(_) => {
                self.flags.lock().spec_active = true;
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "start request failed");
            }
        }
    }

    async fn commit_generate(self: Arc<Self>, audio: Vec<f32>) {
        // Give an in-flight speculative start a bounded chance to land.
        let pending_start = self.start_task.lock().take();
        if let Some(task) = pending_start {
            tracing::debug!(session_id = %self.session_id, "Awaiting speculative transcription");
            if tokio::time::timeout(Duration::from_secs(COMMIT_START_WAIT_SECS), task)
                .await
                .is_err()
            {
                tracing::warn!(session_id = %self.session_id, "Speculative start did not finish in time");
            }
        }

        let (finished, spec_text) = {
            let flags = self.flags.lock();
            let spec_text = if flags.state == CallState::SpeculativeGenerate {
                flags.last_unstable_transcription.clone()
            } else {
                None
            };
            (flags.finished, spec_text)
        };
        if finished {
            self.release_commit();
            return;
        }

        let text = match spec_text {
            Some(text) => Some(text),
            None => {
                tracing::debug!(session_id = %self.session_id, "No speculation active, transcribing for commit");
                match self.transcribe(&audio).await {
                    Some(text) => {
                        self.start_generate(text.clone()).await;
                        Some(text)
                    }
                    None => None,
                }
            }
        };
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            self.release_commit();
            return;
        };

        tracing::debug!(session_id = %self.session_id, text = %text, "Commit generation started");
        self.set_state(CallState::CommitGenerate);
        self.flags.lock().user_speaking = false;
        self.processor.lock().set_long_pause_suspended(true);
        self.try_play_tts();

        match self.backend.commit(&self.session_id).await {
            Ok(commit) => {
                if !self.config.streaming_replies {
                    if let Some(response) = commit.response.as_deref() {
                        let response = text::remove_emojis(response);
                        if !response.is_empty() {
                            self.tts.enqueue(response, 0.0);
                        }
                    }
                }
                self.set_state(CallState::WaitForUser);
                self.try_play_tts();
                if commit.session_ends() {
                    tracing::debug!(session_id = %self.session_id, "Backend signalled session end");
                    let already_finished = self.flags.lock().finished;
                    if !already_finished {
                        self.hangup_if_no_active_speech().await;
                        self.set_state(CallState::Finished);
                    }
                }
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Commit generation failed");
                self.set_state(CallState::WaitForUser);
            }
        }

        self.processor.lock().set_long_pause_suspended(false);
        self.release_commit();
    }

    fn release_commit(&self) {
        let mut flags = self.flags.lock();
        flags.last_unstable_transcription = None;
        flags.commit_in_flight = false;
        flags.spec_active = false;
    }

    async fn rollback_session(&self) {
        tracing::debug!(session_id = %self.session_id, "Rolling back speculation");
        if let Err(e) = self.backend.rollback(&self.session_id).await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Rollback failed");
        }
    }

    async fn transcribe(&self, audio: &[f32]) -> Option<String> {
        if audio.is_empty() {
            tracing::debug!(session_id = %self.session_id, "Empty buffer, skipping transcription");
            return None;
        }
        let blob = wav::encode_pcm16(audio, self.config.sampling_rate);
        let started = Instant::now();
        match self.backend.transcribe(&blob).await {
            Ok(text) => {
                let elapsed = started.elapsed().as_secs_f64();
                metrics::observe_response_time("transcribe", elapsed);
                tracing::info!(
                    session_id = %self.session_id,
                    text = %text,
                    elapsed_sec = elapsed,
                    "Transcription completed"
                );
                if text.is_empty() {
                    self.processor.lock().track_empty_transcription();
                    None
                } else {
                    Some(text)
                }
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Transcription failed");
                None
            }
        }
    }

    fn is_same_unstable(&self, text: &str) -> bool {
        let flags = self.flags.lock();
        match &flags.last_unstable_transcription {
            Some(previous) => text::normalize_text(previous) == text::normalize_text(text),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Replies and playback
    // ------------------------------------------------------------------

    async fn handle_ws_event(&self, event: WsEvent) {
        match event {
            WsEvent::Message { text } => self.handle_ws_message(text).await,
            WsEvent::Eos => {
                tracing::debug!(session_id = %self.session_id, "End of stream received");
                let (finished, state) = {
                    let flags = self.flags.lock();
                    (flags.finished, flags.state)
                };
                if finished {
                    self.try_play_tts();
                    self.hangup_if_no_active_speech().await;
                } else if matches!(state, CallState::CommitGenerate | CallState::WaitForUser) {
                    self.try_play_tts();
                } else {
                    tracing::debug!(session_id = %self.session_id, state = ?state, "Unhandled state on EOS");
                }
            }
            WsEvent::Eoc => {
                tracing::debug!(session_id = %self.session_id, "End of conversation received");
                let state = self.state();
                if self.config.sip_early_eoc && state != CallState::SpeculativeGenerate {
                    self.set_state(CallState::Finished);
                    self.try_play_tts();
                    self.hangup_if_no_active_speech().await;
                }
            }
            WsEvent::Timeout => {
                tracing::debug!(session_id = %self.session_id, "Backend session timeout event");
            }
            WsEvent::Close => {
                tracing::debug!(session_id = %self.session_id, "Backend WebSocket closed");
            }
        }
    }

    async fn handle_ws_message(&self, raw: String) {
        if let Some(t0) = self.flags.lock().start_reply_generation.take() {
            let elapsed = t0.elapsed().as_secs_f64();
            metrics::observe_response_time("generate", elapsed);
            tracing::info!(session_id = %self.session_id, elapsed_sec = elapsed, "Generation completed");
        }
        let text = text::remove_emojis(&raw);
        if text.is_empty() {
            return;
        }
        let user_speaking = self.flags.lock().user_speaking;
        if user_speaking {
            tracing::debug!(session_id = %self.session_id, "Discarded message, user speaking");
            return;
        }
        if !self.config.streaming_replies {
            // Non-streaming sessions only play the final commit response.
            tracing::debug!(session_id = %self.session_id, "Ignoring streamed fragment in non-streaming mode");
            return;
        }
        tracing::debug!(session_id = %self.session_id, text = %text, "Reply fragment queued");
        self.tts.enqueue(text, 0.0);
        self.try_play_tts();
    }

    /// Drain ready TTS results while the AI holds the floor.
    fn try_play_tts(&self) {
        let can_play = {
            let flags = self.flags.lock();
            !flags.user_speaking && ai_can_speak(&flags)
        };
        self.tts.try_play(can_play);
    }

    /// A synthesized reply is ready for playback, in order.
    fn on_tts_ready(&self, path: PathBuf, _text: String) {
        if let Some(t0) = self.flags.lock().start_response_generation.take() {
            let elapsed = t0.elapsed().as_secs_f64();
            metrics::observe_response_time("play_queue", elapsed);
            metrics::observe_response_summary("play_queue", elapsed);
            tracing::debug!(session_id = %self.session_id, elapsed_sec = elapsed, "Response ready");
        }
        self.player.enqueue(path, true);
        self.player.play();
        // The AI holds the floor while this plays.
        self.processor.lock().reset_user_silence();
    }

    /// The player drained naturally.
    fn playback_finished(&self) {
        if self.is_finished() {
            if let Some(this) = self.weak_self.upgrade() {
                self.runtime.spawn(async move {
                    this.hangup_if_no_active_speech().await;
                });
            }
        } else {
            self.processor.lock().start_user_silence();
        }
    }

    // ------------------------------------------------------------------
    // Hangup and transfer
    // ------------------------------------------------------------------

    fn is_active_ai_speech(&self) -> bool {
        let ai_can_speak = ai_can_speak(&self.flags.lock());
        self.player.is_active() || (self.tts.has_queue() && ai_can_speak)
    }

    async fn hangup_if_no_active_speech(&self) {
        if self.is_active_ai_speech() {
            return;
        }
        tracing::debug!(session_id = %self.session_id, "Queue empty and player inactive");
        self.soft_hangup().await;
    }

    /// Deferred BYE: wait, re-check the playback drain, then transfer or
    /// hang up.
    async fn soft_hangup(&self) {
        tokio::time::sleep(Duration::from_secs_f64(SOFT_HANGUP_PAUSE_SECS)).await;
        if self.is_active_ai_speech() {
            return;
        }
        tracing::debug!(session_id = %self.session_id, "Soft hangup initiated");

        enum Outcome {
            Bye,
            Transfer(String, f64),
            Nothing,
        }
        let outcome = {
            let mut flags = self.flags.lock();
            if flags.hangup_issued {
                Outcome::Nothing
            } else if let Some(target) = flags.transfer_target.clone() {
                if flags.transfer_started {
                    Outcome::Nothing
                } else {
                    flags.transfer_started = true;
                    flags.close_status = Some("transferred".to_string());
                    Outcome::Transfer(target, flags.transfer_delay_sec)
                }
            } else {
                flags.hangup_issued = true;
                Outcome::Bye
            }
        };

        match outcome {
            Outcome::Nothing => {}
            Outcome::Bye => {
                self.actions.hangup_with_tag("soft_hangup");
            }
            Outcome::Transfer(target, delay_sec) => {
                tracing::debug!(session_id = %self.session_id, to_uri = %target, "Transferring call");
                if let Some(digits) = target.strip_prefix("dtmf:") {
                    self.actions.dial_dtmf(digits);
                    tokio::time::sleep(Duration::from_secs_f64(delay_sec)).await;
                    let issue = {
                        let mut flags = self.flags.lock();
                        if flags.hangup_issued {
                            false
                        } else {
                            flags.hangup_issued = true;
                            true
                        }
                    };
                    if issue {
                        self.actions.hangup_with_tag("transferred");
                    }
                } else {
                    self.actions.refer(&target);
                }
            }
        }
    }

    fn set_state(&self, new_state: CallState) {
        let mut flags = self.flags.lock();
        if flags.finished {
            return;
        }
        if flags.state != new_state {
            tracing::debug!(
                session_id = %self.session_id,
                from = ?flags.state,
                to = ?new_state,
                "Call state change"
            );
        }
        flags.state = new_state;
        if new_state == CallState::Finished {
            flags.finished = true;
        }
    }

    fn record_audio_part(&self, audio: &[f32]) {
        let dir = self.config.audio_dir.join(&self.session_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(session_id = %self.session_id, error = %e, "Cannot create recording dir");
            return;
        }
        let path = dir.join(format!("part-{}.wav", uuid::Uuid::now_v7()));
        let blob = wav::encode_pcm16(audio, self.config.sampling_rate);
        if let Err(e) = std::fs::write(&path, blob) {
            tracing::warn!(session_id = %self.session_id, error = %e, "Cannot write recording part");
        }
    }
}

fn ai_can_speak(flags: &Flags) -> bool {
    matches!(
        flags.state,
        CallState::WaitForUser | CallState::CommitGenerate | CallState::Finished
    )
}
