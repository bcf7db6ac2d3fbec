//! TTS pipeline.
//!
//! Texts are synthesized by up to `max_inflight` concurrent workers while
//! playback consumes results strictly in enqueue order. Every task carries a
//! shared cancellation flag; synthesizers check it around network calls and
//! the drain step skips canceled results, removing any file they produced.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::PipelineError;

/// Turns text into a playable audio file.
///
/// Implementations must check `canceled` before starting and again after any
/// network call, returning `Ok(None)` to short-circuit. A `None` result is
/// skipped by the drain without being treated as an error.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        canceled: &AtomicBool,
    ) -> Result<Option<PathBuf>, PipelineError>;
}

/// Callback invoked with each ready `(path, text)` pair, in enqueue order.
pub type ReadyFn = Box<dyn Fn(PathBuf, String) + Send + Sync>;

/// Observer poked whenever a synthesis finishes or new work is enqueued, so
/// the owner can re-attempt [`TtsPipeline::try_play`].
pub type ReadySignalFn = Box<dyn Fn() + Send + Sync>;

struct PlaybackTask {
    text: String,
    rx: oneshot::Receiver<Option<PathBuf>>,
    canceled: Arc<AtomicBool>,
}

struct PendingTask {
    text: String,
    tx: oneshot::Sender<Option<PathBuf>>,
    canceled: Arc<AtomicBool>,
}

#[derive(Default)]
struct Queues {
    /// FIFO consumed by playback; one entry per enqueued text.
    playback: VecDeque<PlaybackTask>,
    /// Tasks not yet handed to a worker.
    pending: VecDeque<PendingTask>,
    inflight: usize,
}

/// Parallel synthesis with in-order delivery and cancellation.
pub struct TtsPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    max_inflight: usize,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    ready_fn: ReadyFn,
    ready_signal: ReadySignalFn,
    queues: Mutex<Queues>,
    /// Handle captured at construction so enqueue works from non-runtime
    /// threads (the audio port worker, SIP callbacks).
    runtime: tokio::runtime::Handle,
}

impl TtsPipeline {
    /// Must be created inside a tokio runtime; synthesis workers are
    /// spawned on the current handle.
    pub fn new(
        max_inflight: usize,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        ready_fn: ReadyFn,
        ready_signal: ReadySignalFn,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_inflight: max_inflight.max(1),
                synthesizer,
                ready_fn,
                ready_signal,
                queues: Mutex::new(Queues::default()),
                runtime: tokio::runtime::Handle::current(),
            }),
        }
    }

    /// Schedule synthesis of `text`. A positive `delay_sec` defers the
    /// enqueue itself, so ordering reflects the deferred arrival time.
    pub fn enqueue(&self, text: impl Into<String>, delay_sec: f64) {
        let text = text.into();
        if delay_sec > 0.0 {
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(delay_sec)).await;
                Inner::enqueue_now(&inner, text);
            });
            return;
        }
        Inner::enqueue_now(&self.inner, text);
    }

    /// Cancel all in-flight and pending work and clear both queues.
    pub fn cancel(&self) {
        let mut queues = self.inner.queues.lock();
        for task in &queues.playback {
            task.canceled.store(true, Ordering::SeqCst);
        }
        for task in &queues.pending {
            task.canceled.store(true, Ordering::SeqCst);
        }
        queues.playback.clear();
        queues.pending.clear();
    }

    /// Whether any text is still awaiting delivery.
    pub fn has_queue(&self) -> bool {
        !self.inner.queues.lock().playback.is_empty()
    }

    /// Drain ready results in FIFO order while the head is complete.
    /// Canceled heads are dropped (their file removed); a failed head is
    /// skipped so a single bad synthesis does not stall the queue.
    pub fn try_play(&self, can_play: bool) {
        if !can_play {
            return;
        }
        loop {
            let (path, text) = {
                let mut queues = self.inner.queues.lock();
                let Some(front) = queues.playback.front_mut() else {
                    return;
                };
                match front.rx.try_recv() {
                    Err(oneshot::error::TryRecvError::Empty) => return,
                    Err(oneshot::error::TryRecvError::Closed) => {
                        queues.playback.pop_front();
                        continue;
                    }
                    Ok(result) => {
                        let task = queues.playback.pop_front().expect("front exists");
                        drop(queues);
                        match result {
                            Some(path) if !task.canceled.load(Ordering::SeqCst) => {
                                (path, task.text)
                            }
                            Some(path) => {
                                remove_file_quietly(&path);
                                continue;
                            }
                            None => continue,
                        }
                    }
                }
            };
            (self.inner.ready_fn)(path, text);
        }
    }
}

impl Inner {
    fn enqueue_now(inner: &Arc<Inner>, text: String) {
        let canceled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        {
            let mut queues = inner.queues.lock();
            queues.playback.push_back(PlaybackTask {
                text: text.clone(),
                rx,
                canceled: Arc::clone(&canceled),
            });
            queues.pending.push_back(PendingTask { text, tx, canceled });
        }
        Self::maybe_start_synthesis(inner);
        (inner.ready_signal)();
    }

    fn maybe_start_synthesis(inner: &Arc<Inner>) {
        let mut to_start = Vec::new();
        {
            let mut queues = inner.queues.lock();
            while queues.inflight < inner.max_inflight {
                let Some(task) = queues.pending.pop_front() else {
                    break;
                };
                if task.canceled.load(Ordering::SeqCst) {
                    continue;
                }
                queues.inflight += 1;
                to_start.push(task);
            }
        }

        for task in to_start {
            let runtime = inner.runtime.clone();
            let inner = Arc::clone(inner);
            runtime.spawn(async move {
                let result = inner
                    .synthesizer
                    .synthesize(&task.text, &task.canceled)
                    .await;
                let outcome = match result {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::warn!(error = %e, text = %task.text, "TTS synthesis failed");
                        None
                    }
                };
                let _ = task.tx.send(outcome);
                Self::on_synthesis_finished(&inner);
            });
        }
    }

    fn on_synthesis_finished(inner: &Arc<Inner>) {
        {
            let mut queues = inner.queues.lock();
            queues.inflight = queues.inflight.saturating_sub(1);
        }
        (inner.ready_signal)();
        Self::maybe_start_synthesis(inner);
    }
}

fn remove_file_quietly(path: &PathBuf) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "Failed to remove canceled TTS file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    /// Synthesizer with per-text artificial delays, writing marker files.
    struct SlowSynth {
        dir: std::path::PathBuf,
        delays_ms: Mutex<std::collections::HashMap<String, u64>>,
        fail_on: Option<String>,
    }

    impl SlowSynth {
        fn new(dir: &std::path::Path) -> Self {
            Self {
                dir: dir.to_path_buf(),
                delays_ms: Mutex::new(std::collections::HashMap::new()),
                fail_on: None,
            }
        }

        fn delay(&self, text: &str, ms: u64) {
            self.delays_ms.lock().insert(text.to_string(), ms);
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for SlowSynth {
        async fn synthesize(
            &self,
            text: &str,
            canceled: &AtomicBool,
        ) -> Result<Option<PathBuf>, PipelineError> {
            if canceled.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let delay = self.delays_ms.lock().get(text).copied().unwrap_or(1);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.fail_on.as_deref() == Some(text) {
                return Err(PipelineError::Tts("synthetic failure".to_string()));
            }
            if canceled.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let path = self.dir.join(format!("{text}.wav"));
            std::fs::write(&path, b"RIFF")?;
            Ok(Some(path))
        }
    }

    fn collecting_pipeline(
        synth: Arc<dyn SpeechSynthesizer>,
    ) -> (TtsPipeline, Arc<Mutex<Vec<String>>>, Arc<Notify>) {
        let played = Arc::new(Mutex::new(Vec::new()));
        let played_cb = Arc::clone(&played);
        let notify = Arc::new(Notify::new());
        let notify_cb = Arc::clone(&notify);
        let pipeline = TtsPipeline::new(
            3,
            synth,
            Box::new(move |_path, text| played_cb.lock().push(text)),
            Box::new(move || notify_cb.notify_one()),
        );
        (pipeline, played, notify)
    }

    async fn drain_until(
        pipeline: &TtsPipeline,
        notify: &Notify,
        played: &Mutex<Vec<String>>,
        expected: usize,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            pipeline.try_play(true);
            if played.lock().len() >= expected || tokio::time::Instant::now() > deadline {
                return;
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivery_is_fifo_despite_completion_order() {
        let dir = std::env::temp_dir().join(format!("tts-fifo-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let synth = SlowSynth::new(&dir);
        synth.delay("first", 80);
        synth.delay("second", 5);
        synth.delay("third", 5);
        let (pipeline, played, notify) = collecting_pipeline(Arc::new(synth));

        pipeline.enqueue("first", 0.0);
        pipeline.enqueue("second", 0.0);
        pipeline.enqueue("third", 0.0);

        drain_until(&pipeline, &notify, &played, 3).await;
        assert_eq!(*played.lock(), vec!["first", "second", "third"]);
        assert!(!pipeline.has_queue());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_clears_queue_and_suppresses_delivery() {
        let dir = std::env::temp_dir().join(format!("tts-cancel-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let synth = SlowSynth::new(&dir);
        synth.delay("a", 50);
        synth.delay("b", 50);
        let (pipeline, played, _notify) = collecting_pipeline(Arc::new(synth));

        pipeline.enqueue("a", 0.0);
        pipeline.enqueue("b", 0.0);
        assert!(pipeline.has_queue());

        pipeline.cancel();
        assert!(!pipeline.has_queue());

        tokio::time::sleep(Duration::from_millis(120)).await;
        pipeline.try_play(true);
        assert!(played.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_task_is_skipped() {
        let dir = std::env::temp_dir().join(format!("tts-fail-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut synth = SlowSynth::new(&dir);
        synth.fail_on = Some("bad".to_string());
        let (pipeline, played, notify) = collecting_pipeline(Arc::new(synth));

        pipeline.enqueue("ok1", 0.0);
        pipeline.enqueue("bad", 0.0);
        pipeline.enqueue("ok2", 0.0);

        drain_until(&pipeline, &notify, &played, 2).await;
        assert_eq!(*played.lock(), vec!["ok1", "ok2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn try_play_respects_can_play() {
        let dir = std::env::temp_dir().join(format!("tts-gate-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let synth = SlowSynth::new(&dir);
        let (pipeline, played, notify) = collecting_pipeline(Arc::new(synth));

        pipeline.enqueue("gated", 0.0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.try_play(false);
        assert!(played.lock().is_empty());
        assert!(pipeline.has_queue());

        drain_until(&pipeline, &notify, &played, 1).await;
        assert_eq!(*played.lock(), vec!["gated"]);
    }
}
