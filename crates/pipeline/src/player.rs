//! Ordered playback queue over the SIP media sink.
//!
//! One file plays at a time; when the underlying player reports its terminal
//! event the next queued file starts. `interrupt` tears everything down and
//! deletes files as directed without notifying the drain observer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::PipelineError;

/// Starts file playback on the call's media sink.
///
/// Implemented by the SIP adapter; the returned handle stops the transmit
/// when dropped or stopped. The adapter must invoke
/// [`SmartPlayer::handle_eof`] when playback reaches end of file.
pub trait MediaPlayback: Send + Sync {
    fn start(&self, path: &Path) -> Result<Box<dyn PlaybackHandle>, PipelineError>;
}

/// A live playback that can be stopped early.
pub trait PlaybackHandle: Send {
    fn stop(&mut self);
}

/// Observer invoked when the queue drains naturally (not on interrupt).
pub type DrainedFn = Box<dyn Fn() + Send + Sync>;

struct QueueItem {
    path: PathBuf,
    discard_after: bool,
}

#[derive(Default)]
struct PlayerState {
    queue: VecDeque<QueueItem>,
    current: Option<QueueItem>,
    handle: Option<Box<dyn PlaybackHandle>>,
    tearing_down: bool,
}

/// FIFO file player with interrupt-and-flush.
pub struct SmartPlayer {
    playback: Arc<dyn MediaPlayback>,
    on_drained: DrainedFn,
    state: Mutex<PlayerState>,
}

impl SmartPlayer {
    pub fn new(playback: Arc<dyn MediaPlayback>, on_drained: DrainedFn) -> Self {
        Self {
            playback,
            on_drained,
            state: Mutex::new(PlayerState::default()),
        }
    }

    /// Append a file. `discard_after` transfers ownership: the file is
    /// deleted once consumed or on interrupt.
    pub fn enqueue(&self, path: impl Into<PathBuf>, discard_after: bool) {
        let mut state = self.state.lock();
        state.queue.push_back(QueueItem {
            path: path.into(),
            discard_after,
        });
    }

    /// Start playback if idle.
    pub fn play(&self) {
        let mut state = self.state.lock();
        if state.current.is_none() && !state.queue.is_empty() {
            self.play_next(&mut state);
        }
    }

    /// Tear down the current playback and drop the rest of the queue,
    /// deleting files as directed. The drain observer is not called.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        if state.tearing_down {
            return;
        }
        state.tearing_down = true;
        if let Some(mut handle) = state.handle.take() {
            handle.stop();
        }
        Self::discard(state.current.take());
        while let Some(item) = state.queue.pop_front() {
            Self::discard(Some(item));
        }
        state.tearing_down = false;
    }

    /// Whether something is playing or queued.
    pub fn is_active(&self) -> bool {
        let state = self.state.lock();
        state.current.is_some() || !state.queue.is_empty()
    }

    /// The current playback reached end of file. Called by the media
    /// adapter off the realtime thread.
    pub fn handle_eof(&self) {
        let notify_drained = {
            let mut state = self.state.lock();
            if state.tearing_down {
                return;
            }
            if let Some(mut handle) = state.handle.take() {
                handle.stop();
            }
            Self::discard(state.current.take());
            if !state.queue.is_empty() {
                self.play_next(&mut state);
                false
            } else {
                true
            }
        };
        if notify_drained {
            (self.on_drained)();
        }
    }

    fn play_next(&self, state: &mut PlayerState) {
        while let Some(item) = state.queue.pop_front() {
            if state.tearing_down {
                state.queue.push_front(item);
                return;
            }
            match self.playback.start(&item.path) {
                Ok(handle) => {
                    state.current = Some(item);
                    state.handle = Some(handle);
                    return;
                }
                Err(e) => {
                    tracing::warn!(path = %item.path.display(), error = %e, "Playback start failed");
                    Self::discard(Some(item));
                }
            }
        }
        state.current = None;
    }

    fn discard(item: Option<QueueItem>) {
        let Some(item) = item else { return };
        if item.discard_after {
            if let Err(e) = std::fs::remove_file(&item.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %item.path.display(), error = %e, "Failed to remove played file");
                }
            }
        }
    }
}
