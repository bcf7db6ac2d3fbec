//! Audio port at the SIP media boundary.
//!
//! The media stack delivers and requests frames on realtime threads that
//! must never block. Received frames are copied into a bounded queue and
//! drained by a dedicated worker thread; outbound frames are filled
//! synchronously from a provider with zero padding for any shortfall.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use voice_gateway_config::port::MAX_QUEUE_SIZE;

/// Handler for inbound PCM16 frames, invoked on the port's worker thread.
pub type FrameHandler = Arc<dyn Fn(&[i16]) + Send + Sync>;

/// Provider of outbound PCM16 samples, invoked on the realtime thread.
/// Receives the requested sample count and may return fewer samples.
pub type FrameProvider = Arc<dyn Fn(usize) -> Vec<i16> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_frame_received: Option<FrameHandler>,
    on_frame_requested: Option<FrameProvider>,
}

#[derive(Default)]
struct FrameQueue {
    frames: VecDeque<Vec<i16>>,
    stopped: bool,
}

struct Shared {
    queue: Mutex<FrameQueue>,
    available: Condvar,
    handlers: Mutex<Handlers>,
    dropped_frames: AtomicU64,
}

/// Frame ferry between the SIP media stack and the application.
pub struct AudioMediaPort {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl AudioMediaPort {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(FrameQueue::default()),
            available: Condvar::new(),
            handlers: Mutex::new(Handlers::default()),
            dropped_frames: AtomicU64::new(0),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("audio-port".to_string())
            .spawn(move || worker_loop(worker_shared))
            .expect("spawn audio port worker");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub fn set_on_frame_received(&self, handler: FrameHandler) {
        self.shared.handlers.lock().on_frame_received = Some(handler);
    }

    pub fn set_on_frame_requested(&self, provider: FrameProvider) {
        self.shared.handlers.lock().on_frame_requested = Some(provider);
    }

    /// Called from the realtime media thread with a received frame. Never
    /// blocks: on overflow the oldest frame is dropped and counted.
    pub fn deliver_received_frame(&self, pcm: &[i16]) {
        if pcm.is_empty() {
            return;
        }
        let frame = pcm.to_vec();
        {
            let mut queue = self.shared.queue.lock();
            if queue.frames.len() >= MAX_QUEUE_SIZE {
                queue.frames.pop_front();
                self.shared.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
            queue.frames.push_back(frame);
        }
        self.shared.available.notify_one();
    }

    /// Called from the realtime media thread to fill an outbound frame.
    /// Returns the number of bytes written; the tail beyond what the
    /// provider returned is zero-filled.
    pub fn fill_frame_to_send(&self, buffer: &mut [i16]) -> usize {
        let provider = self.shared.handlers.lock().on_frame_requested.clone();
        let Some(provider) = provider else {
            buffer.fill(0);
            return 0;
        };
        let data = provider(buffer.len());
        let copy = data.len().min(buffer.len());
        buffer[..copy].copy_from_slice(&data[..copy]);
        buffer[copy..].fill(0);
        buffer.len() * std::mem::size_of::<i16>()
    }

    /// Frames dropped due to queue overflow since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    /// Frames currently waiting for the worker.
    pub fn queued_frames(&self) -> usize {
        self.shared.queue.lock().frames.len()
    }
}

impl Default for AudioMediaPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioMediaPort {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stopped = true;
        }
        self.shared.available.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let frame = {
            let mut queue = shared.queue.lock();
            while queue.frames.is_empty() && !queue.stopped {
                shared.available.wait(&mut queue);
            }
            if queue.stopped && queue.frames.is_empty() {
                return;
            }
            queue.frames.pop_front()
        };
        let Some(frame) = frame else { continue };
        let handler = shared.handlers.lock().on_frame_received.clone();
        if let Some(handler) = handler {
            // A panicking handler must not take the port down with it.
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&frame)));
            if outcome.is_err() {
                tracing::error!("Audio frame handler panicked");
            }
        }
    }
}
