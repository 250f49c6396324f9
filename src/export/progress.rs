use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::export::state::ExportState;

/// Frames in the rolling encode-rate window.
pub const ROLLING_WINDOW: usize = 30;

/// Snapshot of a run's progress.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ExportProgress {
    pub state: ExportState,
    pub fraction_complete: f64,
    pub current_frame: u64,
    pub total_frames: u64,
    /// Frames the encoder reported as consumed.
    pub encoded_frames: u64,
    /// Rate of the last frame alone.
    pub instant_rate_fps: f64,
    /// Rate over the last [`ROLLING_WINDOW`] frames.
    pub rolling_rate_fps: f64,
    pub elapsed_secs: f64,
    pub estimated_remaining_secs: Option<f64>,
    pub status: String,
}

impl ExportProgress {
    fn initial(total_frames: u64) -> Self {
        Self {
            state: ExportState::Idle,
            fraction_complete: 0.0,
            current_frame: 0,
            total_frames,
            encoded_frames: 0,
            instant_rate_fps: 0.0,
            rolling_rate_fps: 0.0,
            elapsed_secs: 0.0,
            estimated_remaining_secs: None,
            status: String::new(),
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(u64, &ExportProgress) + Send + Sync>;

/// Fan-out of progress updates to subscribers, shared by every run of an engine.
#[derive(Clone, Default)]
pub struct ProgressHub {
    subscribers: Arc<Mutex<Vec<ProgressCallback>>>,
}

impl std::fmt::Debug for ProgressHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHub")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl ProgressHub {
    pub fn subscribe(&self, cb: ProgressCallback) {
        self.subscribers.lock().push(cb);
    }

    pub fn publish(&self, run_id: u64, progress: &ExportProgress) {
        // Subscribers may cancel the run from inside the callback; do not hold the lock.
        let subs = self.subscribers.lock().clone();
        for cb in subs {
            cb(run_id, progress);
        }
    }
}

/// Per-run progress bookkeeping: rates, remaining time and the latest snapshot.
#[derive(Debug)]
pub struct ProgressTracker {
    run_id: u64,
    hub: ProgressHub,
    latest: Arc<Mutex<ExportProgress>>,
    encoded: Arc<AtomicU64>,
    started: Instant,
    last_frame: Option<Instant>,
    window: VecDeque<Instant>,
}

impl ProgressTracker {
    pub fn new(run_id: u64, hub: ProgressHub) -> Self {
        Self {
            run_id,
            hub,
            latest: Arc::new(Mutex::new(ExportProgress::initial(0))),
            encoded: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
            last_frame: None,
            window: VecDeque::with_capacity(ROLLING_WINDOW + 1),
        }
    }

    /// Shared handle to the latest snapshot.
    pub fn latest(&self) -> Arc<Mutex<ExportProgress>> {
        self.latest.clone()
    }

    /// Counter the encoder's progress callback writes into.
    pub fn encoded_counter(&self) -> Arc<AtomicU64> {
        self.encoded.clone()
    }

    pub fn set_total(&mut self, total_frames: u64) {
        self.latest.lock().total_frames = total_frames;
    }

    /// Restart the clock at the beginning of the frame loop.
    pub fn start(&mut self) {
        self.started = Instant::now();
        self.last_frame = None;
        self.window.clear();
    }

    /// Publish a state change without frame movement.
    pub fn status(&mut self, state: ExportState, status: impl Into<String>) {
        let snap = {
            let mut p = self.latest.lock();
            p.state = state;
            p.status = status.into();
            p.elapsed_secs = self.started.elapsed().as_secs_f64();
            p.encoded_frames = self.encoded.load(Ordering::Relaxed);
            p.clone()
        };
        self.hub.publish(self.run_id, &snap);
    }

    /// Record that `current_frame` frames are done.
    pub fn frame_done(&mut self, current_frame: u64) {
        let now = Instant::now();
        let instant_rate = match self.last_frame {
            Some(prev) => rate(1, now.duration_since(prev).as_secs_f64()),
            None => rate(1, now.duration_since(self.started).as_secs_f64()),
        };
        self.last_frame = Some(now);
        self.window.push_back(now);
        while self.window.len() > ROLLING_WINDOW {
            self.window.pop_front();
        }
        let rolling = match (self.window.front(), self.window.len()) {
            (Some(first), n) if n >= 2 => rate(n as u64 - 1, now.duration_since(*first).as_secs_f64()),
            _ => instant_rate,
        };

        let snap = {
            let mut p = self.latest.lock();
            p.state = ExportState::Rendering;
            p.current_frame = current_frame;
            p.fraction_complete = fraction(current_frame, p.total_frames);
            p.instant_rate_fps = instant_rate;
            p.rolling_rate_fps = rolling;
            p.elapsed_secs = self.started.elapsed().as_secs_f64();
            p.encoded_frames = self.encoded.load(Ordering::Relaxed);
            let remaining = p.total_frames.saturating_sub(current_frame);
            p.estimated_remaining_secs = if remaining == 0 {
                Some(0.0)
            } else if rolling > 0.0 {
                Some(remaining as f64 / rolling)
            } else {
                None
            };
            p.status = format!("rendering frame {current_frame}/{}", p.total_frames);
            p.clone()
        };
        self.hub.publish(self.run_id, &snap);
    }

    /// Final 100% update.
    pub fn complete(&mut self) {
        let snap = {
            let mut p = self.latest.lock();
            p.state = ExportState::Completed;
            p.current_frame = p.total_frames;
            p.fraction_complete = 1.0;
            p.estimated_remaining_secs = Some(0.0);
            p.elapsed_secs = self.started.elapsed().as_secs_f64();
            p.encoded_frames = self.encoded.load(Ordering::Relaxed);
            p.status = "completed".to_string();
            p.clone()
        };
        self.hub.publish(self.run_id, &snap);
    }
}

fn rate(frames: u64, secs: f64) -> f64 {
    if secs > 0.0 { frames as f64 / secs } else { 0.0 }
}

fn fraction(current: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (current as f64 / total as f64).min(1.0)
    }
}
