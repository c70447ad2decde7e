//! Progress reporting.
//!
//! This module provides [`ProgressCallback`] for monitoring a pipeline run
//! and [`ProgressInfo`] for progress snapshots. Reports are emitted after
//! every upscaling round and after every flushed batch.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anime_upscaler::{PipelineConfig, ProgressCallback, ProgressInfo};
//!
//! struct PrintProgress;
//!
//! impl ProgressCallback for PrintProgress {
//!     fn on_progress(&self, info: &ProgressInfo) {
//!         if let Some(pct) = info.percentage {
//!             println!("[{:?}] {pct:.1}% complete", info.state);
//!         }
//!     }
//! }
//!
//! let config = PipelineConfig::new("in.mkv", "out.mkv")
//!     .with_progress(Arc::new(PrintProgress));
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pipeline::PipelineState;

/// A snapshot of pipeline progress.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// The step that just completed.
    pub state: PipelineState,
    /// Frames written to the encoder so far.
    pub frames_written: u64,
    /// Estimated total frame count, if the source duration is known.
    pub total_frames: Option<u64>,
    /// Completion percentage (0.0 – 100.0), if `total_frames` is known.
    pub percentage: Option<f32>,
    /// 1-based number of the batch being processed.
    pub batch: u64,
    /// Frames in the current batch.
    pub batch_frames: usize,
    /// Rounds each batch goes through.
    pub total_rounds: u32,
    /// Wall-clock time since the run started.
    pub elapsed: Duration,
    /// Estimated time remaining, based on current throughput.
    pub estimated_remaining: Option<Duration>,
}

/// Receives progress updates during a pipeline run.
///
/// Callbacks are **infallible**: they observe but cannot halt the run. Use
/// [`Session::request_stop`](crate::Session::request_stop) to cancel.
pub trait ProgressCallback: Send + Sync {
    /// Called after each round and each flushed batch.
    fn on_progress(&self, info: &ProgressInfo);
}

/// Discards all progress notifications. The default.
pub(crate) struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _info: &ProgressInfo) {}
}

/// Tracks timing and emits callbacks.
pub(crate) struct ProgressTracker {
    callback: Arc<dyn ProgressCallback>,
    total_frames: Option<u64>,
    total_rounds: u32,
    frames_written: u64,
    batch: u64,
    batch_frames: usize,
    start_time: Instant,
}

impl ProgressTracker {
    pub(crate) fn new(
        callback: Arc<dyn ProgressCallback>,
        total_frames: Option<u64>,
        total_rounds: u32,
    ) -> Self {
        Self {
            callback,
            total_frames,
            total_rounds,
            frames_written: 0,
            batch: 0,
            batch_frames: 0,
            start_time: Instant::now(),
        }
    }

    /// A new batch of `frames` frames was filled.
    pub(crate) fn start_batch(&mut self, frames: usize) {
        self.batch += 1;
        self.batch_frames = frames;
    }

    /// One frame reached the encoder.
    pub(crate) fn frame_written(&mut self) {
        self.frames_written += 1;
    }

    pub(crate) fn report(&self, state: PipelineState) {
        let elapsed = self.start_time.elapsed();

        let percentage = self
            .total_frames
            .filter(|&total| total > 0)
            .map(|total| (self.frames_written as f32 / total as f32 * 100.0).min(100.0));

        let estimated_remaining = if self.frames_written > 0 {
            self.total_frames.map(|total| {
                let remaining = total.saturating_sub(self.frames_written);
                elapsed.mul_f64(remaining as f64 / self.frames_written as f64)
            })
        } else {
            None
        };

        let info = ProgressInfo {
            state,
            frames_written: self.frames_written,
            total_frames: self.total_frames,
            percentage,
            batch: self.batch,
            batch_frames: self.batch_frames,
            total_rounds: self.total_rounds,
            elapsed,
            estimated_remaining,
        };

        self.callback.on_progress(&info);
    }
}
