//! Pipeline configuration.
//!
//! [`PipelineConfig`] is a builder that collects everything a run needs:
//! input and output paths, batch size, resolutions, the external programs
//! to invoke, and an optional progress callback.
//!
//! # Example
//!
//! ```no_run
//! use anime_upscaler::{PipelineConfig, Resolution};
//!
//! let config = PipelineConfig::new("episode.mkv", "episode_4k.mkv")
//!     .with_target_resolution(Resolution::new(3840, 2160))
//!     .with_batch_size(32);
//! ```

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::UpscalerError;
use crate::ffmpeg::FfmpegLogLevel;
use crate::progress::{NoOpProgress, ProgressCallback};
use crate::upscaler::UpscalerCommand;

/// Default number of frames per batch.
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a resolution.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// This resolution scaled by `2^rounds` in both dimensions, saturating.
    pub fn doubled(self, rounds: u32) -> Self {
        let factor = 1_u64 << rounds.min(32);
        let scale = |value: u32| (value as u64 * factor).min(u32::MAX as u64) as u32;
        Self::new(scale(self.width), scale(self.height))
    }

    /// Returns `true` if neither dimension is zero.
    pub fn is_valid(self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = UpscalerError;

    /// Parse `"WIDTHxHEIGHT"` (also accepts `X` and `:` as separators).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || UpscalerError::InvalidConfiguration(format!("invalid resolution: {value}"));
        let (width, height) = value
            .trim()
            .split_once(['x', 'X', ':'])
            .ok_or_else(invalid)?;
        let width = width.trim().parse::<u32>().map_err(|_| invalid())?;
        let height = height.trim().parse::<u32>().map_err(|_| invalid())?;
        let resolution = Self::new(width, height);
        if !resolution.is_valid() {
            return Err(invalid());
        }
        Ok(resolution)
    }
}

/// A frame rate as an exact fraction, e.g. `24000/1001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRate {
    /// Frames.
    pub numerator: u32,
    /// Per this many seconds.
    pub denominator: u32,
}

impl FrameRate {
    /// Create a frame rate. A zero denominator is treated as `1`.
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator: if denominator == 0 { 1 } else { denominator },
        }
    }

    /// Frames per second as a float.
    pub fn as_f64(self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Returns `true` for a positive rate.
    pub fn is_valid(self) -> bool {
        self.numerator > 0
    }
}

impl Display for FrameRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

impl FromStr for FrameRate {
    type Err = UpscalerError;

    /// Parse `"30"`, `"29.97"` or `"30000/1001"`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || UpscalerError::InvalidConfiguration(format!("invalid frame rate: {value}"));
        let trimmed = value.trim();

        let rate = if let Some((numerator, denominator)) = trimmed.split_once('/') {
            let numerator = numerator.trim().parse::<u32>().map_err(|_| invalid())?;
            let denominator = denominator.trim().parse::<u32>().map_err(|_| invalid())?;
            if denominator == 0 {
                return Err(invalid());
            }
            FrameRate::new(numerator, denominator)
        } else if let Ok(whole) = trimmed.parse::<u32>() {
            FrameRate::new(whole, 1)
        } else {
            let fractional = trimmed.parse::<f64>().map_err(|_| invalid())?;
            if !fractional.is_finite() || fractional <= 0.0 || fractional > u32::MAX as f64 / 1000.0 {
                return Err(invalid());
            }
            FrameRate::new((fractional * 1000.0).round() as u32, 1000)
        };

        if !rate.is_valid() {
            return Err(invalid());
        }
        Ok(rate)
    }
}

/// Scratch directory used when none is configured.
///
/// Prefers the RAM-backed `/dev/shm` where it exists, since every frame is
/// written and read back once per round.
pub fn default_scratch_directory() -> PathBuf {
    let shared_memory = Path::new("/dev/shm");
    if shared_memory.is_dir() {
        shared_memory.join("anime-upscaler")
    } else {
        std::env::temp_dir().join("anime-upscaler")
    }
}

/// Configuration for one pipeline run.
#[derive(Clone)]
pub struct PipelineConfig {
    pub(crate) input: PathBuf,
    pub(crate) output: PathBuf,
    pub(crate) batch_size: usize,
    pub(crate) target_resolution: Option<Resolution>,
    pub(crate) source_resolution: Option<Resolution>,
    pub(crate) frame_rate: Option<FrameRate>,
    pub(crate) scratch_directory: PathBuf,
    pub(crate) upscaler: UpscalerCommand,
    pub(crate) ffmpeg_program: String,
    pub(crate) ffprobe_program: String,
    pub(crate) ffmpeg_log_level: FfmpegLogLevel,
    pub(crate) progress: Arc<dyn ProgressCallback>,
}

impl Debug for PipelineConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("PipelineConfig")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("batch_size", &self.batch_size)
            .field("target_resolution", &self.target_resolution)
            .field("source_resolution", &self.source_resolution)
            .field("frame_rate", &self.frame_rate)
            .field("scratch_directory", &self.scratch_directory)
            .field("upscaler", &self.upscaler)
            .field("ffmpeg_log_level", &self.ffmpeg_log_level)
            .finish()
    }
}

impl PipelineConfig {
    /// Configuration with defaults for upscaling `input` into `output`.
    ///
    /// Defaults: batch size 16, target twice the source resolution, source
    /// resolution and frame rate probed, `ffmpeg`/`ffprobe` from `PATH`,
    /// the default [`UpscalerCommand`], no progress callback.
    pub fn new<P1: AsRef<Path>, P2: AsRef<Path>>(input: P1, output: P2) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            batch_size: DEFAULT_BATCH_SIZE,
            target_resolution: None,
            source_resolution: None,
            frame_rate: None,
            scratch_directory: default_scratch_directory(),
            upscaler: UpscalerCommand::default(),
            ffmpeg_program: "ffmpeg".to_string(),
            ffprobe_program: "ffprobe".to_string(),
            ffmpeg_log_level: FfmpegLogLevel::Error,
            progress: Arc::new(NoOpProgress),
        }
    }

    /// Number of frames processed together. Clamped to a minimum of 1.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Resolution of the output video.
    #[must_use]
    pub fn with_target_resolution(mut self, resolution: Resolution) -> Self {
        self.target_resolution = Some(resolution);
        self
    }

    /// Use this source resolution instead of probing the input.
    #[must_use]
    pub fn with_source_resolution(mut self, resolution: Resolution) -> Self {
        self.source_resolution = Some(resolution);
        self
    }

    /// Frame rate frames are extracted and encoded at. Defaults to the
    /// source's rate.
    #[must_use]
    pub fn with_frame_rate(mut self, rate: FrameRate) -> Self {
        self.frame_rate = Some(rate);
        self
    }

    /// Directory temporary frame files are created under.
    #[must_use]
    pub fn with_scratch_directory<P: AsRef<Path>>(mut self, directory: P) -> Self {
        self.scratch_directory = directory.as_ref().to_path_buf();
        self
    }

    /// External upscaler invocation.
    #[must_use]
    pub fn with_upscaler(mut self, command: UpscalerCommand) -> Self {
        self.upscaler = command;
        self
    }

    /// Program used for decoding and encoding.
    #[must_use]
    pub fn with_ffmpeg_program<S: Into<String>>(mut self, program: S) -> Self {
        self.ffmpeg_program = program.into();
        self
    }

    /// Program used for probing the source.
    #[must_use]
    pub fn with_ffprobe_program<S: Into<String>>(mut self, program: S) -> Self {
        self.ffprobe_program = program.into();
        self
    }

    /// Verbosity passed to the ffmpeg processes.
    #[must_use]
    pub fn with_ffmpeg_log_level(mut self, level: FfmpegLogLevel) -> Self {
        self.ffmpeg_log_level = level;
        self
    }

    /// Attach a progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Source video path.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Output video path.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Frames per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Configured target resolution, if any.
    pub fn target_resolution(&self) -> Option<Resolution> {
        self.target_resolution
    }

    /// Configured source resolution, if any.
    pub fn source_resolution(&self) -> Option<Resolution> {
        self.source_resolution
    }

    /// Configured frame rate, if any.
    pub fn frame_rate(&self) -> Option<FrameRate> {
        self.frame_rate
    }

    /// Scratch directory.
    pub fn scratch_directory(&self) -> &Path {
        &self.scratch_directory
    }

    /// Upscaler invocation.
    pub fn upscaler(&self) -> &UpscalerCommand {
        &self.upscaler
    }

    /// ffmpeg program.
    pub fn ffmpeg_program(&self) -> &str {
        &self.ffmpeg_program
    }

    /// ffprobe program.
    pub fn ffprobe_program(&self) -> &str {
        &self.ffprobe_program
    }

    /// ffmpeg verbosity.
    pub fn ffmpeg_log_level(&self) -> FfmpegLogLevel {
        self.ffmpeg_log_level
    }
}
