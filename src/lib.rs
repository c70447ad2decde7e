//! # anime-upscaler
//!
//! Upscale a video by streaming its frames through an external image
//! upscaler such as `waifu2x-converter-cpp`.
//!
//! `anime-upscaler` drives three processes at once: an `ffmpeg` decoder that
//! writes PNG frames to a pipe, the upscaler, which works on files, and an
//! `ffmpeg` encoder that reads PNG frames from a pipe and muxes them with
//! the source audio. Frames are processed in batches; each batch goes
//! through as many doubling rounds as the target resolution needs.
//!
//! ## Quick Start
//!
//! ```no_run
//! use anime_upscaler::{Pipeline, PipelineConfig, Resolution, install_interrupt_handler};
//!
//! let config = PipelineConfig::new("episode.mkv", "episode_1440p.mkv")
//!     .with_target_resolution(Resolution::new(2560, 1440))
//!     .with_batch_size(32);
//!
//! let pipeline = Pipeline::new(config);
//! install_interrupt_handler(pipeline.session())?;
//! let outcome = pipeline.run()?;
//! println!("{} frame(s) upscaled", outcome.frames_written);
//! # Ok::<(), anime_upscaler::UpscalerError>(())
//! ```
//!
//! ## Reading framed images
//!
//! ```
//! use anime_upscaler::{GrowableBuffer, ImageStreamReader, ReadStatus};
//!
//! let mut reader = ImageStreamReader::new(&b""[..]);
//! let mut buffer = GrowableBuffer::new();
//! assert_eq!(reader.read_one(&mut buffer)?, ReadStatus::EndOfStream);
//! # Ok::<(), anime_upscaler::FramingError>(())
//! ```
//!
//! ## Features
//!
//! - **Streaming frame framing**: PNG images are located in a pipe by their
//!   chunk structure, without decoding them
//! - **Batch orchestration**: a fixed pool of buffer and temporary file
//!   slots, reused for every batch
//! - **Pluggable upscaler**: anything implementing [`Upscaler`]; the
//!   external-command implementation is [`ExternalUpscaler`]
//! - **Graceful cancellation**: `Ctrl-C` interrupts every child process
//!   once and removes every temporary file
//! - **Source probing**: resolution, frame rate and duration via `ffprobe`
//! - **Progress and validation**: [`ProgressCallback`] and
//!   [`PipelineConfig::validate`]
//!
//! ### Optional Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `native-probe` | Probe the source in-process with `ffmpeg-next` instead of running `ffprobe` |
//!
//! ## Requirements
//!
//! `ffmpeg` and `ffprobe` must be on `PATH` (or configured explicitly), as
//! must the upscaler program.

pub mod buffer;
pub mod cancel;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod framing;
pub mod pipeline;
pub mod pool;
pub mod probe;
pub mod process;
pub mod progress;
pub mod slot;
pub mod upscaler;
pub mod validation;

pub use buffer::GrowableBuffer;
pub use cancel::{Session, install_interrupt_handler};
pub use config::{FrameRate, PipelineConfig, Resolution, default_scratch_directory};
pub use error::UpscalerError;
pub use ffmpeg::FfmpegLogLevel;
pub use framing::{FramingError, ImageStreamReader, PNG_SIGNATURE, ReadStatus, read_one};
pub use pipeline::{BatchRunner, Pipeline, PipelineState, RunOutcome, RunPlan, round_count};
pub use pool::{FrameSlot, FrameSlotPool};
pub use probe::{SourceMetadata, SourceProbe};
pub use process::{CommandSpec, ProcessRole, ProcessSupervisor, ProcessTable, Redirect, SupervisedChild};
pub use progress::{ProgressCallback, ProgressInfo};
pub use slot::{OutputPathTemplate, TempFileSlot};
pub use upscaler::{ExternalUpscaler, RoundJob, SlotPaths, UpscaleMode, Upscaler, UpscalerCommand, UpscalerOutput};
pub use validation::ValidationReport;
