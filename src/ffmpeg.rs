//! ffmpeg collaborator invocations.
//!
//! The decoder and encoder are plain `ffmpeg` processes talking PNG over
//! pipes. This module builds their command lines and maps the crate's
//! [`FfmpegLogLevel`] onto ffmpeg's `-loglevel` option, so library users can
//! silence or tune ffmpeg's own console output independently of the Rust
//! side [`log`](https://crates.io/crates/log) messages.
//!
//! # Example
//!
//! ```
//! use anime_upscaler::FfmpegLogLevel;
//!
//! let level: FfmpegLogLevel = "warn".parse()?;
//! assert_eq!(level.as_arg(), "warning");
//! # Ok::<(), anime_upscaler::UpscalerError>(())
//! ```

use std::path::Path;
use std::str::FromStr;

use crate::config::{FrameRate, Resolution};
use crate::error::UpscalerError;
use crate::process::{CommandSpec, ProcessRole, Redirect};

/// ffmpeg console verbosity.
///
/// # Ordering (most verbose → most quiet)
///
/// `Trace` > `Debug` > `Verbose` > `Info` > `Warning` > `Error` > `Fatal` > `Panic` > `Quiet`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FfmpegLogLevel {
    /// Print no output at all.
    Quiet,
    /// Only log conditions that abort the process.
    Panic,
    /// Only log unrecoverable errors.
    Fatal,
    /// Log recoverable errors. This is the default for pipeline runs.
    #[default]
    Error,
    /// Log warnings.
    Warning,
    /// Log informational messages.
    Info,
    /// Log verbose informational messages.
    Verbose,
    /// Log debugging messages.
    Debug,
    /// Extremely verbose tracing output.
    Trace,
}

impl FfmpegLogLevel {
    /// The value passed to `-loglevel`.
    pub fn as_arg(self) -> &'static str {
        match self {
            FfmpegLogLevel::Quiet => "quiet",
            FfmpegLogLevel::Panic => "panic",
            FfmpegLogLevel::Fatal => "fatal",
            FfmpegLogLevel::Error => "error",
            FfmpegLogLevel::Warning => "warning",
            FfmpegLogLevel::Info => "info",
            FfmpegLogLevel::Verbose => "verbose",
            FfmpegLogLevel::Debug => "debug",
            FfmpegLogLevel::Trace => "trace",
        }
    }
}

impl FromStr for FfmpegLogLevel {
    type Err = UpscalerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "quiet" => Ok(FfmpegLogLevel::Quiet),
            "panic" => Ok(FfmpegLogLevel::Panic),
            "fatal" => Ok(FfmpegLogLevel::Fatal),
            "error" => Ok(FfmpegLogLevel::Error),
            "warning" | "warn" => Ok(FfmpegLogLevel::Warning),
            "info" => Ok(FfmpegLogLevel::Info),
            "verbose" => Ok(FfmpegLogLevel::Verbose),
            "debug" => Ok(FfmpegLogLevel::Debug),
            "trace" => Ok(FfmpegLogLevel::Trace),
            _ => Err(UpscalerError::InvalidConfiguration(format!(
                "unsupported ffmpeg log level: {value}"
            ))),
        }
    }
}

/// Decoder: emit every frame of `source` at `frame_rate` as PNG on stdout.
///
/// stdin comes from the null device so ffmpeg never waits for keyboard
/// input.
pub fn decoder_command(
    program: &str,
    level: FfmpegLogLevel,
    source: &Path,
    frame_rate: FrameRate,
) -> CommandSpec {
    CommandSpec::new(ProcessRole::Decoder, program)
        .args(["-nostdin", "-hide_banner", "-loglevel", level.as_arg(), "-i"])
        .arg(source)
        .arg("-vf")
        .arg(format!("fps={frame_rate}"))
        .args(["-f", "image2pipe", "-vcodec", "png", "-"])
        .stdin(Redirect::Null)
        .stdout(Redirect::Piped)
        .stderr(Redirect::Inherit)
}

/// Encoder: read PNG frames on stdin, scale to `target`, and mux them with
/// the audio of `source` into `output`.
pub fn encoder_command(
    program: &str,
    level: FfmpegLogLevel,
    source: &Path,
    frame_rate: FrameRate,
    target: Resolution,
    output: &Path,
) -> CommandSpec {
    CommandSpec::new(ProcessRole::Encoder, program)
        .args(["-y", "-hide_banner", "-loglevel", level.as_arg()])
        .args(["-f", "image2pipe", "-framerate"])
        .arg(frame_rate.to_string())
        .args(["-vcodec", "png", "-i", "-", "-i"])
        .arg(source)
        .args(["-map", "0:v:0", "-map", "1:a?", "-c:a", "copy"])
        .arg("-vf")
        .arg(format!("scale={}:{}", target.width, target.height))
        .args(["-pix_fmt", "yuv420p"])
        .arg(output)
        .stdin(Redirect::Piped)
        .stdout(Redirect::Null)
        .stderr(Redirect::Inherit)
}
