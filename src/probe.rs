//! Source video probing.
//!
//! The number of upscaling rounds depends on the source resolution, and the
//! decoder and encoder both need the source frame rate. [`SourceProbe`]
//! reads both by running `ffprobe` and parsing its JSON report. With the
//! `native-probe` feature the same information is read in-process through
//! `ffmpeg-next` instead.
//!
//! # Example
//!
//! ```no_run
//! use anime_upscaler::SourceProbe;
//!
//! let metadata = SourceProbe::probe("episode.mkv")?;
//! println!("{} @ {} fps", metadata.resolution, metadata.frame_rate);
//! # Ok::<(), anime_upscaler::UpscalerError>(())
//! ```

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use serde_json::Value;

use crate::config::{FrameRate, Resolution};
use crate::error::UpscalerError;

/// What the pipeline needs to know about the source video.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct SourceMetadata {
    /// Frame dimensions of the first video stream.
    pub resolution: Resolution,
    /// Frame rate of the first video stream.
    pub frame_rate: FrameRate,
    /// Container duration, if known.
    pub duration: Option<Duration>,
    /// Frame count, reported or estimated from duration and rate.
    pub frame_count: Option<u64>,
    /// Video codec name (e.g. `"h264"`).
    pub codec: String,
    /// Whether the container has at least one audio stream.
    pub has_audio: bool,
}

/// Probes source videos.
pub struct SourceProbe;

impl SourceProbe {
    /// Probe `path` with the `ffprobe` found on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::ProcessSpawn`] if `ffprobe` cannot be run
    /// and [`UpscalerError::Probe`] if it fails or reports no video stream.
    pub fn probe<P: AsRef<Path>>(path: P) -> Result<SourceMetadata, UpscalerError> {
        Self::probe_with("ffprobe", path)
    }

    /// Probe `path` with a specific `ffprobe` program.
    ///
    /// # Errors
    ///
    /// See [`SourceProbe::probe`].
    pub fn probe_with<P: AsRef<Path>>(program: &str, path: P) -> Result<SourceMetadata, UpscalerError> {
        let path = path.as_ref();
        log::debug!("Probing source video: {}", path.display());

        let output = Command::new(program)
            .args(["-v", "error", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| UpscalerError::ProcessSpawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpscalerError::Probe(format!(
                "{program} failed on {} ({}): {}",
                path.display(),
                output.status,
                stderr.trim()
            )));
        }

        let report = String::from_utf8_lossy(&output.stdout);
        Self::parse_report(&report)
    }

    /// Probe `path` with the backend this build prefers: in-process when the
    /// `native-probe` feature is enabled, otherwise by running `program`.
    ///
    /// # Errors
    ///
    /// See [`SourceProbe::probe`].
    pub fn probe_preferred<P: AsRef<Path>>(program: &str, path: P) -> Result<SourceMetadata, UpscalerError> {
        #[cfg(feature = "native-probe")]
        let metadata = {
            let _ = program;
            Self::probe_native(path)
        };
        #[cfg(not(feature = "native-probe"))]
        let metadata = Self::probe_with(program, path);
        metadata
    }

    /// Parse an `ffprobe -print_format json -show_streams -show_format`
    /// report.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::Probe`] for malformed JSON, a missing video
    /// stream, or unusable dimensions or frame rate.
    pub fn parse_report(report: &str) -> Result<SourceMetadata, UpscalerError> {
        let root: Value = serde_json::from_str(report)
            .map_err(|error| UpscalerError::Probe(format!("malformed ffprobe output: {error}")))?;

        let streams = root
            .get("streams")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let video = streams
            .iter()
            .find(|stream| stream.get("codec_type").and_then(Value::as_str) == Some("video"))
            .ok_or_else(|| UpscalerError::Probe("no video stream found".to_string()))?;

        let has_audio = streams
            .iter()
            .any(|stream| stream.get("codec_type").and_then(Value::as_str) == Some("audio"));

        let dimension = |key: &str| {
            video
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(0)
        };
        let resolution = Resolution::new(dimension("width"), dimension("height"));
        if !resolution.is_valid() {
            return Err(UpscalerError::Probe(format!(
                "video stream has unusable dimensions {resolution}"
            )));
        }

        let frame_rate = ["avg_frame_rate", "r_frame_rate"]
            .iter()
            .filter_map(|key| video.get(*key).and_then(Value::as_str))
            .filter_map(|value| value.parse::<FrameRate>().ok())
            .find(|rate| rate.is_valid())
            .ok_or_else(|| UpscalerError::Probe("video stream has no usable frame rate".to_string()))?;

        let seconds = |value: Option<&Value>| {
            value
                .and_then(Value::as_str)
                .and_then(|text| text.parse::<f64>().ok())
                .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
                .map(Duration::from_secs_f64)
        };
        let duration = seconds(root.get("format").and_then(|format| format.get("duration")))
            .or_else(|| seconds(video.get("duration")));

        let frame_count = video
            .get("nb_frames")
            .and_then(Value::as_str)
            .and_then(|text| text.parse::<u64>().ok())
            .filter(|&count| count > 0)
            .or_else(|| duration.map(|duration| (duration.as_secs_f64() * frame_rate.as_f64()) as u64));

        let codec = video
            .get("codec_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        Ok(SourceMetadata {
            resolution,
            frame_rate,
            duration,
            frame_count,
            codec,
            has_audio,
        })
    }

    /// Probe `path` in-process with `ffmpeg-next`.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::Probe`] if the file cannot be opened or has
    /// no decodable video stream.
    #[cfg(feature = "native-probe")]
    pub fn probe_native<P: AsRef<Path>>(path: P) -> Result<SourceMetadata, UpscalerError> {
        use ffmpeg_next::codec::context::Context as CodecContext;
        use ffmpeg_next::media::Type;

        let path = path.as_ref();
        let failed = |error: ffmpeg_next::Error| {
            UpscalerError::Probe(format!("{}: {error}", path.display()))
        };

        ffmpeg_next::init().map_err(failed)?;
        let input_context = ffmpeg_next::format::input(&path).map_err(failed)?;

        let stream = input_context
            .streams()
            .best(Type::Video)
            .ok_or_else(|| UpscalerError::Probe("no video stream found".to_string()))?;
        let has_audio = input_context.streams().best(Type::Audio).is_some();

        let decoder = CodecContext::from_parameters(stream.parameters())
            .and_then(|context| context.decoder().video())
            .map_err(failed)?;
        let resolution = Resolution::new(decoder.width(), decoder.height());

        let rational = stream.avg_frame_rate();
        let rational = if rational.numerator() > 0 && rational.denominator() > 0 {
            rational
        } else {
            stream.rate()
        };
        let frame_rate = FrameRate::new(
            u32::try_from(rational.numerator()).unwrap_or(0),
            u32::try_from(rational.denominator()).unwrap_or(1),
        );
        if !resolution.is_valid() || !frame_rate.is_valid() {
            return Err(UpscalerError::Probe(format!(
                "video stream reports {resolution} at {frame_rate} fps"
            )));
        }

        let duration_microseconds = input_context.duration();
        let duration = (duration_microseconds > 0)
            .then(|| Duration::from_micros(duration_microseconds as u64));
        let frame_count = (stream.frames() > 0)
            .then(|| stream.frames() as u64)
            .or_else(|| duration.map(|duration| (duration.as_secs_f64() * frame_rate.as_f64()) as u64));

        let codec = decoder
            .codec()
            .map(|codec| codec.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(SourceMetadata {
            resolution,
            frame_rate,
            duration,
            frame_count,
            codec,
            has_audio,
        })
    }
}
