//! Error types for the `anime-upscaler` crate.
//!
//! [`UpscalerError`] is the unified error returned by every fallible
//! pipeline operation. Stream framing problems have their own
//! [`FramingError`](crate::FramingError), which the pipeline recovers from
//! locally while filling a batch and wraps here everywhere else.

use std::{io::Error as IoError, path::PathBuf, process::ExitStatus};

use thiserror::Error;

use crate::framing::FramingError;
use crate::process::ProcessRole;

/// The unified error type for all pipeline operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpscalerError {
    /// A frame stream was not well framed.
    #[error("Frame stream error: {0}")]
    Framing(#[from] FramingError),

    /// An I/O error on a pipe or file not covered by a more specific variant.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// A temporary file or directory could not be created, written or read.
    #[error("Temporary file error at {path}: {source}")]
    TempFile {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        source: IoError,
    },

    /// A child process could not be started.
    #[error("Failed to start {program}: {source}")]
    ProcessSpawn {
        /// Program that was being executed.
        program: String,
        /// Underlying error.
        source: IoError,
    },

    /// A child process exited abnormally while no shutdown was in progress.
    #[error("The {role} process exited abnormally ({status})")]
    ProcessCrash {
        /// Which collaborator crashed.
        role: ProcessRole,
        /// Its exit status.
        status: ExitStatus,
    },

    /// Every entry of the process table is in use.
    #[error("Too many supervised processes (limit {limit})")]
    ProcessTableFull {
        /// Table capacity.
        limit: usize,
    },

    /// The upscaler did not leave a valid image at a slot's output path.
    #[error("Upscaler output {path} is unusable: {reason}")]
    UpscaledOutput {
        /// The slot's output path.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The source video could not be probed.
    #[error("Failed to probe source video: {0}")]
    Probe(String),

    /// The interrupt handler could not be installed.
    #[error("Failed to install interrupt handler: {0}")]
    InterruptHandler(String),

    /// The pipeline configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl UpscalerError {
    /// Process exit status for this error.
    ///
    /// Uses the underlying OS error code when there is one, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        let os_code = match self {
            UpscalerError::Io(error)
            | UpscalerError::TempFile { source: error, .. }
            | UpscalerError::ProcessSpawn { source: error, .. } => error.raw_os_error(),
            UpscalerError::Framing(FramingError::Io(error)) => error.raw_os_error(),
            UpscalerError::ProcessCrash { status, .. } => status.code(),
            _ => None,
        };
        match os_code {
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }
}
