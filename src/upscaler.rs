//! Upscaler strategy.
//!
//! The pipeline only knows the slot contract: for one round it hands an
//! [`Upscaler`] a list of input files and the output path expected for each,
//! and after the call every output path must hold one PNG image. The
//! shipped implementation, [`ExternalUpscaler`], runs a command-line tool
//! once per round and feeds it the input paths on stdin. Anything else that
//! honours the same contract (for instance an in-process model) can be
//! plugged in without touching the pipeline.

use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crate::cancel::Session;
use crate::error::UpscalerError;
use crate::pool::FrameSlotPool;
use crate::process::{CommandSpec, ProcessRole, Redirect};

/// What a round asks of the upscaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpscaleMode {
    /// Remove compression noise and double the resolution.
    DenoiseAndScale,
    /// Double the resolution only.
    ScaleOnly,
}

impl UpscaleMode {
    /// Mode used for 1-based round `round`: denoise only once, on the
    /// source-resolution frames.
    pub fn for_round(round: u32) -> Self {
        if round <= 1 {
            UpscaleMode::DenoiseAndScale
        } else {
            UpscaleMode::ScaleOnly
        }
    }
}

/// Input and output path of one slot for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPaths<'a> {
    /// File holding the current image.
    pub input: &'a Path,
    /// File the upscaled image must be written to.
    pub output: &'a Path,
}

/// One upscaling round over the filled slots of a batch.
#[derive(Debug, Clone)]
pub struct RoundJob<'a> {
    /// 1-based round number.
    pub round: u32,
    /// Number of rounds this batch goes through.
    pub total_rounds: u32,
    /// Mode for this round.
    pub mode: UpscaleMode,
    /// Slots in index order.
    pub slots: Vec<SlotPaths<'a>>,
}

impl<'a> RoundJob<'a> {
    /// Build the job for the first `filled` slots of `pool`.
    pub fn new(round: u32, total_rounds: u32, pool: &'a FrameSlotPool, filled: usize) -> Self {
        let slots = pool
            .filled(filled)
            .map(|slot| SlotPaths {
                input: slot.files.backing_path(),
                output: slot.files.output_path(),
            })
            .collect();
        Self {
            round,
            total_rounds,
            mode: UpscaleMode::for_round(round),
            slots,
        }
    }
}

/// Turns every input file of a round into an upscaled output file.
pub trait Upscaler {
    /// Process one round.
    ///
    /// Implementations should return promptly once `session` reports a
    /// stop; the pipeline does not read the outputs of an interrupted round.
    ///
    /// # Errors
    ///
    /// Any error aborts the pipeline.
    fn upscale(&mut self, job: &RoundJob<'_>, session: &Session) -> Result<(), UpscalerError>;
}

/// What happens to the upscaler's stdout and stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpscalerOutput {
    /// Discard it.
    #[default]
    Mute,
    /// Pass it through to our own streams.
    Inherit,
    /// Forward each stderr line to the `log` crate at debug level.
    Log,
}

/// Command line of an external upscaler.
///
/// The program receives one absolute input path per line on stdin and must
/// write each result to `<input>_output.png`. Mode-specific arguments are
/// appended after the common ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscalerCommand {
    program: String,
    args: Vec<String>,
    denoise_args: Vec<String>,
    scale_args: Vec<String>,
    working_directory: Option<PathBuf>,
    output: UpscalerOutput,
}

impl Default for UpscalerCommand {
    /// `waifu2x-converter-cpp` doubling per round, noise level 1 on the
    /// first round.
    fn default() -> Self {
        Self::new("waifu2x-converter-cpp")
            .with_args(["--scale-ratio", "2"])
            .with_noise_level(1)
            .with_scale_args(["-m", "scale"])
    }
}

impl UpscalerCommand {
    /// Invoke `program` with no arguments.
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            denoise_args: Vec::new(),
            scale_args: Vec::new(),
            working_directory: None,
            output: UpscalerOutput::Mute,
        }
    }

    /// Arguments passed on every round.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Extra arguments for [`UpscaleMode::DenoiseAndScale`] rounds.
    #[must_use]
    pub fn with_denoise_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denoise_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Extra arguments for [`UpscaleMode::ScaleOnly`] rounds.
    #[must_use]
    pub fn with_scale_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scale_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Use waifu2x-style `noise-scale` arguments with `level` for the first
    /// round.
    #[must_use]
    pub fn with_noise_level(self, level: u8) -> Self {
        self.with_denoise_args([
            "-m".to_string(),
            "noise-scale".to_string(),
            "--noise-level".to_string(),
            level.to_string(),
        ])
    }

    /// Run the upscaler in `directory`.
    #[must_use]
    pub fn with_working_directory<P: AsRef<Path>>(mut self, directory: P) -> Self {
        self.working_directory = Some(directory.as_ref().to_path_buf());
        self
    }

    /// Choose what happens to the upscaler's console output.
    #[must_use]
    pub fn with_output(mut self, output: UpscalerOutput) -> Self {
        self.output = output;
        self
    }

    /// Program name or path.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument list for `mode`.
    pub fn arguments(&self, mode: UpscaleMode) -> Vec<&str> {
        let extra = match mode {
            UpscaleMode::DenoiseAndScale => &self.denoise_args,
            UpscaleMode::ScaleOnly => &self.scale_args,
        };
        self.args.iter().chain(extra).map(String::as_str).collect()
    }

    fn to_spec(&self, mode: UpscaleMode) -> CommandSpec {
        let (stdout, stderr) = match self.output {
            UpscalerOutput::Mute => (Redirect::Null, Redirect::Null),
            UpscalerOutput::Inherit => (Redirect::Inherit, Redirect::Inherit),
            UpscalerOutput::Log => (Redirect::Null, Redirect::Piped),
        };
        let mut spec = CommandSpec::new(ProcessRole::Upscaler, &self.program)
            .args(self.arguments(mode))
            .stdin(Redirect::Piped)
            .stdout(stdout)
            .stderr(stderr);
        if let Some(directory) = &self.working_directory {
            spec = spec.working_directory(directory);
        }
        spec
    }
}

/// Runs an [`UpscalerCommand`] once per round.
#[derive(Debug, Clone)]
pub struct ExternalUpscaler {
    command: UpscalerCommand,
}

impl ExternalUpscaler {
    /// Wrap a command.
    pub fn new(command: UpscalerCommand) -> Self {
        Self { command }
    }

    /// The wrapped command.
    pub fn command(&self) -> &UpscalerCommand {
        &self.command
    }
}

impl Upscaler for ExternalUpscaler {
    fn upscale(&mut self, job: &RoundJob<'_>, session: &Session) -> Result<(), UpscalerError> {
        log::debug!(
            "Upscaling round {}/{} ({:?}) over {} frame(s)",
            job.round,
            job.total_rounds,
            job.mode,
            job.slots.len()
        );

        let mut child = session.supervisor().spawn(&self.command.to_spec(job.mode))?;
        if session.should_stop() {
            // The broadcast may have run before the child was registered.
            child.interrupt();
        }

        let forwarder = child.take_stderr().map(forward_lines);

        let written = match child.take_stdin() {
            Some(mut stdin) => write_path_list(&mut stdin, job),
            None => Ok(()),
        };

        let status = child.wait()?;
        if let Some(forwarder) = forwarder {
            let _ = forwarder.join();
        }

        if session.should_stop() {
            return Ok(());
        }
        if !status.success() {
            return Err(UpscalerError::ProcessCrash {
                role: ProcessRole::Upscaler,
                status,
            });
        }
        written.map_err(UpscalerError::from)
    }
}

/// Write one input path per line, then close the pipe by dropping it.
fn write_path_list<W: Write>(out: &mut W, job: &RoundJob<'_>) -> std::io::Result<()> {
    for slot in &job.slots {
        out.write_all(slot.input.as_os_str().as_encoded_bytes())?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// Forward a child's output to the log, treating `\r` as a line break so
/// progress counters that redraw in place still come out line by line.
fn forward_lines<R: Read + Send + 'static>(stream: R) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut chunk = [0_u8; 4096];
        let mut line = Vec::new();
        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            for &byte in &chunk[..read] {
                if byte == b'\r' || byte == b'\n' {
                    emit_line(&line);
                    line.clear();
                } else {
                    line.push(byte);
                }
            }
        }
        emit_line(&line);
    })
}

fn emit_line(line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if !text.is_empty() {
        log::debug!(target: "anime_upscaler::upscaler", "{text}");
    }
}
