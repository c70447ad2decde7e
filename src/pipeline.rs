//! Batch orchestration.
//!
//! A run wires three collaborators together: an ffmpeg decoder writing PNG
//! frames to a pipe, an upscaler working on files, and an ffmpeg encoder
//! reading PNG frames from a pipe. Frames travel in batches through a
//! [`FrameSlotPool`]:
//!
//! ```text
//! Filling -> Upscaling(1) -> .. -> Upscaling(R) -> Flushing -> Filling -> ..
//! ```
//!
//! Every round doubles the resolution, and `R` is the smallest number of
//! rounds that reaches the target. The encoder scales the result down to
//! the exact target. Once a stop is requested the current step is abandoned
//! at the next slot boundary and the run tears down.
//!
//! [`BatchRunner`] is the state machine on its own, over any reader, writer
//! and [`Upscaler`]. [`Pipeline`] adds probing, the ffmpeg processes and
//! the temporary files around it.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::process::ExitStatus;
use std::sync::Arc;

use crate::cancel::Session;
use crate::config::{FrameRate, PipelineConfig, Resolution};
use crate::error::UpscalerError;
use crate::ffmpeg::{decoder_command, encoder_command};
use crate::framing::{self, FramingError, ReadStatus};
use crate::pool::FrameSlotPool;
use crate::probe::{SourceMetadata, SourceProbe};
use crate::process::{ProcessRole, SupervisedChild};
use crate::progress::{NoOpProgress, ProgressCallback, ProgressTracker};
use crate::upscaler::{ExternalUpscaler, RoundJob, Upscaler};

/// Upper bound for [`round_count`]; `2^32` is beyond any pixel dimension.
const MAX_ROUNDS: u32 = 32;

/// Number of doubling rounds needed to bring `source` up to `target`.
///
/// This is `max(1, ceil(log2(max(tw / sw, th / sh))))`: at least one round
/// always runs, even when the target is not larger than the source.
///
/// ```
/// use anime_upscaler::{Resolution, round_count};
///
/// let rounds = round_count(Resolution::new(640, 360), Resolution::new(2560, 1440));
/// assert_eq!(rounds, 2);
/// ```
pub fn round_count(source: Resolution, target: Resolution) -> u32 {
    if !source.is_valid() {
        return 1;
    }
    let mut rounds = 1;
    while rounds < MAX_ROUNDS {
        let scaled = source.doubled(rounds);
        if scaled.width >= target.width && scaled.height >= target.height {
            break;
        }
        rounds += 1;
    }
    rounds
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Reading decoded frames into the pool.
    Filling,
    /// Running 1-based upscaling round `round` over the batch.
    Upscaling {
        /// Current round.
        round: u32,
    },
    /// Writing the batch to the encoder.
    Flushing,
    /// A stop was observed; tearing down.
    Stopping,
    /// The decoder ran dry and every frame was written.
    Done,
}

impl Display for PipelineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            PipelineState::Filling => write!(f, "filling"),
            PipelineState::Upscaling { round } => write!(f, "upscaling (round {round})"),
            PipelineState::Flushing => write!(f, "flushing"),
            PipelineState::Stopping => write!(f, "stopping"),
            PipelineState::Done => write!(f, "done"),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct RunOutcome {
    /// Frames written to the encoder.
    pub frames_written: u64,
    /// Batches that were filled.
    pub batches: u64,
    /// Rounds each batch went through.
    pub rounds: u32,
    /// Whether the run ended because a stop was requested.
    pub stopped: bool,
    /// Whether reading ended at a malformed frame instead of a clean end of
    /// stream.
    pub malformed_input: bool,
}

/// Resolved parameters of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// Source frame size.
    pub source: Resolution,
    /// Output frame size.
    pub target: Resolution,
    /// Extraction and encoding frame rate.
    pub frame_rate: FrameRate,
    /// Upscaling rounds per batch.
    pub rounds: u32,
    /// Expected number of frames, if known.
    pub total_frames: Option<u64>,
}

impl RunPlan {
    /// Resolve a plan from a configuration and, where the configuration is
    /// silent, the probed source metadata.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::InvalidConfiguration`] if the source
    /// resolution or frame rate is neither configured nor probed.
    pub fn resolve(config: &PipelineConfig, metadata: Option<&SourceMetadata>) -> Result<Self, UpscalerError> {
        let source = config
            .source_resolution
            .or_else(|| metadata.map(|metadata| metadata.resolution))
            .ok_or_else(|| UpscalerError::InvalidConfiguration("unknown source resolution".to_string()))?;
        let frame_rate = config
            .frame_rate
            .or_else(|| metadata.map(|metadata| metadata.frame_rate))
            .ok_or_else(|| UpscalerError::InvalidConfiguration("unknown frame rate".to_string()))?;
        let target = config.target_resolution.unwrap_or_else(|| source.doubled(1));

        let total_frames = metadata.and_then(|metadata| match (config.frame_rate, metadata.duration) {
            (Some(rate), Some(duration)) => Some((duration.as_secs_f64() * rate.as_f64()) as u64),
            _ => metadata.frame_count,
        });

        Ok(Self {
            source,
            target,
            frame_rate,
            rounds: round_count(source, target),
            total_frames,
        })
    }
}

/// The batch state machine over an arbitrary frame source and sink.
///
/// # Example
///
/// ```no_run
/// use std::io;
///
/// use anime_upscaler::{
///     BatchRunner, ExternalUpscaler, FrameSlotPool, Session, UpscalerCommand,
/// };
///
/// let session = Session::new();
/// let mut pool = FrameSlotPool::create(8, "/tmp/scratch")?;
/// let mut upscaler = ExternalUpscaler::new(UpscalerCommand::default());
///
/// let outcome = BatchRunner::new(&session, &mut pool, &mut upscaler, 1)
///     .run(io::stdin().lock(), io::stdout().lock())?;
/// eprintln!("{} frame(s)", outcome.frames_written);
/// # Ok::<(), anime_upscaler::UpscalerError>(())
/// ```
pub struct BatchRunner<'a, U: Upscaler + ?Sized> {
    session: &'a Session,
    pool: &'a mut FrameSlotPool,
    upscaler: &'a mut U,
    rounds: u32,
    progress: ProgressTracker,
    outcome: RunOutcome,
}

impl<'a, U: Upscaler + ?Sized> BatchRunner<'a, U> {
    /// Run `rounds` rounds (at least 1) per batch of `pool.len()` frames.
    pub fn new(session: &'a Session, pool: &'a mut FrameSlotPool, upscaler: &'a mut U, rounds: u32) -> Self {
        let rounds = rounds.max(1);
        Self {
            session,
            pool,
            upscaler,
            rounds,
            progress: ProgressTracker::new(Arc::new(NoOpProgress), None, rounds),
            outcome: RunOutcome {
                rounds,
                ..RunOutcome::default()
            },
        }
    }

    /// Report progress to `callback`, expecting `total_frames` frames.
    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>, total_frames: Option<u64>) -> Self {
        self.progress = ProgressTracker::new(callback, total_frames, self.rounds);
        self
    }

    /// Move every frame of `source` through the upscaler into `sink`.
    ///
    /// Returns when `source` is exhausted or a stop was observed. `source`
    /// and `sink` are dropped before returning, which closes the pipes they
    /// wrap.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error. Framing errors are not fatal: they end
    /// the input at the last complete frame.
    pub fn run<R: Read, W: Write>(mut self, mut source: R, mut sink: W) -> Result<RunOutcome, UpscalerError> {
        let mut state = PipelineState::Filling;
        let mut filled = 0;
        let mut source_exhausted = false;

        loop {
            if self.session.should_stop() && state != PipelineState::Done {
                state = PipelineState::Stopping;
            }

            state = match state {
                PipelineState::Filling => {
                    if source_exhausted {
                        PipelineState::Done
                    } else {
                        filled = self.fill(&mut source, &mut source_exhausted)?;
                        if filled == 0 {
                            PipelineState::Done
                        } else {
                            self.outcome.batches += 1;
                            self.progress.start_batch(filled);
                            log::debug!("Batch {} holds {filled} frame(s)", self.outcome.batches);
                            PipelineState::Upscaling { round: 1 }
                        }
                    }
                }
                PipelineState::Upscaling { round } => {
                    self.upscale_round(round, filled)?;
                    if self.session.should_stop() {
                        PipelineState::Stopping
                    } else {
                        self.progress.report(state);
                        if round < self.rounds {
                            PipelineState::Upscaling { round: round + 1 }
                        } else {
                            PipelineState::Flushing
                        }
                    }
                }
                PipelineState::Flushing => {
                    self.flush(filled, &mut sink)?;
                    self.progress.report(state);
                    PipelineState::Filling
                }
                PipelineState::Stopping => {
                    self.outcome.stopped = true;
                    break;
                }
                PipelineState::Done => break,
            };
        }

        if let Err(error) = sink.flush() {
            if !self.session.should_stop() {
                return Err(error.into());
            }
        }
        drop(sink);
        drop(source);

        let final_state = if self.outcome.stopped {
            PipelineState::Stopping
        } else {
            PipelineState::Done
        };
        self.progress.report(final_state);
        Ok(self.outcome)
    }

    /// Read up to one batch of frames. Returns the number of filled slots.
    fn fill<R: Read>(&mut self, source: &mut R, source_exhausted: &mut bool) -> Result<usize, UpscalerError> {
        let mut filled = 0;
        for index in 0..self.pool.len() {
            if self.session.should_stop() {
                break;
            }
            match framing::read_one(source, &mut self.pool.slot_mut(index).buffer) {
                Ok(ReadStatus::Image) => filled += 1,
                Ok(ReadStatus::EndOfStream) => {
                    *source_exhausted = true;
                    break;
                }
                Err(FramingError::Io(error)) if !self.session.should_stop() => {
                    return Err(error.into());
                }
                Err(error) => {
                    if !self.session.should_stop() {
                        log::warn!("Frame stream ended after a malformed frame: {error}");
                        self.outcome.malformed_input = true;
                    }
                    // The stream position is lost; nothing after this frame
                    // can be located.
                    *source_exhausted = true;
                    break;
                }
            }
        }
        Ok(filled)
    }

    /// Upscale the first `filled` slots once.
    fn upscale_round(&mut self, round: u32, filled: usize) -> Result<(), UpscalerError> {
        for index in 0..filled {
            if self.session.should_stop() {
                return Ok(());
            }
            self.pool.write_buffer_to_backing(index)?;
            self.pool.reset_output(index)?;
        }

        {
            let job = RoundJob::new(round, self.rounds, self.pool, filled);
            self.upscaler.upscale(&job, self.session)?;
        }

        for index in 0..filled {
            if self.session.should_stop() {
                return Ok(());
            }
            self.pool.read_image_from_output(index)?;
        }
        log::debug!("Round {round}/{} finished for {filled} frame(s)", self.rounds);
        Ok(())
    }

    /// Write the first `filled` slots to `sink` in slot order.
    fn flush<W: Write>(&mut self, filled: usize, sink: &mut W) -> Result<(), UpscalerError> {
        for index in 0..filled {
            if self.session.should_stop() {
                return Ok(());
            }
            match self.pool.slot(index).buffer.write_to_pipe(sink) {
                Ok(()) => {
                    self.outcome.frames_written += 1;
                    self.progress.frame_written();
                }
                Err(error) if error.kind() == io::ErrorKind::BrokenPipe && self.session.should_stop() => {
                    return Ok(());
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }
}

/// A complete upscaling run from one video file to another.
///
/// # Example
///
/// ```no_run
/// use anime_upscaler::{Pipeline, PipelineConfig, Resolution, install_interrupt_handler};
///
/// let config = PipelineConfig::new("episode.mkv", "episode_1440p.mkv")
///     .with_target_resolution(Resolution::new(2560, 1440));
/// let pipeline = Pipeline::new(config);
/// install_interrupt_handler(pipeline.session())?;
///
/// let outcome = pipeline.run()?;
/// println!("{} frame(s) in {} batch(es)", outcome.frames_written, outcome.batches);
/// # Ok::<(), anime_upscaler::UpscalerError>(())
/// ```
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    session: Session,
}

impl Pipeline {
    /// Pipeline with a fresh [`Session`].
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_session(config, Session::new())
    }

    /// Pipeline bound to an existing session.
    pub fn with_session(config: PipelineConfig, session: Session) -> Self {
        Self { config, session }
    }

    /// The session whose stop flag this pipeline observes.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Resolve resolutions, frame rate and round count, probing the source
    /// unless both the source resolution and the frame rate are configured.
    ///
    /// # Errors
    ///
    /// Returns probe failures.
    pub fn plan(&self) -> Result<RunPlan, UpscalerError> {
        let needs_probe = self.config.source_resolution.is_none() || self.config.frame_rate.is_none();
        let metadata = if needs_probe {
            Some(SourceProbe::probe_preferred(&self.config.ffprobe_program, &self.config.input)?)
        } else {
            None
        };
        RunPlan::resolve(&self.config, metadata.as_ref())
    }

    /// Run to completion or until a stop is requested.
    ///
    /// A requested stop is not an error: the run returns a [`RunOutcome`]
    /// with `stopped` set. Every temporary file is removed before this
    /// returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::InvalidConfiguration`] if validation finds
    /// errors, and otherwise the first fatal error of the run. A fatal error
    /// interrupts every child process before it is returned.
    pub fn run(&self) -> Result<RunOutcome, UpscalerError> {
        let report = self.config.validate();
        for warning in &report.warnings {
            log::warn!("{warning}");
        }
        if !report.is_valid() {
            return Err(UpscalerError::InvalidConfiguration(report.errors.join("; ")));
        }

        let plan = self.plan()?;
        log::info!(
            "Upscaling {} from {} to {} at {} fps in {} round(s) per batch",
            self.config.input.display(),
            plan.source,
            plan.target,
            plan.frame_rate,
            plan.rounds
        );

        if self.session.should_stop() {
            return Ok(RunOutcome {
                rounds: plan.rounds,
                stopped: true,
                ..RunOutcome::default()
            });
        }

        let mut pool = FrameSlotPool::create(self.config.batch_size, &self.config.scratch_directory)?;
        let result = self.run_with_pool(&plan, &mut pool);
        if result.is_err() {
            self.session.request_stop();
        }
        pool.destroy();

        if let Ok(outcome) = &result {
            if outcome.stopped {
                log::info!("Stopped after {} frame(s)", outcome.frames_written);
            } else {
                log::info!(
                    "Wrote {} frame(s) to {}",
                    outcome.frames_written,
                    self.config.output.display()
                );
            }
        }
        result
    }

    fn run_with_pool(&self, plan: &RunPlan, pool: &mut FrameSlotPool) -> Result<RunOutcome, UpscalerError> {
        let config = &self.config;
        let supervisor = self.session.supervisor();

        let mut decoder = supervisor.spawn(&decoder_command(
            &config.ffmpeg_program,
            config.ffmpeg_log_level,
            &config.input,
            plan.frame_rate,
        ))?;
        let mut encoder = supervisor.spawn(&encoder_command(
            &config.ffmpeg_program,
            config.ffmpeg_log_level,
            &config.input,
            plan.frame_rate,
            plan.target,
            &config.output,
        ))?;
        if self.session.should_stop() {
            // The broadcast may have run before these were registered.
            decoder.interrupt();
            encoder.interrupt();
        }

        let frames = decoder.take_stdout().ok_or_else(|| missing_pipe(ProcessRole::Decoder))?;
        let encoder_input = encoder.take_stdin().ok_or_else(|| missing_pipe(ProcessRole::Encoder))?;

        let mut upscaler = ExternalUpscaler::new(config.upscaler.clone());
        let result = BatchRunner::new(&self.session, pool, &mut upscaler, plan.rounds)
            .with_progress(Arc::clone(&config.progress), plan.total_frames)
            .run(BufReader::new(frames), BufWriter::new(encoder_input));
        if result.is_err() {
            self.session.request_stop();
        }

        // Encoder first: it finishes the container once its input closes.
        let encoder_status = encoder.wait();
        let decoder_status = decoder.wait();

        let mut outcome = result?;
        self.check_exit(&encoder, encoder_status)?;
        let decoder_status = decoder_status?;
        if outcome.malformed_input && !decoder_status.success() {
            // Its unread output was discarded, so it usually dies of a broken pipe.
            log::warn!("The decoder exited with {decoder_status} after a malformed frame");
        } else {
            self.check_exit(&decoder, Ok(decoder_status))?;
        }
        outcome.stopped |= self.session.should_stop();
        Ok(outcome)
    }

    fn check_exit(
        &self,
        child: &SupervisedChild,
        status: Result<ExitStatus, UpscalerError>,
    ) -> Result<(), UpscalerError> {
        let status = status?;
        if status.success() {
            return Ok(());
        }
        if self.session.should_stop() {
            log::debug!("The {} process exited with {status} during shutdown", child.role());
            return Ok(());
        }
        Err(UpscalerError::ProcessCrash {
            role: child.role(),
            status,
        })
    }
}

fn missing_pipe(role: ProcessRole) -> UpscalerError {
    UpscalerError::Io(io::Error::other(format!("the {role} pipe was not captured")))
}
