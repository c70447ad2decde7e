//! Batch orchestration integration tests.
//!
//! The decoder and encoder are replaced by in-memory streams, and the
//! upscaler by in-process implementations of the slot contract.

use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anime_upscaler::{
    BatchRunner, FrameRate, FrameSlotPool, GrowableBuffer, ImageStreamReader, Pipeline,
    PipelineConfig, PipelineState, ProgressCallback, ProgressInfo, ReadStatus, Resolution,
    RoundJob, Session, UpscaleMode, Upscaler, UpscalerError,
};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([shade, 255 - shade, 7]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("Failed to encode PNG fixture");
    bytes
}

/// Decode every framed image of an encoder-side byte stream.
fn decode_all(stream: &[u8]) -> Vec<DynamicImage> {
    let mut reader = ImageStreamReader::new(stream);
    let mut buffer = GrowableBuffer::new();
    let mut images = Vec::new();
    while reader.read_one(&mut buffer).expect("Malformed output stream") == ReadStatus::Image {
        images.push(image::load_from_memory(buffer.as_slice()).expect("Failed to decode frame"));
    }
    images
}

fn shade_of(image: &DynamicImage) -> u8 {
    image.to_rgb8().get_pixel(0, 0)[0]
}

fn entries(directory: &Path) -> usize {
    fs::read_dir(directory).map(|entries| entries.count()).unwrap_or(0)
}

/// Doubles every image with nearest-neighbour sampling.
#[derive(Default)]
struct Doubler {
    calls: Vec<(u32, UpscaleMode, usize)>,
}

impl Upscaler for Doubler {
    fn upscale(&mut self, job: &RoundJob<'_>, _session: &Session) -> Result<(), UpscalerError> {
        self.calls.push((job.round, job.mode, job.slots.len()));
        for slot in &job.slots {
            let bytes = fs::read(slot.input)?;
            let image = image::load_from_memory(&bytes).expect("Backing file is not a PNG");
            image
                .resize_exact(image.width() * 2, image.height() * 2, FilterType::Nearest)
                .save_with_format(slot.output, ImageFormat::Png)
                .expect("Failed to write output");
        }
        Ok(())
    }
}

/// Requests a stop in the middle of its first round and writes nothing.
struct StopsMidRound;

impl Upscaler for StopsMidRound {
    fn upscale(&mut self, _job: &RoundJob<'_>, session: &Session) -> Result<(), UpscalerError> {
        session.request_stop();
        Ok(())
    }
}

/// Leaves every output file empty.
struct Lazy;

impl Upscaler for Lazy {
    fn upscale(&mut self, _job: &RoundJob<'_>, _session: &Session) -> Result<(), UpscalerError> {
        Ok(())
    }
}

/// Doubles every image on its first call, then returns without writing.
#[derive(Default)]
struct FirstCallOnly {
    inner: Doubler,
}

impl Upscaler for FirstCallOnly {
    fn upscale(&mut self, job: &RoundJob<'_>, session: &Session) -> Result<(), UpscalerError> {
        if self.inner.calls.is_empty() {
            self.inner.upscale(job, session)
        } else {
            self.inner.calls.push((job.round, job.mode, job.slots.len()));
            Ok(())
        }
    }
}

#[derive(Default)]
struct Recorder {
    reports: Mutex<Vec<ProgressInfo>>,
}

impl ProgressCallback for Recorder {
    fn on_progress(&self, info: &ProgressInfo) {
        self.reports.lock().expect("Poisoned").push(info.clone());
    }
}

// ── Batch sizing ───────────────────────────────────────────────────

#[test]
fn partial_batch_fills_available_frames() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(5, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut upscaler = Doubler::default();
    let source = [png(3, 2, 10), png(3, 2, 20), png(3, 2, 30)].concat();
    let mut sink = Vec::new();

    let outcome = BatchRunner::new(&session, &mut pool, &mut upscaler, 1)
        .run(Cursor::new(source), &mut sink)
        .expect("Run failed");

    assert_eq!(outcome.batches, 1);
    assert_eq!(outcome.frames_written, 3);
    assert!(!outcome.stopped);
    assert_eq!(upscaler.calls, vec![(1, UpscaleMode::DenoiseAndScale, 3)]);
    assert_eq!(decode_all(&sink).len(), 3);
}

#[test]
fn empty_source_is_done_immediately() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(4, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut upscaler = Doubler::default();
    let mut sink = Vec::new();

    let outcome = BatchRunner::new(&session, &mut pool, &mut upscaler, 2)
        .run(Cursor::new(Vec::new()), &mut sink)
        .expect("Run failed");

    assert_eq!(outcome.batches, 0);
    assert_eq!(outcome.frames_written, 0);
    assert_eq!(outcome.rounds, 2);
    assert!(upscaler.calls.is_empty());
    assert!(sink.is_empty());
}

// ── Ordering and rounds ────────────────────────────────────────────

#[test]
fn frame_order_is_preserved_across_batches() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(2, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut upscaler = Doubler::default();
    let shades = [40_u8, 80, 120, 160, 200];
    let source: Vec<u8> = shades.iter().map(|&shade| png(4, 3, shade)).collect::<Vec<_>>().concat();
    let mut sink = Vec::new();

    let outcome = BatchRunner::new(&session, &mut pool, &mut upscaler, 1)
        .run(Cursor::new(source), &mut sink)
        .expect("Run failed");
    assert_eq!(outcome.batches, 3);
    assert_eq!(outcome.frames_written, 5);

    let frames = decode_all(&sink);
    let written: Vec<u8> = frames.iter().map(shade_of).collect();
    assert_eq!(written, shades);
    assert!(frames.iter().all(|frame| (frame.width(), frame.height()) == (8, 6)));
}

#[test]
fn every_round_doubles_and_only_the_first_denoises() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(4, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut upscaler = Doubler::default();
    let source = [png(5, 3, 1), png(5, 3, 2)].concat();
    let mut sink = Vec::new();

    let outcome = BatchRunner::new(&session, &mut pool, &mut upscaler, 3)
        .run(Cursor::new(source), &mut sink)
        .expect("Run failed");

    assert_eq!(outcome.rounds, 3);
    assert_eq!(
        upscaler.calls,
        vec![
            (1, UpscaleMode::DenoiseAndScale, 2),
            (2, UpscaleMode::ScaleOnly, 2),
            (3, UpscaleMode::ScaleOnly, 2),
        ]
    );
    let frames = decode_all(&sink);
    assert!(frames.iter().all(|frame| (frame.width(), frame.height()) == (40, 24)));
}

#[test]
fn zero_rounds_still_runs_one() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(1, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut upscaler = Doubler::default();
    let mut sink = Vec::new();

    let outcome = BatchRunner::new(&session, &mut pool, &mut upscaler, 0)
        .run(Cursor::new(png(2, 2, 0)), &mut sink)
        .expect("Run failed");
    assert_eq!(outcome.rounds, 1);
    assert_eq!(upscaler.calls.len(), 1);
}

// ── Malformed input and upscaler failures ──────────────────────────

#[test]
fn truncated_frame_ends_the_input() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(4, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut upscaler = Doubler::default();
    let cut = png(3, 3, 99);
    let source = [png(3, 3, 10), png(3, 3, 20), cut[..cut.len() / 2].to_vec()].concat();
    let mut sink = Vec::new();

    let outcome = BatchRunner::new(&session, &mut pool, &mut upscaler, 1)
        .run(Cursor::new(source), &mut sink)
        .expect("Run failed");

    assert_eq!(outcome.frames_written, 2);
    assert!(outcome.malformed_input);
    let written: Vec<u8> = decode_all(&sink).iter().map(shade_of).collect();
    assert_eq!(written, [10, 20]);
}

#[test]
fn missing_upscaler_output_is_fatal() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(2, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut sink = Vec::new();

    let error = BatchRunner::new(&session, &mut pool, &mut Lazy, 1)
        .run(Cursor::new(png(2, 2, 0)), &mut sink)
        .unwrap_err();
    assert!(matches!(error, UpscalerError::UpscaledOutput { .. }));
    assert!(sink.is_empty());
}

#[test]
fn skipped_output_is_not_mistaken_for_an_earlier_result() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(1, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut upscaler = FirstCallOnly::default();
    let source = [png(2, 2, 50), png(2, 2, 150)].concat();
    let mut sink = Vec::new();

    let error = BatchRunner::new(&session, &mut pool, &mut upscaler, 1)
        .run(Cursor::new(source), &mut sink)
        .unwrap_err();
    match error {
        UpscalerError::UpscaledOutput { reason, .. } => assert_eq!(reason, "file is empty"),
        other => panic!("unexpected error: {other}"),
    }
    let written: Vec<u8> = decode_all(&sink).iter().map(shade_of).collect();
    assert_eq!(written, [50]);
}

#[test]
fn later_rounds_need_fresh_output() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(2, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut upscaler = FirstCallOnly::default();
    let mut sink = Vec::new();

    let error = BatchRunner::new(&session, &mut pool, &mut upscaler, 2)
        .run(Cursor::new(png(2, 2, 9)), &mut sink)
        .unwrap_err();
    assert!(matches!(error, UpscalerError::UpscaledOutput { .. }));
    assert_eq!(upscaler.inner.calls.len(), 2);
    assert!(sink.is_empty());
}

// ── Cancellation ───────────────────────────────────────────────────

#[test]
fn stop_during_upscaling_skips_flush_and_cleans_up() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(3, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let source = [png(2, 2, 1), png(2, 2, 2), png(2, 2, 3), png(2, 2, 4)].concat();
    let mut sink = Vec::new();

    let outcome = BatchRunner::new(&session, &mut pool, &mut StopsMidRound, 2)
        .run(Cursor::new(source), &mut sink)
        .expect("A requested stop is not an error");

    assert!(outcome.stopped);
    assert_eq!(outcome.batches, 1);
    assert_eq!(outcome.frames_written, 0);
    assert!(sink.is_empty());
    assert_eq!(session.termination_broadcasts(), 1);

    pool.destroy();
    assert_eq!(entries(scratch.path()), 0);
}

#[test]
fn stop_before_run_reads_nothing() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(2, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    session.request_stop();
    let mut upscaler = Doubler::default();
    let mut sink = Vec::new();

    let outcome = BatchRunner::new(&session, &mut pool, &mut upscaler, 1)
        .run(Cursor::new(png(2, 2, 0)), &mut sink)
        .expect("Run failed");

    assert!(outcome.stopped);
    assert_eq!(outcome.batches, 0);
    assert!(upscaler.calls.is_empty());
    assert!(sink.is_empty());
}

// ── Progress ───────────────────────────────────────────────────────

#[test]
fn progress_reports_rounds_batches_and_completion() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let mut pool = FrameSlotPool::create(2, scratch.path()).expect("Failed to create pool");
    let session = Session::new();
    let mut upscaler = Doubler::default();
    let recorder = Arc::new(Recorder::default());
    let source = [png(2, 2, 1), png(2, 2, 2), png(2, 2, 3)].concat();
    let mut sink = Vec::new();

    BatchRunner::new(&session, &mut pool, &mut upscaler, 2)
        .with_progress(Arc::clone(&recorder) as Arc<dyn ProgressCallback>, Some(3))
        .run(Cursor::new(source), &mut sink)
        .expect("Run failed");

    let reports = recorder.reports.lock().expect("Poisoned");
    let states: Vec<PipelineState> = reports.iter().map(|info| info.state).collect();
    assert_eq!(
        states,
        vec![
            PipelineState::Upscaling { round: 1 },
            PipelineState::Upscaling { round: 2 },
            PipelineState::Flushing,
            PipelineState::Upscaling { round: 1 },
            PipelineState::Upscaling { round: 2 },
            PipelineState::Flushing,
            PipelineState::Done,
        ]
    );

    let last = reports.last().expect("No reports");
    assert_eq!(last.frames_written, 3);
    assert_eq!(last.batch, 2);
    assert_eq!(last.percentage, Some(100.0));
    assert_eq!(reports[2].frames_written, 2);
}

// ── External upscaler ──────────────────────────────────────────────

#[cfg(unix)]
mod external {
    use super::*;
    use anime_upscaler::{ExternalUpscaler, ProcessRole, UpscalerCommand};

    /// Copies each input to its output path, i.e. a 1x "upscaler".
    fn copying_upscaler() -> ExternalUpscaler {
        ExternalUpscaler::new(UpscalerCommand::new("sh").with_args([
            "-c",
            r#"while read -r p; do cp "$p" "${p}_output.png"; done"#,
        ]))
    }

    #[test]
    fn path_list_drives_the_external_process() {
        let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
        let mut pool = FrameSlotPool::create(2, scratch.path()).expect("Failed to create pool");
        let session = Session::new();
        let mut upscaler = copying_upscaler();
        let shades = [11_u8, 22, 33];
        let frames: Vec<Vec<u8>> = shades.iter().map(|&shade| png(3, 2, shade)).collect();
        let mut sink = Vec::new();

        let outcome = BatchRunner::new(&session, &mut pool, &mut upscaler, 2)
            .run(Cursor::new(frames.concat()), &mut sink)
            .expect("Run failed");

        assert_eq!(outcome.frames_written, 3);
        assert_eq!(sink, frames.concat());
        assert!(session.supervisor().table().live_pids().is_empty());
    }

    #[test]
    fn crashing_upscaler_is_fatal() {
        let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
        let mut pool = FrameSlotPool::create(2, scratch.path()).expect("Failed to create pool");
        let session = Session::new();
        let mut upscaler =
            ExternalUpscaler::new(UpscalerCommand::new("sh").with_args(["-c", "exit 4"]));
        let mut sink = Vec::new();

        let error = BatchRunner::new(&session, &mut pool, &mut upscaler, 1)
            .run(Cursor::new(png(2, 2, 0)), &mut sink)
            .unwrap_err();
        match error {
            UpscalerError::ProcessCrash { role, status } => {
                assert_eq!(role, ProcessRole::Upscaler);
                assert_eq!(status.code(), Some(4));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

// ── Full pipeline ──────────────────────────────────────────────────

#[test]
fn invalid_configuration_is_refused() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let config = PipelineConfig::new(scratch.path().join("missing.mkv"), scratch.path().join("out.mkv"))
        .with_scratch_directory(scratch.path().join("frames"));

    let error = Pipeline::new(config).run().unwrap_err();
    assert!(matches!(error, UpscalerError::InvalidConfiguration(_)));
    assert!(!scratch.path().join("frames").exists());
}

#[test]
fn stop_before_start_creates_no_files() {
    let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
    let input = scratch.path().join("in.mkv");
    fs::write(&input, b"not really a video").expect("Failed to write input");
    let config = PipelineConfig::new(&input, scratch.path().join("out.mkv"))
        .with_source_resolution(Resolution::new(640, 360))
        .with_target_resolution(Resolution::new(2560, 1440))
        .with_frame_rate(FrameRate::new(24, 1))
        .with_scratch_directory(scratch.path().join("frames"));

    let pipeline = Pipeline::new(config);
    pipeline.session().request_stop();
    let outcome = pipeline.run().expect("A requested stop is not an error");

    assert!(outcome.stopped);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.frames_written, 0);
    assert!(!scratch.path().join("frames").exists());
}

#[cfg(unix)]
mod processes {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use super::*;
    use anime_upscaler::{ProcessRole, UpscalerCommand};

    /// Stands in for ffmpeg. As the decoder (`-nostdin` first) it copies the
    /// input file, which already holds PNG frames, to stdout. As the encoder
    /// it copies stdin to its last argument.
    fn fake_ffmpeg(directory: &Path, decoder_exit: i32) -> PathBuf {
        let path = directory.join("fake-ffmpeg.sh");
        let script = [
            "#!/bin/sh".to_string(),
            r#"if [ "$1" = "-nostdin" ]; then"#.to_string(),
            r#"  cat "$6" || exit 1"#.to_string(),
            format!("  exit {decoder_exit}"),
            "fi".to_string(),
            "for last; do :; done".to_string(),
            r#"exec cat > "$last""#.to_string(),
        ]
        .join("\n");
        fs::write(&path, script).expect("Failed to write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("Failed to chmod script");
        path
    }

    fn copying_upscaler() -> UpscalerCommand {
        UpscalerCommand::new("sh").with_args([
            "-c",
            r#"while read -r p; do cp "$p" "${p}_output.png"; done"#,
        ])
    }

    struct Setup {
        scratch: tempfile::TempDir,
        frames: Vec<Vec<u8>>,
    }

    impl Setup {
        fn new(shades: &[u8]) -> Self {
            let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
            let frames = shades.iter().map(|&shade| png(4, 3, shade)).collect();
            Self { scratch, frames }
        }

        fn input(&self) -> PathBuf {
            self.scratch.path().join("in.mkv")
        }

        fn output(&self) -> PathBuf {
            self.scratch.path().join("out.mkv")
        }

        fn frames_directory(&self) -> PathBuf {
            self.scratch.path().join("frames")
        }

        fn config(&self, input: &[u8], decoder_exit: i32) -> PipelineConfig {
            fs::write(self.input(), input).expect("Failed to write input");
            PipelineConfig::new(self.input(), self.output())
                .with_source_resolution(Resolution::new(4, 3))
                .with_target_resolution(Resolution::new(16, 12))
                .with_frame_rate(FrameRate::new(24, 1))
                .with_batch_size(2)
                .with_scratch_directory(self.frames_directory())
                .with_upscaler(copying_upscaler())
                .with_ffmpeg_program(fake_ffmpeg(self.scratch.path(), decoder_exit).to_string_lossy())
        }
    }

    /// Requests a stop on the first progress report.
    struct StopOnFirstReport {
        session: Session,
    }

    impl ProgressCallback for StopOnFirstReport {
        fn on_progress(&self, _info: &ProgressInfo) {
            self.session.request_stop();
        }
    }

    #[test]
    fn frames_flow_from_decoder_to_encoder() {
        let setup = Setup::new(&[10, 60, 110, 160, 210]);
        let config = setup.config(&setup.frames.concat(), 0);

        let pipeline = Pipeline::new(config);
        let outcome = pipeline.run().expect("Run failed");

        assert!(!outcome.stopped);
        assert!(!outcome.malformed_input);
        assert_eq!(outcome.frames_written, 5);
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.rounds, 2);
        assert_eq!(fs::read(setup.output()).expect("No output"), setup.frames.concat());
        assert_eq!(entries(&setup.frames_directory()), 0);
        assert!(pipeline.session().supervisor().table().live_pids().is_empty());
    }

    #[test]
    fn failing_decoder_is_reported() {
        let setup = Setup::new(&[10, 60, 110]);
        let config = setup.config(&setup.frames.concat(), 3);

        let error = Pipeline::new(config).run().unwrap_err();
        match error {
            UpscalerError::ProcessCrash { role, status } => {
                assert_eq!(role, ProcessRole::Decoder);
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(entries(&setup.frames_directory()), 0);
    }

    #[test]
    fn decoder_failure_after_malformed_frame_is_tolerated() {
        let setup = Setup::new(&[10, 60]);
        let mut input = setup.frames.concat();
        input.extend(std::iter::repeat_n(0_u8, 512 * 1024));
        let config = setup.config(&input, 0);

        let outcome = Pipeline::new(config).run().expect("Run failed");

        assert!(outcome.malformed_input);
        assert!(!outcome.stopped);
        assert_eq!(outcome.frames_written, 2);
        assert_eq!(fs::read(setup.output()).expect("No output"), setup.frames.concat());
    }

    #[test]
    fn stop_mid_run_is_not_a_crash() {
        let setup = Setup::new(&[10, 60, 110, 160, 210]);
        let session = Session::new();
        let config = setup
            .config(&setup.frames.concat(), 0)
            .with_progress(Arc::new(StopOnFirstReport {
                session: session.clone(),
            }));

        let outcome = Pipeline::with_session(config, session.clone())
            .run()
            .expect("A requested stop is not an error");

        assert!(outcome.stopped);
        assert_eq!(outcome.frames_written, 0);
        assert_eq!(session.termination_broadcasts(), 1);
        assert_eq!(entries(&setup.frames_directory()), 0);
        assert!(session.supervisor().table().live_pids().is_empty());
    }
}
