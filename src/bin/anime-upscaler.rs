use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde_json::json;
use anime_upscaler::{
    FfmpegLogLevel, FrameRate, Pipeline, PipelineConfig, PipelineState, ProgressCallback,
    ProgressInfo, Resolution, SourceProbe, UpscalerCommand, UpscalerError, UpscalerOutput,
    config::DEFAULT_BATCH_SIZE, install_interrupt_handler,
};

const CLI_AFTER_HELP: &str = "Examples:\n  anime-upscaler run episode.mkv episode_1440p.mkv --resolution 2560x1440 --progress\n  anime-upscaler probe episode.mkv --json\n  anime-upscaler check episode.mkv episode_4k.mkv --resolution 3840x2160\n  anime-upscaler completions zsh > _anime-upscaler";

#[derive(Debug, Parser)]
#[command(
    name = "anime-upscaler",
    version,
    about = "Upscale videos frame by frame through an external image upscaler",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args, Clone, Default)]
struct GlobalOptions {
    /// Show debug logging, including upscaler output.
    #[arg(long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show warnings and errors.
    #[arg(long, global = true)]
    quiet: bool,

    /// FFmpeg log level (quiet, panic, fatal, error, warning, info, verbose, debug, trace).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Debug, Args, Clone)]
struct ConfigArgs {
    /// Source video.
    input: PathBuf,

    /// Output video.
    output: PathBuf,

    /// Target resolution as WIDTHxHEIGHT (default: twice the source).
    #[arg(long)]
    resolution: Option<String>,

    /// Frame rate to extract and encode at (default: the source's).
    #[arg(long)]
    fps: Option<String>,

    /// Source resolution as WIDTHxHEIGHT; skips probing together with --fps.
    #[arg(long)]
    source_resolution: Option<String>,

    /// Frames per batch.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Directory for temporary frame files.
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Upscaler program.
    #[arg(long)]
    upscaler: Option<String>,

    /// Noise reduction level for the first round (waifu2x-style arguments).
    #[arg(long)]
    noise_level: Option<u8>,

    /// Argument passed to the upscaler on every round (repeatable).
    #[arg(long = "upscaler-arg", allow_hyphen_values = true)]
    upscaler_args: Vec<String>,

    /// Upscaler console output: mute, inherit or log (default: log with --verbose, else mute).
    #[arg(long)]
    upscaler_output: Option<String>,

    /// ffmpeg program.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// ffprobe program.
    #[arg(long, default_value = "ffprobe")]
    ffprobe: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upscale a video.
    #[command(
        about = "Upscale a video",
        after_help = "Examples:\n  anime-upscaler run in.mkv out.mkv --resolution 2560x1440\n  anime-upscaler run in.mkv out.mkv --upscaler realesrgan-wrapper --upscaler-arg=--fast"
    )]
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Allow overwriting an existing output file.
        #[arg(long)]
        overwrite: bool,

        /// Show a progress bar.
        #[arg(long)]
        progress: bool,
    },

    /// Print what the pipeline needs to know about a video.
    #[command(
        about = "Print source video information",
        after_help = "Examples:\n  anime-upscaler probe in.mkv\n  anime-upscaler probe in.mkv --json"
    )]
    Probe {
        /// Source video.
        input: PathBuf,

        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,

        /// ffprobe program.
        #[arg(long, default_value = "ffprobe")]
        ffprobe: String,
    },

    /// Validate a configuration without running it.
    #[command(about = "Validate a configuration and print a report")]
    Check {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Generate shell completion scripts.
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Level-tagged, coloured log lines on stderr.
struct TerminalLogger {
    level: LevelFilter,
}

impl Log for TerminalLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "error:".red().bold(),
            Level::Warn => "warning:".yellow().bold(),
            Level::Info => "info:".green().bold(),
            Level::Debug => "debug:".blue().bold(),
            Level::Trace => "trace:".dimmed(),
        };
        if record.target() == "anime_upscaler::upscaler" {
            eprintln!("{tag} {} {}", "[upscaler]".cyan(), record.args());
        } else {
            eprintln!("{tag} {}", record.args());
        }
    }

    fn flush(&self) {}
}

fn level_filter(global: &GlobalOptions) -> LevelFilter {
    if global.verbose {
        LevelFilter::Debug
    } else if global.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    }
}

fn install_logger(level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
    let logger: &'static TerminalLogger = Box::leak(Box::new(TerminalLogger { level }));
    log::set_logger(logger).map_err(|error| error.to_string())?;
    log::set_max_level(level);
    Ok(())
}

fn parse_upscaler_output(value: &str) -> Option<UpscalerOutput> {
    match value.to_ascii_lowercase().as_str() {
        "mute" | "none" | "quiet" => Some(UpscalerOutput::Mute),
        "inherit" | "passthrough" => Some(UpscalerOutput::Inherit),
        "log" => Some(UpscalerOutput::Log),
        _ => None,
    }
}

fn parse_log_level(value: &str) -> Result<FfmpegLogLevel, Box<dyn std::error::Error>> {
    value
        .parse::<FfmpegLogLevel>()
        .map_err(|_| format!("unsupported --log-level: {value}").into())
}

fn ensure_writable_path(path: &Path, overwrite: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        if overwrite {
            eprintln!(
                "{} {}",
                "warning:".yellow().bold(),
                format!("overwriting {}", path.display()).yellow()
            );
        } else {
            return Err(format!(
                "output already exists: {} (use --overwrite to replace)",
                path.display()
            )
            .into());
        }
    }
    Ok(())
}

fn build_config(
    args: &ConfigArgs,
    global: &GlobalOptions,
) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = PipelineConfig::new(&args.input, &args.output)
        .with_batch_size(args.batch_size)
        .with_ffmpeg_program(&args.ffmpeg)
        .with_ffprobe_program(&args.ffprobe);

    if let Some(resolution) = &args.resolution {
        config = config.with_target_resolution(resolution.parse::<Resolution>()?);
    }
    if let Some(resolution) = &args.source_resolution {
        config = config.with_source_resolution(resolution.parse::<Resolution>()?);
    }
    if let Some(rate) = &args.fps {
        config = config.with_frame_rate(rate.parse::<FrameRate>()?);
    }
    if let Some(directory) = &args.scratch_dir {
        config = config.with_scratch_directory(directory);
    }
    if let Some(level) = &global.log_level {
        config = config.with_ffmpeg_log_level(parse_log_level(level)?);
    }

    let mut upscaler = match &args.upscaler {
        Some(program) => UpscalerCommand::new(program),
        None => UpscalerCommand::default(),
    };
    if !args.upscaler_args.is_empty() {
        upscaler = upscaler.with_args(args.upscaler_args.iter().cloned());
    }
    if let Some(level) = args.noise_level {
        upscaler = upscaler.with_noise_level(level);
    }
    let output = match &args.upscaler_output {
        Some(value) => parse_upscaler_output(value)
            .ok_or(format!("unsupported --upscaler-output: {value}"))?,
        None if global.verbose => UpscalerOutput::Log,
        None => UpscalerOutput::Mute,
    };
    config = config.with_upscaler(upscaler.with_output(output));

    Ok(config)
}

/// Drives an `indicatif` bar from pipeline progress.
struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let bar = ProgressBar::no_length();
        let style = ProgressStyle::with_template(
            "{spinner:.green} {bar:40.cyan/blue} {pos}/{len} frames [{elapsed_precise}] {msg}",
        )?;
        bar.set_style(style.progress_chars("##-"));
        Ok(Self { bar })
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_progress(&self, info: &ProgressInfo) {
        if let Some(total) = info.total_frames {
            self.bar.set_length(total.max(info.frames_written));
        }
        self.bar.set_position(info.frames_written);
        match info.state {
            PipelineState::Done => self.bar.finish_with_message("done"),
            PipelineState::Stopping => self.bar.abandon_with_message("stopped"),
            state => self.bar.set_message(format!(
                "batch {} ({} frames): {state} of {} round(s)",
                info.batch, info.batch_frames, info.total_rounds
            )),
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    install_logger(level_filter(&cli.global))?;

    match cli.command {
        Commands::Run {
            config,
            overwrite,
            progress,
        } => {
            ensure_writable_path(&config.output, overwrite)?;
            let mut pipeline_config = build_config(&config, &cli.global)?;
            if progress {
                pipeline_config = pipeline_config.with_progress(Arc::new(TerminalProgress::new()?));
            }

            let pipeline = Pipeline::new(pipeline_config);
            install_interrupt_handler(pipeline.session())?;
            let outcome = pipeline.run()?;

            if outcome.stopped {
                eprintln!(
                    "{} stopped after {} frame(s) in {} batch(es)",
                    "interrupted:".yellow().bold(),
                    outcome.frames_written,
                    outcome.batches
                );
            } else {
                eprintln!(
                    "{} {} frame(s) in {} batch(es), {} round(s) each -> {}",
                    "done:".green().bold(),
                    outcome.frames_written,
                    outcome.batches,
                    outcome.rounds,
                    config.output.display()
                );
            }
        }
        Commands::Probe {
            input,
            json,
            ffprobe,
        } => {
            let metadata = SourceProbe::probe_preferred(&ffprobe, &input)?;
            if json {
                let payload = json!({
                    "width": metadata.resolution.width,
                    "height": metadata.resolution.height,
                    "frame_rate": metadata.frame_rate.to_string(),
                    "fps": metadata.frame_rate.as_f64(),
                    "duration_seconds": metadata.duration.map(|duration| duration.as_secs_f64()),
                    "frame_count": metadata.frame_count,
                    "codec": metadata.codec,
                    "has_audio": metadata.has_audio,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!(
                    "Video: {} @ {:.3} fps [{}]",
                    metadata.resolution,
                    metadata.frame_rate.as_f64(),
                    metadata.codec
                );
                if let Some(duration) = metadata.duration {
                    println!("Duration: {:.2}s", duration.as_secs_f64());
                }
                if let Some(count) = metadata.frame_count {
                    println!("Frames: {count}");
                }
                println!("Audio: {}", if metadata.has_audio { "yes" } else { "no" });
            }
        }
        Commands::Check { config } => {
            let pipeline_config = build_config(&config, &cli.global)?;
            let report = pipeline_config.validate();
            print!("{report}");
            if !report.is_valid() {
                return Err(format!("{} configuration error(s)", report.errors.len()).into());
            }
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "anime-upscaler", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("{} {error}", "error:".red().bold());
        let code = error
            .downcast_ref::<UpscalerError>()
            .map(UpscalerError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
