//! Pipeline configuration validation.
//!
//! [`PipelineConfig::validate`] inspects a configuration before any process
//! is started or any temporary file is created, and returns a
//! [`ValidationReport`] describing potential issues.
//!
//! # Example
//!
//! ```no_run
//! use anime_upscaler::PipelineConfig;
//!
//! let report = PipelineConfig::new("in.mkv", "out.mkv").validate();
//! if report.is_valid() {
//!     println!("Configuration is usable");
//! } else {
//!     for error in &report.errors {
//!         println!("Error: {error}");
//!     }
//! }
//! ```

use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::config::PipelineConfig;

/// Batch sizes above this keep a lot of full-size frames in memory.
const LARGE_BATCH_SIZE: usize = 1024;

/// Summary of configuration validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Informational notices (not problems).
    pub info: Vec<String>,
    /// Non-fatal issues that may affect the result.
    pub warnings: Vec<String>,
    /// Fatal issues that prevent a run.
    pub errors: Vec<String>,
}

impl ValidationReport {
    /// Returns `true` if no errors were found.
    ///
    /// Warnings do not affect this result.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Total number of issues (info + warnings + errors).
    pub fn issue_count(&self) -> usize {
        self.info.len() + self.warnings.len() + self.errors.len()
    }
}

impl Display for ValidationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        for item in &self.info {
            writeln!(f, "[INFO] {item}")?;
        }
        for item in &self.warnings {
            writeln!(f, "[WARN] {item}")?;
        }
        for item in &self.errors {
            writeln!(f, "[ERROR] {item}")?;
        }
        if self.issue_count() == 0 {
            writeln!(f, "No issues found.")?;
        }
        Ok(())
    }
}

impl PipelineConfig {
    /// Check the configuration without touching any external program.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        // ── Paths ──────────────────────────────────────────────────────
        if !self.input.exists() {
            report
                .errors
                .push(format!("Input {} does not exist", self.input.display()));
        } else if !self.input.is_file() {
            report
                .errors
                .push(format!("Input {} is not a file", self.input.display()));
        }

        if self.output.is_dir() {
            report
                .errors
                .push(format!("Output {} is a directory", self.output.display()));
        } else if self.output.exists() {
            report
                .info
                .push(format!("Output {} will be overwritten", self.output.display()));
        }

        if let Some(parent) = self.output.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                report.errors.push(format!(
                    "Output directory {} does not exist",
                    parent.display()
                ));
            }
        }

        if self.input == self.output {
            report
                .errors
                .push("Input and output are the same file".to_string());
        }

        if self.scratch_directory.exists() && !self.scratch_directory.is_dir() {
            report.errors.push(format!(
                "Scratch directory {} is not a directory",
                self.scratch_directory.display()
            ));
        }

        // ── Resolutions ────────────────────────────────────────────────
        if let Some(target) = self.target_resolution {
            if !target.is_valid() {
                report
                    .errors
                    .push(format!("Target resolution {target} has a zero dimension"));
            }
        }

        if let Some(source) = self.source_resolution {
            if !source.is_valid() {
                report
                    .errors
                    .push(format!("Source resolution {source} has a zero dimension"));
            }
        }

        if let (Some(source), Some(target)) = (self.source_resolution, self.target_resolution) {
            if source.is_valid() && target.is_valid() {
                if target.width < source.width || target.height < source.height {
                    report.warnings.push(format!(
                        "Target {target} is smaller than source {source}; frames are still upscaled once and then downscaled by the encoder"
                    ));
                }
                let source_ratio = source.width as f64 / source.height as f64;
                let target_ratio = target.width as f64 / target.height as f64;
                if (source_ratio - target_ratio).abs() > 0.01 {
                    report.warnings.push(format!(
                        "Target {target} changes the aspect ratio of source {source}"
                    ));
                }
            }
        }

        // ── Timing and batching ────────────────────────────────────────
        if let Some(rate) = self.frame_rate {
            if !rate.is_valid() {
                report.errors.push("Frame rate must be positive".to_string());
            }
        }

        if self.batch_size > LARGE_BATCH_SIZE {
            report.warnings.push(format!(
                "Batch size {} keeps that many frames in memory at once",
                self.batch_size
            ));
        }

        report
    }
}
