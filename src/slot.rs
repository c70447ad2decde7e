//! On-disk half of a frame slot.
//!
//! External upscalers only accept file paths, so every slot owns one
//! reusable backing file that receives the current image and one output
//! path where the upscaler is expected to write its result.

use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::UpscalerError;

/// Prefix of every backing file name.
pub const TEMP_FILE_PREFIX: &str = "anime-upscaler-tempfile-";

/// Suffix appended to a backing file's basename to form its output name.
pub const OUTPUT_SUFFIX: &str = "_output.png";

/// Maps a backing file basename to the path the upscaler writes to.
///
/// Shared by every slot of one pool: the directory is the pool's own
/// directory, so output paths of different pools never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPathTemplate {
    directory: PathBuf,
}

impl OutputPathTemplate {
    /// Template producing `<directory>/<basename>_output.png`.
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    /// Directory the outputs are placed in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Substitute a basename into the template.
    pub fn render(&self, basename: &OsStr) -> PathBuf {
        let mut file_name = basename.to_os_string();
        file_name.push(OUTPUT_SUFFIX);
        self.directory.join(file_name)
    }
}

/// One reusable backing file plus its deterministic output path.
///
/// The backing file is removed when the slot is released or dropped; the
/// output file is removed by [`release`](TempFileSlot::release) and on drop.
#[derive(Debug)]
pub struct TempFileSlot {
    backing: NamedTempFile,
    output_path: PathBuf,
    released: bool,
}

impl TempFileSlot {
    /// Create a backing file in `directory` and reserve its output file.
    ///
    /// The output file is created empty right away so that existence checks
    /// made by the upscaler or by ourselves never race with its creation.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::TempFile`] if either file cannot be created.
    pub fn create(directory: &Path, template: &OutputPathTemplate) -> Result<Self, UpscalerError> {
        let backing = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .rand_bytes(6)
            .tempfile_in(directory)
            .map_err(|source| UpscalerError::TempFile {
                path: directory.to_path_buf(),
                source,
            })?;

        let basename = backing
            .path()
            .file_name()
            .map(OsStr::to_os_string)
            .unwrap_or_default();
        let output_path = template.render(&basename);

        File::create(&output_path).map_err(|source| UpscalerError::TempFile {
            path: output_path.clone(),
            source,
        })?;

        log::trace!(
            "Created slot files {} -> {}",
            backing.path().display(),
            output_path.display()
        );

        Ok(Self {
            backing,
            output_path,
            released: false,
        })
    }

    /// Absolute path of the backing file handed to the upscaler.
    pub fn backing_path(&self) -> &Path {
        self.backing.path()
    }

    /// Path the upscaler writes this slot's result to.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Open handle to the backing file.
    pub fn backing_file(&mut self) -> &mut File {
        self.backing.as_file_mut()
    }

    /// Truncate the output file to zero bytes.
    ///
    /// The file keeps existing, but whatever an earlier round left in it is
    /// gone, so a path the upscaler skipped reads back as empty.
    pub fn reset_output(&self) -> std::io::Result<()> {
        File::create(&self.output_path).map(drop)
    }

    /// Remove the output file. The backing file goes away when the slot is
    /// dropped. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(error) = std::fs::remove_file(&self.output_path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to remove {}: {error}",
                    self.output_path.display()
                );
            }
        }
    }
}

impl Drop for TempFileSlot {
    fn drop(&mut self) {
        self.release();
    }
}
