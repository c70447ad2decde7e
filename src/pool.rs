//! Fixed-size pool of frame slots.
//!
//! A [`FrameSlotPool`] holds one batch worth of frames. Each [`FrameSlot`]
//! pairs an in-memory [`GrowableBuffer`] with a [`TempFileSlot`], so the
//! pipeline can move an image between memory (for the ffmpeg pipes) and disk
//! (for the upscaler) as often as it needs to without reallocating anything.
//!
//! # Example
//!
//! ```no_run
//! use anime_upscaler::FrameSlotPool;
//!
//! let mut pool = FrameSlotPool::create(4, "/dev/shm/anime-upscaler")?;
//! for index in 0..pool.len() {
//!     println!("{}", pool.slot(index).files.backing_path().display());
//! }
//! pool.destroy();
//! # Ok::<(), anime_upscaler::UpscalerError>(())
//! ```

use std::fs::{DirBuilder, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::buffer::{GrowableBuffer, INITIAL_CAPACITY};
use crate::error::UpscalerError;
use crate::framing::{self, ReadStatus};
use crate::slot::{OutputPathTemplate, TempFileSlot};

/// Prefix of the per-pool directory created inside the scratch directory.
const POOL_DIRECTORY_PREFIX: &str = "anime-upscaler-";

/// One frame's buffer and files.
#[derive(Debug)]
pub struct FrameSlot {
    /// Current image bytes.
    pub buffer: GrowableBuffer,
    /// Backing and output files.
    pub files: TempFileSlot,
}

/// An ordered, fixed-length set of frame slots.
///
/// Slot index is the frame's position within its batch. The pool removes
/// all of its files exactly once, either through [`destroy`](FrameSlotPool::destroy)
/// or when dropped.
#[derive(Debug)]
pub struct FrameSlotPool {
    slots: Vec<FrameSlot>,
    directory: Option<TempDir>,
    template: OutputPathTemplate,
}

impl FrameSlotPool {
    /// Create `size` slots under `scratch_directory`.
    ///
    /// The scratch directory is created if missing. The pool then creates its
    /// own uniquely named directory inside it and places every backing and
    /// output file there.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::InvalidConfiguration`] for a zero size and
    /// [`UpscalerError::TempFile`] if any directory or file cannot be created.
    /// Files created before the failure are removed.
    pub fn create<P: AsRef<Path>>(size: usize, scratch_directory: P) -> Result<Self, UpscalerError> {
        if size == 0 {
            return Err(UpscalerError::InvalidConfiguration(
                "batch size must be at least 1".to_string(),
            ));
        }

        let scratch_directory = scratch_directory.as_ref();
        create_scratch_directory(scratch_directory)?;

        let directory = tempfile::Builder::new()
            .prefix(POOL_DIRECTORY_PREFIX)
            .tempdir_in(scratch_directory)
            .map_err(|source| UpscalerError::TempFile {
                path: scratch_directory.to_path_buf(),
                source,
            })?;
        let template = OutputPathTemplate::new(directory.path());

        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            // On error the already-built slots and the directory drop here,
            // which removes their files.
            let files = TempFileSlot::create(directory.path(), &template)?;
            slots.push(FrameSlot {
                buffer: GrowableBuffer::with_capacity(INITIAL_CAPACITY),
                files,
            });
        }

        log::debug!(
            "Created frame slot pool of {} slot(s) in {}",
            size,
            directory.path().display()
        );

        Ok(Self {
            slots,
            directory: Some(directory),
            template,
        })
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the pool holds no slots, which is only the case
    /// after it was destroyed.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns `true` once [`destroy`](FrameSlotPool::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.directory.is_none()
    }

    /// Directory holding this pool's files, until the pool is destroyed.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_ref().map(TempDir::path)
    }

    /// Output naming template shared by all slots.
    pub fn template(&self) -> &OutputPathTemplate {
        &self.template
    }

    /// Shared access to slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// Mutable access to slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn slot_mut(&mut self, index: usize) -> &mut FrameSlot {
        &mut self.slots[index]
    }

    /// Iterate over the first `count` slots in index order.
    pub fn filled(&self, count: usize) -> impl Iterator<Item = &FrameSlot> {
        self.slots.iter().take(count)
    }

    /// Write slot `index`'s buffer over its backing file.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::TempFile`] if the file cannot be truncated or
    /// written.
    pub fn write_buffer_to_backing(&mut self, index: usize) -> Result<(), UpscalerError> {
        let slot = &mut self.slots[index];
        let path = slot.files.backing_path().to_path_buf();
        slot.buffer
            .write_to_file(slot.files.backing_file())
            .map_err(|source| UpscalerError::TempFile { path, source })
    }

    /// Empty slot `index`'s output file before the upscaler runs.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::TempFile`] if the file cannot be truncated.
    pub fn reset_output(&mut self, index: usize) -> Result<(), UpscalerError> {
        let files = &self.slots[index].files;
        files.reset_output().map_err(|source| UpscalerError::TempFile {
            path: files.output_path().to_path_buf(),
            source,
        })
    }

    /// Load the image the upscaler wrote for slot `index` into its buffer.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::UpscaledOutput`] if the output file cannot be
    /// opened or does not hold exactly one well-framed image.
    pub fn read_image_from_output(&mut self, index: usize) -> Result<(), UpscalerError> {
        let slot = &mut self.slots[index];
        let path = slot.files.output_path().to_path_buf();

        let file = File::open(&path).map_err(|error| UpscalerError::UpscaledOutput {
            path: path.clone(),
            reason: error.to_string(),
        })?;
        let mut reader = BufReader::new(file);

        match framing::read_one(&mut reader, &mut slot.buffer) {
            Ok(ReadStatus::Image) => Ok(()),
            Ok(ReadStatus::EndOfStream) => Err(UpscalerError::UpscaledOutput {
                path,
                reason: "file is empty".to_string(),
            }),
            Err(error) => Err(UpscalerError::UpscaledOutput {
                path,
                reason: error.to_string(),
            }),
        }
    }

    /// Remove every file and directory and free every buffer.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn destroy(&mut self) {
        let Some(directory) = self.directory.take() else {
            return;
        };

        for mut slot in self.slots.drain(..) {
            slot.files.release();
        }

        let path = directory.path().to_path_buf();
        if let Err(error) = directory.close() {
            log::warn!("Failed to remove pool directory {}: {error}", path.display());
        } else {
            log::debug!("Removed frame slot pool at {}", path.display());
        }
    }
}

impl Drop for FrameSlotPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Create the scratch directory (and parents) with owner-only permissions.
fn create_scratch_directory(path: &Path) -> Result<(), UpscalerError> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path).map_err(|source| UpscalerError::TempFile {
        path: PathBuf::from(path),
        source,
    })
}
