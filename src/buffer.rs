//! Growable byte buffer.
//!
//! [`GrowableBuffer`] is the storage behind every frame slot. It tracks a
//! logical size separately from its allocation so a slot can be refilled
//! with a new image every batch without giving memory back to the
//! allocator.

use std::collections::TryReserveError;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

/// Capacity is always kept at a multiple of this many bytes.
pub const ALIGNMENT: usize = 8;

/// Default starting capacity for slot buffers.
pub const INITIAL_CAPACITY: usize = 64;

/// A byte buffer whose capacity only ever grows.
///
/// `size <= capacity` always holds. [`clear`](GrowableBuffer::clear) resets
/// the logical size without touching the allocation or its contents.
#[derive(Debug, Default, Clone)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    size: usize,
}

impl GrowableBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer with room for at least `capacity` bytes.
    ///
    /// The allocation is rounded up to the next multiple of [`ALIGNMENT`].
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; align_up(capacity)],
            size: 0,
        }
    }

    /// Logical number of bytes held.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` if the logical size is zero.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Allocated capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The logical contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Reset the logical size to zero. Never reallocates.
    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// Extend the logical size by `delta` bytes and return the new region.
    ///
    /// The backing storage is reallocated only when the new size exceeds the
    /// current capacity, in which case capacity becomes the next multiple of
    /// [`ALIGNMENT`] above the new size.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error if the storage cannot be grown. The
    /// buffer is left unchanged in that case.
    pub fn grow_and_get_write_slice(&mut self, delta: usize) -> Result<&mut [u8], TryReserveError> {
        let old_size = self.size;
        let new_size = old_size.saturating_add(delta);

        if new_size > self.data.len() {
            let new_capacity = new_size - (new_size % ALIGNMENT) + ALIGNMENT;
            self.data.try_reserve_exact(new_capacity - self.data.len())?;
            self.data.resize(new_capacity, 0);
        }

        self.size = new_size;
        Ok(&mut self.data[old_size..new_size])
    }

    /// Append up to `count` bytes read from `stream`.
    ///
    /// Keeps reading until `count` bytes arrived or the stream reports end of
    /// file. Returns the number of bytes actually read; the logical size only
    /// covers those bytes. A return value of `0` means the stream was already
    /// exhausted, anything between `0` and `count` means it ended early.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the stream (interrupted reads are retried)
    /// and reports allocation failure as [`ErrorKind::OutOfMemory`].
    pub fn read_into<R: Read + ?Sized>(&mut self, stream: &mut R, count: usize) -> std::io::Result<usize> {
        let start = self.size;
        let region = self
            .grow_and_get_write_slice(count)
            .map_err(|error| std::io::Error::new(ErrorKind::OutOfMemory, error))?;

        let mut filled = 0;
        let outcome = loop {
            if filled == count {
                break Ok(filled);
            }
            match stream.read(&mut region[filled..]) {
                Ok(0) => break Ok(filled),
                Ok(read) => filled += read,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => break Err(error),
            }
        };

        self.size = start + filled;
        outcome
    }

    /// Replace the contents of `file` with the logical contents.
    ///
    /// The file is truncated to exactly [`len`](GrowableBuffer::len) bytes and
    /// written from offset 0, so the same file can be reused for images of
    /// different sizes.
    pub fn write_to_file(&self, file: &mut File) -> std::io::Result<()> {
        file.set_len(self.size as u64)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(self.as_slice())?;
        file.flush()
    }

    /// Write the logical contents to a pipe or any other writer.
    ///
    /// `write_all` already retries interrupted writes; a closed reader
    /// surfaces as [`ErrorKind::BrokenPipe`].
    pub fn write_to_pipe<W: Write + ?Sized>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(self.as_slice())
    }
}

/// Round `size` up to a multiple of [`ALIGNMENT`].
fn align_up(size: usize) -> usize {
    size.div_ceil(ALIGNMENT) * ALIGNMENT
}
