//! PNG stream framing.
//!
//! ffmpeg's `image2pipe` muxer and most upscalers exchange frames as a
//! plain concatenation of PNG files. [`ImageStreamReader`] splits such a
//! stream back into individual images by following the chunk length fields,
//! without inflating or checking any pixel data. The bytes it collects are
//! exactly the bytes it received, so a collected image can be written
//! straight to a file or another pipe.
//!
//! # Example
//!
//! ```
//! use std::io::Cursor;
//!
//! use anime_upscaler::{GrowableBuffer, ImageStreamReader, ReadStatus};
//!
//! let mut reader = ImageStreamReader::new(Cursor::new(Vec::<u8>::new()));
//! let mut buffer = GrowableBuffer::new();
//! assert_eq!(reader.read_one(&mut buffer)?, ReadStatus::EndOfStream);
//! # Ok::<(), anime_upscaler::FramingError>(())
//! ```

use std::io::Read;

use thiserror::Error;

use crate::buffer::GrowableBuffer;

/// The 8-byte PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = *b"\x89PNG\r\n\x1a\n";

/// Chunk type that terminates a PNG image.
pub const END_CHUNK_TYPE: [u8; 4] = *b"IEND";

const CHUNK_LENGTH_SIZE: usize = 4;
const CHUNK_TYPE_SIZE: usize = 4;
const CHUNK_CRC_SIZE: usize = 4;

/// Smallest piece of chunk data requested from the stream at once. Larger
/// chunks are read in pieces that grow with the buffer, so a corrupt length
/// field cannot allocate more than about twice the bytes actually received.
const MIN_DATA_STEP: usize = 64 * 1024;

/// Result of a successful [`ImageStreamReader::read_one`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The buffer now holds exactly one complete image.
    Image,
    /// The stream ended cleanly before any byte of a new image.
    EndOfStream,
}

/// The stream did not contain a well-framed image.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FramingError {
    /// Fewer than 8 (but more than 0) bytes were available for the signature.
    #[error("Stream ended inside the PNG signature after {read} byte(s)")]
    TruncatedSignature {
        /// Bytes actually read.
        read: usize,
    },

    /// The first 8 bytes are not the PNG signature.
    #[error("Bad PNG signature, found {actual:02x?}")]
    BadSignature {
        /// The bytes found where the signature was expected.
        actual: [u8; 8],
    },

    /// The stream ended inside a chunk's length or type field.
    #[error("Stream ended inside a chunk header")]
    TruncatedChunkHeader,

    /// The stream ended before a chunk's declared data length was read.
    #[error("Stream ended inside the data of chunk {chunk_type:?} ({read} of {expected} bytes)")]
    TruncatedChunkData {
        /// Chunk type, lossily decoded for display.
        chunk_type: String,
        /// Declared data length.
        expected: u32,
        /// Bytes actually read.
        read: usize,
    },

    /// The stream ended inside a chunk's CRC field.
    #[error("Stream ended inside the CRC of chunk {chunk_type:?}")]
    TruncatedChunkCrc {
        /// Chunk type, lossily decoded for display.
        chunk_type: String,
    },

    /// The underlying stream failed.
    #[error("I/O error while reading image stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Pulls one framed PNG image at a time out of a byte stream.
///
/// The reader does not buffer anything itself; wrap unbuffered sources such
/// as child process pipes in a [`std::io::BufReader`] to avoid a syscall per
/// header field.
pub struct ImageStreamReader<R> {
    inner: R,
}

impl<R: Read> ImageStreamReader<R> {
    /// Wrap a byte stream.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read exactly one image into `buffer`, replacing its contents.
    ///
    /// Returns [`ReadStatus::EndOfStream`] when the stream is exhausted at an
    /// image boundary. Chunk CRCs are collected but not verified.
    ///
    /// # Errors
    ///
    /// Returns a [`FramingError`] when the stream is cut off mid-image, does
    /// not start with the PNG signature, or fails with an I/O error. The
    /// buffer then holds the partial data, which the next call discards.
    pub fn read_one(&mut self, buffer: &mut GrowableBuffer) -> Result<ReadStatus, FramingError> {
        read_one(&mut self.inner, buffer)
    }
}

/// Read one framed image from `stream` into `buffer`.
///
/// Free-function form of [`ImageStreamReader::read_one`] for callers that
/// only hold a borrowed stream.
pub fn read_one<R: Read + ?Sized>(
    stream: &mut R,
    buffer: &mut GrowableBuffer,
) -> Result<ReadStatus, FramingError> {
    buffer.clear();

    match buffer.read_into(stream, PNG_SIGNATURE.len())? {
        0 => return Ok(ReadStatus::EndOfStream),
        read if read < PNG_SIGNATURE.len() => {
            return Err(FramingError::TruncatedSignature { read });
        }
        _ => {}
    }

    if buffer.as_slice() != PNG_SIGNATURE {
        let mut actual = [0_u8; 8];
        actual.copy_from_slice(buffer.as_slice());
        return Err(FramingError::BadSignature { actual });
    }

    loop {
        if buffer.read_into(stream, CHUNK_LENGTH_SIZE)? != CHUNK_LENGTH_SIZE {
            return Err(FramingError::TruncatedChunkHeader);
        }
        let length = u32::from_be_bytes(tail(buffer));

        if buffer.read_into(stream, CHUNK_TYPE_SIZE)? != CHUNK_TYPE_SIZE {
            return Err(FramingError::TruncatedChunkHeader);
        }
        let chunk_type: [u8; 4] = tail(buffer);

        let expected = length as usize;
        let mut read = 0;
        while read < expected {
            let step = (expected - read).min(buffer.len().max(MIN_DATA_STEP));
            let received = buffer.read_into(stream, step)?;
            read += received;
            if received < step {
                return Err(FramingError::TruncatedChunkData {
                    chunk_type: String::from_utf8_lossy(&chunk_type).into_owned(),
                    expected: length,
                    read,
                });
            }
        }

        if buffer.read_into(stream, CHUNK_CRC_SIZE)? != CHUNK_CRC_SIZE {
            return Err(FramingError::TruncatedChunkCrc {
                chunk_type: String::from_utf8_lossy(&chunk_type).into_owned(),
            });
        }

        if chunk_type == END_CHUNK_TYPE {
            log::trace!("Framed image of {} bytes", buffer.len());
            return Ok(ReadStatus::Image);
        }
    }
}

/// The last four bytes of the buffer.
fn tail(buffer: &GrowableBuffer) -> [u8; 4] {
    let bytes = buffer.as_slice();
    let mut field = [0_u8; 4];
    field.copy_from_slice(&bytes[bytes.len() - 4..]);
    field
}
