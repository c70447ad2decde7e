//! Framed image stream integration tests.
//!
//! Fixtures are real PNG files encoded with the `image` crate.

use std::io::Cursor;

use anime_upscaler::{
    FramingError, GrowableBuffer, ImageStreamReader, PNG_SIGNATURE, ReadStatus, read_one,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([shade, shade / 2, 255 - shade]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("Failed to encode PNG fixture");
    bytes
}

/// A single chunk with a dummy CRC.
fn chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(data.len() as u32).to_be_bytes());
    bytes.extend_from_slice(chunk_type);
    bytes.extend_from_slice(data);
    bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    bytes
}

// ── Round trip ─────────────────────────────────────────────────────

#[test]
fn reads_concatenated_images_in_order() {
    let images: Vec<Vec<u8>> = (0..5_u8).map(|index| png(4 + index as u32, 3, index * 40)).collect();
    let stream: Vec<u8> = images.concat();

    let mut reader = ImageStreamReader::new(Cursor::new(stream));
    let mut buffer = GrowableBuffer::new();

    for expected in &images {
        let status = reader.read_one(&mut buffer).expect("Failed to read image");
        assert_eq!(status, ReadStatus::Image);
        assert_eq!(buffer.as_slice(), expected.as_slice());
    }
    assert_eq!(
        reader.read_one(&mut buffer).expect("Failed to read end"),
        ReadStatus::EndOfStream
    );
    // Exhaustion is sticky.
    assert_eq!(
        reader.read_one(&mut buffer).expect("Failed to read end"),
        ReadStatus::EndOfStream
    );
}

#[test]
fn framed_images_decode() {
    let stream = [png(8, 6, 10), png(2, 2, 200)].concat();
    let mut cursor = Cursor::new(stream);
    let mut buffer = GrowableBuffer::new();

    read_one(&mut cursor, &mut buffer).expect("Failed to read image");
    let first = image::load_from_memory(buffer.as_slice()).expect("Failed to decode first");
    assert_eq!((first.width(), first.height()), (8, 6));

    read_one(&mut cursor, &mut buffer).expect("Failed to read image");
    let second = image::load_from_memory(buffer.as_slice()).expect("Failed to decode second");
    assert_eq!((second.width(), second.height()), (2, 2));
}

#[test]
fn empty_stream_is_end_of_stream() {
    let mut buffer = GrowableBuffer::new();
    let status = read_one(&mut Cursor::new(Vec::new()), &mut buffer).expect("Failed to read");
    assert_eq!(status, ReadStatus::EndOfStream);
    assert!(buffer.is_empty());
}

#[test]
fn chunk_order_is_not_checked() {
    // Only the chunk structure matters: no IHDR, unknown chunk types.
    let mut stream = PNG_SIGNATURE.to_vec();
    stream.extend(chunk(b"zzZZ", b"whatever"));
    stream.extend(chunk(b"tEXt", b""));
    stream.extend(chunk(b"IEND", b""));
    let expected = stream.clone();

    let mut buffer = GrowableBuffer::new();
    let status = read_one(&mut Cursor::new(stream), &mut buffer).expect("Failed to read");
    assert_eq!(status, ReadStatus::Image);
    assert_eq!(buffer.as_slice(), expected.as_slice());
}

#[test]
fn crc_is_not_validated() {
    let mut stream = PNG_SIGNATURE.to_vec();
    stream.extend(chunk(b"IEND", b""));

    let mut buffer = GrowableBuffer::new();
    let status = read_one(&mut Cursor::new(stream), &mut buffer).expect("Failed to read");
    assert_eq!(status, ReadStatus::Image);
}

// ── Malformed streams ──────────────────────────────────────────────

#[test]
fn truncation_inside_chunk_header() {
    let mut stream = png(4, 4, 0);
    // Signature plus two bytes of the first chunk length.
    stream.truncate(PNG_SIGNATURE.len() + 2);

    let mut buffer = GrowableBuffer::new();
    let error = read_one(&mut Cursor::new(stream), &mut buffer).unwrap_err();
    assert!(matches!(error, FramingError::TruncatedChunkHeader));
}

#[test]
fn truncation_after_complete_image() {
    let complete = png(4, 4, 0);
    let mut stream = complete.clone();
    stream.extend_from_slice(&complete[..PNG_SIGNATURE.len() + 6]);

    let mut cursor = Cursor::new(stream);
    let mut buffer = GrowableBuffer::new();
    assert_eq!(read_one(&mut cursor, &mut buffer).expect("Failed to read"), ReadStatus::Image);
    let error = read_one(&mut cursor, &mut buffer).unwrap_err();
    assert!(matches!(error, FramingError::TruncatedChunkHeader));
}

#[test]
fn truncation_inside_chunk_data() {
    let mut stream = PNG_SIGNATURE.to_vec();
    stream.extend(chunk(b"IDAT", &[1, 2, 3, 4, 5, 6]));
    stream.truncate(stream.len() - 4 - 3);

    let mut buffer = GrowableBuffer::new();
    let error = read_one(&mut Cursor::new(stream), &mut buffer).unwrap_err();
    match error {
        FramingError::TruncatedChunkData {
            chunk_type,
            expected,
            read,
        } => {
            assert_eq!(chunk_type, "IDAT");
            assert_eq!(expected, 6);
            assert_eq!(read, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn oversized_length_only_allocates_what_arrives() {
    let mut stream = PNG_SIGNATURE.to_vec();
    stream.extend_from_slice(&0x7FFF_FFF0_u32.to_be_bytes());
    stream.extend_from_slice(b"IDAT");
    stream.extend_from_slice(&[1, 2, 3]);

    let mut buffer = GrowableBuffer::new();
    let error = read_one(&mut Cursor::new(stream), &mut buffer).unwrap_err();
    match error {
        FramingError::TruncatedChunkData { expected, read, .. } => {
            assert_eq!(expected, 0x7FFF_FFF0);
            assert_eq!(read, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(buffer.capacity() <= 128 * 1024, "capacity grew to {}", buffer.capacity());
}

#[test]
fn large_chunk_is_read_in_full() {
    let data: Vec<u8> = (0..300_000_u32).map(|index| (index % 251) as u8).collect();
    let mut stream = PNG_SIGNATURE.to_vec();
    stream.extend(chunk(b"IDAT", &data));
    stream.extend(chunk(b"IEND", b""));

    let mut buffer = GrowableBuffer::new();
    let status = read_one(&mut Cursor::new(stream.clone()), &mut buffer).expect("Read failed");
    assert_eq!(status, ReadStatus::Image);
    assert_eq!(buffer.as_slice(), stream.as_slice());
    assert!(buffer.capacity() < 2 * stream.len());
}

#[test]
fn truncation_inside_crc() {
    let mut stream = PNG_SIGNATURE.to_vec();
    stream.extend(chunk(b"IEND", b""));
    stream.pop();

    let mut buffer = GrowableBuffer::new();
    let error = read_one(&mut Cursor::new(stream), &mut buffer).unwrap_err();
    assert!(matches!(error, FramingError::TruncatedChunkCrc { .. }));
}

#[test]
fn truncated_signature() {
    let mut buffer = GrowableBuffer::new();
    let error = read_one(&mut Cursor::new(PNG_SIGNATURE[..5].to_vec()), &mut buffer).unwrap_err();
    assert!(matches!(error, FramingError::TruncatedSignature { read: 5 }));
}

#[test]
fn bad_signature() {
    let mut buffer = GrowableBuffer::new();
    let error = read_one(&mut Cursor::new(b"GIF89a\0\0rest".to_vec()), &mut buffer).unwrap_err();
    match error {
        FramingError::BadSignature { actual } => assert_eq!(&actual, b"GIF89a\0\0"),
        other => panic!("unexpected error: {other}"),
    }
}
