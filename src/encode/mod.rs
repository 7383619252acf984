//! JPEG compression for sensors that do not emit JPEG natively.
//!
//! Encoding never touches frame ownership: the caller gets a fresh buffer and
//! still owes the source a release of the original frame.

mod normalize;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::DeviceError;
use crate::frame::{Frame, PixelFormat};
use normalize::EncoderInput;

/// Quality used for stream frames unless configured otherwise.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Compress a raw frame to JPEG at `quality` (clamped to 1..=100).
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, DeviceError> {
    encode_pixels(
        frame.bytes(),
        frame.width,
        frame.height,
        frame.format(),
        quality,
    )
}

pub fn encode_pixels(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    quality: u8,
) -> Result<Vec<u8>, DeviceError> {
    if width == 0 || height == 0 {
        return Err(DeviceError::encode("frame has zero dimensions"));
    }
    let input = normalize::prepare(pixels, width, height, format)?;
    let (buf, color): (&[u8], ExtendedColorType) = match &input {
        EncoderInput::Rgb(rgb) => (rgb.as_ref(), ExtendedColorType::Rgb8),
        EncoderInput::Luma(luma) => (*luma, ExtendedColorType::L8),
    };

    let mut out = Vec::with_capacity(buf.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(buf, width, height, color)
        .map_err(|err| DeviceError::encode(err.to_string()))?;
    Ok(out)
}

/// Cheap SOI/EOI marker check; not a decoder.
pub fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes.starts_with(&[0xFF, 0xD8]) && bytes.ends_with(&[0xFF, 0xD9])
}
