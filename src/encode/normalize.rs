use crate::error::DeviceError;
use crate::frame::{nv12_chroma_stride, PixelFormat};

/// Bytes ready for the JPEG encoder, with the colour layout they use.
pub(crate) enum EncoderInput<'a> {
    Rgb(std::borrow::Cow<'a, [u8]>),
    Luma(&'a [u8]),
}

/// Validate a raw frame and convert it to a layout the encoder accepts.
pub(crate) fn prepare(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<EncoderInput<'_>, DeviceError> {
    match format {
        PixelFormat::Rgb24 => {
            expect_len(pixels, plane_len(width, height, 3)?, "RGB")?;
            Ok(EncoderInput::Rgb(pixels.into()))
        }
        PixelFormat::Gray8 => {
            expect_len(pixels, plane_len(width, height, 1)?, "gray")?;
            Ok(EncoderInput::Luma(pixels))
        }
        PixelFormat::Nv12 => Ok(EncoderInput::Rgb(nv12_to_rgb(pixels, width, height)?.into())),
        PixelFormat::Jpeg => Err(DeviceError::encode(
            "frame is already JPEG; nothing to prepare",
        )),
    }
}

fn plane_len(width: u32, height: u32, channels: u32) -> Result<usize, DeviceError> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(channels))
        .map(|v| v as usize)
        .ok_or_else(|| DeviceError::encode("frame dimensions overflow"))
}

fn expect_len(pixels: &[u8], expected: usize, label: &str) -> Result<(), DeviceError> {
    if pixels.len() != expected {
        return Err(DeviceError::encode(format!(
            "{} frame length mismatch: expected {}, got {}",
            label,
            expected,
            pixels.len()
        )));
    }
    Ok(())
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DeviceError> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = plane_len(width, height, 1)?;
    let expected = PixelFormat::Nv12
        .raw_len(width, height)
        .ok_or_else(|| DeviceError::encode("NV12 frame dimensions overflow"))?;
    expect_len(pixels, expected, "NV12")?;
    let stride = nv12_chroma_stride(width);

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * stride + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(y + 1.402_f32 * v);
            rgb[offset + 1] = clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v);
            rgb[offset + 2] = clamp_to_u8(y + 1.772_f32 * u);
        }
    }

    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
