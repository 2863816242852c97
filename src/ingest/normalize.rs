use anyhow::{anyhow, Context, Result};

use crate::frame::{Frame, PixelFormat};

/// Layout of the bytes a capture backend hands over.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CaptureFormat {
    Rgb24,
    Gray8,
    Nv12,
    Yuyv,
    Mjpeg,
}

/// Convert captured bytes into a colour `Frame`.
///
/// Zero dimensions surface as `StreamError::InvalidFrame` inside the `anyhow`
/// error so callers can tell a blank frame from a broken device.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
pub(crate) fn normalize_frame(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: CaptureFormat,
) -> Result<Frame> {
    let frame = match format {
        CaptureFormat::Rgb24 => Frame::new(pixels.to_vec(), width, height, PixelFormat::Rgb8)?,
        CaptureFormat::Gray8 => {
            Frame::new(pixels.to_vec(), width, height, PixelFormat::Gray8)?.into_rgb()
        }
        CaptureFormat::Nv12 => {
            ensure_dimensions(width, height)?;
            Frame::rgb(nv12_to_rgb(pixels, width, height)?, width, height)?
        }
        CaptureFormat::Yuyv => {
            ensure_dimensions(width, height)?;
            Frame::rgb(yuyv_to_rgb(pixels, width, height)?, width, height)?
        }
        CaptureFormat::Mjpeg => decode_jpeg(pixels)?,
    };
    Ok(frame)
}

/// Decode one JPEG image into an RGB frame.
pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    Ok(Frame::from_rgb_image(image.into_rgb8())?)
}

fn ensure_dimensions(width: u32, height: u32) -> Result<()> {
    // Frame::new produces the typed InvalidFrame error for us.
    if width == 0 || height == 0 {
        Frame::rgb(Vec::new(), width, height)?;
    }
    Ok(())
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane
        .checked_add(y_plane / 2)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;
            write_rgb(&mut rgb[(j * w + i) * 3..], y, u, v);
        }
    }

    Ok(rgb)
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixel_count = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if width % 2 != 0 || pixels.len() != pixel_count * 2 {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {} for {}x{}, got {}",
            pixel_count * 2,
            width,
            height,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; pixel_count * 3];
    for (pair, chunk) in pixels.chunks_exact(4).enumerate() {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        let offset = pair * 6;
        write_rgb(&mut rgb[offset..], chunk[0] as f32, u, v);
        write_rgb(&mut rgb[offset + 3..], chunk[2] as f32, u, v);
    }
    Ok(rgb)
}

fn write_rgb(out: &mut [u8], y: f32, u: f32, v: f32) {
    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    out[0] = clamp_to_u8(r);
    out[1] = clamp_to_u8(g);
    out[2] = clamp_to_u8(b);
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Locate the first complete JPEG (SOI..EOI) in a byte buffer.
pub(crate) fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_invalid_frame;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let frame = normalize_frame(&nv12, 2, 2, CaptureFormat::Nv12)?;
        assert_eq!(frame.pixels(), &[128u8; 12]);
        Ok(())
    }

    #[test]
    fn yuyv_conversion_produces_gray() -> Result<()> {
        let yuyv = vec![90u8, 128, 90, 128];
        let frame = normalize_frame(&yuyv, 2, 1, CaptureFormat::Yuyv)?;
        assert_eq!(frame.pixels(), &[90u8; 6]);
        Ok(())
    }

    #[test]
    fn gray_frames_become_rgb() -> Result<()> {
        let frame = normalize_frame(&[5u8, 6], 1, 2, CaptureFormat::Gray8)?;
        assert_eq!(frame.pixels(), &[5, 5, 5, 6, 6, 6]);
        Ok(())
    }

    #[test]
    fn zero_sized_capture_is_invalid_frame() {
        let err = normalize_frame(&[], 0, 0, CaptureFormat::Yuyv).unwrap_err();
        assert!(is_invalid_frame(&err));
    }

    #[test]
    fn jpeg_bounds_skip_leading_garbage() {
        let buffer = [0x00, 0x11, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x33];
        assert_eq!(find_jpeg_bounds(&buffer), Some((2, 8)));
        assert_eq!(find_jpeg_bounds(&buffer[..7]), None);
    }
}
