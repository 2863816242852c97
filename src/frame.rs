//! Frame buffers flowing through the pipeline.
//!
//! - `Frame`: one decoded image sample from a source. Dimensions are checked at
//!   construction; a zero-sized or truncated buffer never becomes a `Frame`.
//! - `AnnotatedFrame`: a frame with detection overlays drawn in, plus the
//!   qualifying-detection flag. Created per input frame, handed to the encoder,
//!   then dropped.

use image::{GrayImage, RgbImage};

use crate::detect::Detection;
use crate::error::StreamError;

/// Pixel layout of a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, 3 bytes per pixel.
    Rgb8,
    /// 8-bit luma, 1 byte per pixel.
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One raw image sample from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Frame {
    /// Build a frame, rejecting zero dimensions and buffer length mismatches.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, StreamError> {
        if width == 0 || height == 0 {
            return Err(StreamError::InvalidFrame {
                width,
                height,
                reason: "zero dimension".to_string(),
            });
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(format.bytes_per_pixel()))
            .ok_or_else(|| StreamError::InvalidFrame {
                width,
                height,
                reason: "dimensions overflow".to_string(),
            })?;
        if data.len() != expected {
            return Err(StreamError::InvalidFrame {
                width,
                height,
                reason: format!("expected {} bytes, got {}", expected, data.len()),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    pub fn rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self, StreamError> {
        Self::new(data, width, height, PixelFormat::Rgb8)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Normalise to 3-channel colour. Grayscale is expanded, RGB passes through.
    pub fn into_rgb(self) -> Frame {
        match self.format {
            PixelFormat::Rgb8 => self,
            PixelFormat::Gray8 => {
                let mut rgb = Vec::with_capacity(self.data.len() * 3);
                for &luma in &self.data {
                    rgb.extend_from_slice(&[luma, luma, luma]);
                }
                Frame {
                    data: rgb,
                    width: self.width,
                    height: self.height,
                    format: PixelFormat::Rgb8,
                }
            }
        }
    }

    /// Copy the frame into an `RgbImage` for drawing and encoding.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        match self.format {
            PixelFormat::Rgb8 => RgbImage::from_raw(self.width, self.height, self.data.clone()),
            PixelFormat::Gray8 => GrayImage::from_raw(self.width, self.height, self.data.clone())
                .map(|gray| image::DynamicImage::ImageLuma8(gray).to_rgb8()),
        }
    }

    pub fn from_rgb_image(image: RgbImage) -> Result<Self, StreamError> {
        let (width, height) = image.dimensions();
        Self::rgb(image.into_raw(), width, height)
    }
}

/// A frame with detection overlays and the qualifying-detection flag.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    pub has_qualifying_detection: bool,
}

impl AnnotatedFrame {
    /// Unannotated result, used when the oracle failed for this frame.
    pub fn passthrough(frame: Frame) -> Self {
        Self {
            frame,
            detections: Vec::new(),
            has_qualifying_detection: false,
        }
    }
}
