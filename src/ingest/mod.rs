//! Frame ingestion sources.
//!
//! This module provides the readers behind the source lifecycle:
//! - Local video files (`FileSource`): MJPEG files always, other containers
//!   with the `ingest-file-ffmpeg` feature
//! - Cameras (`CameraSource`): V4L2 devices with the `ingest-v4l2` feature
//! - Synthetic `stub://` sources for tests and the demo
//!
//! Readers are opened through a `SourceOpener` so the `SourceManager` can be
//! driven by a recording opener in tests. A reader hands out one normalised
//! RGB `Frame` per call; `None` means end of stream. A zero-sized sample is
//! reported as an `InvalidFrame` error and left to the caller to classify.

pub mod camera;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
mod normalize;
mod stub;

use anyhow::Result;

use crate::frame::Frame;

pub use camera::CameraSource;
pub use file::FileSource;

/// A single open video source.
pub trait FrameReader: Send {
    /// Human-readable source description for logs.
    fn describe(&self) -> String;

    /// Pull the next frame. `Ok(None)` is end of stream.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying handle. Further reads report end of stream.
    fn release(&mut self);
}

/// Capture API used when opening a camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraBackend {
    /// Request the configured compressed format via mmap streaming.
    Preferred,
    /// Open the device with whatever format it currently has.
    Fallback,
}

impl CameraBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            CameraBackend::Preferred => "preferred",
            CameraBackend::Fallback => "fallback",
        }
    }
}

/// Capture parameters requested from a camera. Applied best-effort.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub fourcc: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            fourcc: "MJPG".to_string(),
        }
    }
}

/// Opens frame readers for the source manager.
pub trait SourceOpener: Send + Sync {
    fn open_file(&self, path: &str) -> Result<Box<dyn FrameReader>>;

    fn open_camera(
        &self,
        backend: CameraBackend,
        settings: &CameraSettings,
    ) -> Result<Box<dyn FrameReader>>;
}

/// Production opener backed by `FileSource` and `CameraSource`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemOpener;

impl SourceOpener for SystemOpener {
    fn open_file(&self, path: &str) -> Result<Box<dyn FrameReader>> {
        Ok(Box::new(FileSource::open(path)?))
    }

    fn open_camera(
        &self,
        backend: CameraBackend,
        settings: &CameraSettings,
    ) -> Result<Box<dyn FrameReader>> {
        Ok(Box::new(CameraSource::open(backend, settings)?))
    }
}
