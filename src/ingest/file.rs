//! Local file frame source.
//!
//! `FileSource` reads a finite clip from a local path:
//! - `stub://<name>?frames=N` synthetic clips (N defaults to 30; `blank=K`
//!   makes frame K zero-sized, `fail=K` makes read K fail, both 1-based;
//!   `width`/`height` default to 160x120)
//! - `.mjpg` / `.mjpeg` files holding concatenated JPEG images
//! - anything else through FFmpeg when `ingest-file-ffmpeg` is enabled
//!
//! URL schemes other than `stub://` are rejected; missing files fail to open.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::normalize::{decode_jpeg, find_jpeg_bounds};
use super::stub::{is_stub, synthetic_pixels, StubSpec};
use super::FrameReader;
use crate::error::StreamError;
use crate::frame::Frame;

const DEFAULT_STUB_FRAMES: u64 = 30;
const DEFAULT_STUB_WIDTH: u32 = 160;
const DEFAULT_STUB_HEIGHT: u32 = 120;

/// Local file frame source.
pub struct FileSource {
    path: String,
    backend: Option<FileBackend>,
    frames_read: u64,
}

enum FileBackend {
    Synthetic(SyntheticFileSource),
    Mjpeg(MjpegFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn open(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            bail!("empty file path");
        }
        let backend = if is_stub(path) {
            FileBackend::Synthetic(SyntheticFileSource::new(path)?)
        } else {
            if path.contains("://") {
                bail!("file ingestion only supports local paths (no URL schemes)");
            }
            if !Path::new(path).is_file() {
                bail!("file not found: {}", path);
            }
            if is_mjpeg_path(path) {
                FileBackend::Mjpeg(MjpegFileSource::new(path)?)
            } else {
                open_container(path)?
            }
        };
        log::info!("FileSource: opened {}", path);
        Ok(Self {
            path: path.to_string(),
            backend: Some(backend),
            frames_read: 0,
        })
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_container(path: &str) -> Result<FileBackend> {
    Ok(FileBackend::Ffmpeg(FfmpegFileSource::new(path)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_container(path: &str) -> Result<FileBackend> {
    Err(anyhow!(
        "{}: only .mjpg/.mjpeg files are supported without the ingest-file-ffmpeg feature",
        path
    ))
}

fn is_mjpeg_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("mjpg") || ext.eq_ignore_ascii_case("mjpeg"))
        .unwrap_or(false)
}

impl FrameReader for FileSource {
    fn describe(&self) -> String {
        format!("file {}", self.path)
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let frame = match self.backend.as_mut() {
            None => return Ok(None),
            Some(FileBackend::Synthetic(source)) => source.next_frame()?,
            Some(FileBackend::Mjpeg(source)) => source.next_frame()?,
            #[cfg(feature = "ingest-file-ffmpeg")]
            Some(FileBackend::Ffmpeg(source)) => source.next_frame()?,
        };
        if frame.is_some() {
            self.frames_read += 1;
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if self.backend.take().is_some() {
            log::info!(
                "FileSource: released {} after {} frames",
                self.path,
                self.frames_read
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticFileSource {
    frames: u64,
    blank_at: Option<u64>,
    fail_at: Option<u64>,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticFileSource {
    fn new(path: &str) -> Result<Self> {
        let spec = StubSpec::parse(path)?;
        Ok(Self {
            frames: spec.get_u64("frames")?.unwrap_or(DEFAULT_STUB_FRAMES),
            blank_at: spec.get_u64("blank")?,
            fail_at: spec.get_u64("fail")?,
            width: dimension(&spec, "width", DEFAULT_STUB_WIDTH)?,
            height: dimension(&spec, "height", DEFAULT_STUB_HEIGHT)?,
            frame_count: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.frame_count >= self.frames {
            return Ok(None);
        }
        self.frame_count += 1;
        if self.fail_at == Some(self.frame_count) {
            bail!("synthetic read failure at frame {}", self.frame_count);
        }
        if self.blank_at == Some(self.frame_count) {
            return Err(StreamError::InvalidFrame {
                width: 0,
                height: 0,
                reason: format!("synthetic blank frame {}", self.frame_count),
            }
            .into());
        }
        let pixels = synthetic_pixels(self.width, self.height, self.frame_count);
        Ok(Some(Frame::rgb(pixels, self.width, self.height)?))
    }
}

pub(crate) fn dimension(spec: &StubSpec, key: &str, default: u32) -> Result<u32> {
    match spec.get_u64(key)? {
        None => Ok(default),
        Some(value) => u32::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| anyhow!("stub parameter {}={} out of range", key, value)),
    }
}

// ----------------------------------------------------------------------------
// MJPEG file source (concatenated JPEG images)
// ----------------------------------------------------------------------------

struct MjpegFileSource {
    data: Vec<u8>,
    offset: usize,
}

impl MjpegFileSource {
    fn new(path: &str) -> Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("read mjpeg file {}", path))?;
        if find_jpeg_bounds(&data).is_none() {
            return Err(StreamError::InvalidFrame {
                width: 0,
                height: 0,
                reason: format!("{} holds no complete JPEG image", path),
            }
            .into());
        }
        Ok(Self { data, offset: 0 })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let remaining = &self.data[self.offset..];
        let Some((start, end)) = find_jpeg_bounds(remaining) else {
            return Ok(None);
        };
        let jpeg = &remaining[start..end];
        self.offset += end;
        decode_jpeg(jpeg).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_invalid_frame;
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;
    use std::io::Write;

    fn jpeg(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let pixels = vec![shade; (width * height * 3) as usize];
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode(&pixels, width, height, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn stub_file_yields_requested_frame_count() -> Result<()> {
        let mut source = FileSource::open("stub://clip?frames=3&width=8&height=6")?;
        let mut count = 0;
        while let Some(frame) = source.read_frame()? {
            assert_eq!((frame.width, frame.height), (8, 6));
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(source.frames_read(), 3);
        Ok(())
    }

    #[test]
    fn stub_file_blank_and_fail_markers() -> Result<()> {
        let mut source = FileSource::open("stub://clip?frames=4&blank=2&fail=3")?;
        assert!(source.read_frame()?.is_some());
        let blank = source.read_frame().unwrap_err();
        assert!(is_invalid_frame(&blank));
        let failed = source.read_frame().unwrap_err();
        assert!(!is_invalid_frame(&failed));
        Ok(())
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = FileSource::open("/nonexistent/road.mp4").err().unwrap();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn url_schemes_are_rejected() {
        assert!(FileSource::open("rtsp://camera.local/stream").is_err());
    }

    #[test]
    fn mjpeg_file_decodes_each_image() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("road.mjpg");
        let mut file = std::fs::File::create(&path)?;
        file.write_all(&jpeg(16, 8, 40))?;
        file.write_all(&jpeg(16, 8, 200))?;
        drop(file);

        let mut source = FileSource::open(path.to_str().unwrap())?;
        let first = source.read_frame()?.expect("first frame");
        assert_eq!((first.width, first.height), (16, 8));
        assert!(source.read_frame()?.is_some());
        assert!(source.read_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn released_source_reports_end_of_stream() -> Result<()> {
        let mut source = FileSource::open("stub://clip?frames=5")?;
        source.release();
        assert!(source.read_frame()?.is_none());
        Ok(())
    }
}
