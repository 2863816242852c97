//! Camera frame source.
//!
//! `CameraSource` wraps either a V4L2 device (feature `ingest-v4l2`) or a
//! synthetic `stub://` camera. Synthetic cameras understand:
//! - `stub://offline`: the open fails
//! - `stub://dead`: opens, but every read fails
//! - `stub://flaky?blank=K`: after the first good frame, K zero-sized frames
//!   follow before good frames resume
//! - `preferred=fail` on any stub: the preferred backend refuses to open
//! - `frames=N` on any stub: the camera ends after N frames
//!
//! Synthetic cameras are paced at the configured fps.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use super::file::dimension;
use super::stub::{is_stub, synthetic_pixels, StubSpec};
use super::{CameraBackend, CameraSettings, FrameReader};
use crate::error::StreamError;
use crate::frame::Frame;

/// Camera frame source.
pub struct CameraSource {
    device: String,
    backend_kind: CameraBackend,
    backend: Option<CameraBackendImpl>,
    frames_read: u64,
}

enum CameraBackendImpl {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "ingest-v4l2")]
    Device(v4l2::DeviceCamera),
}

impl CameraSource {
    pub fn open(backend: CameraBackend, settings: &CameraSettings) -> Result<Self> {
        let inner = if is_stub(&settings.device) {
            CameraBackendImpl::Synthetic(SyntheticCamera::open(backend, settings)?)
        } else {
            open_device(backend, settings)?
        };
        log::info!(
            "CameraSource: opened {} ({} backend)",
            settings.device,
            backend.as_str()
        );
        Ok(Self {
            device: settings.device.clone(),
            backend_kind: backend,
            backend: Some(inner),
            frames_read: 0,
        })
    }

    pub fn backend(&self) -> CameraBackend {
        self.backend_kind
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(backend: CameraBackend, settings: &CameraSettings) -> Result<CameraBackendImpl> {
    Ok(CameraBackendImpl::Device(v4l2::DeviceCamera::open(
        backend, settings,
    )?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(_backend: CameraBackend, settings: &CameraSettings) -> Result<CameraBackendImpl> {
    bail!(
        "camera {}: device capture requires the ingest-v4l2 feature",
        settings.device
    )
}

impl FrameReader for CameraSource {
    fn describe(&self) -> String {
        format!("camera {} ({})", self.device, self.backend_kind.as_str())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let frame = match self.backend.as_mut() {
            None => return Ok(None),
            Some(CameraBackendImpl::Synthetic(camera)) => camera.next_frame()?,
            #[cfg(feature = "ingest-v4l2")]
            Some(CameraBackendImpl::Device(camera)) => camera.next_frame()?,
        };
        if frame.is_some() {
            self.frames_read += 1;
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if self.backend.take().is_some() {
            log::info!(
                "CameraSource: released {} after {} frames",
                self.device,
                self.frames_read
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic camera (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticCamera {
    dead: bool,
    blank_run: u64,
    frame_limit: Option<u64>,
    width: u32,
    height: u32,
    interval: Option<Duration>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

impl SyntheticCamera {
    fn open(backend: CameraBackend, settings: &CameraSettings) -> Result<Self> {
        let spec = StubSpec::parse(&settings.device)?;
        if spec.name == "offline" {
            bail!("{}: no such device", settings.device);
        }
        if backend == CameraBackend::Preferred && spec.get("preferred") == Some("fail") {
            bail!(
                "{}: {} format not supported",
                settings.device,
                settings.fourcc
            );
        }
        let interval = (settings.fps > 0).then(|| Duration::from_secs(1) / settings.fps);
        Ok(Self {
            dead: spec.name == "dead",
            blank_run: if spec.name == "flaky" {
                spec.get_u64("blank")?.unwrap_or(1)
            } else {
                0
            },
            frame_limit: spec.get_u64("frames")?,
            width: dimension(&spec, "width", settings.width)?,
            height: dimension(&spec, "height", settings.height)?,
            interval,
            last_frame_at: None,
            frame_count: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.dead {
            bail!("camera stopped delivering frames");
        }
        if self.frame_limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        self.pace();
        self.frame_count += 1;
        if self.frame_count > 1 && self.frame_count <= 1 + self.blank_run {
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

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last_frame_at) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 camera using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
mod v4l2 {
    use anyhow::{anyhow, Context, Result};
    use ouroboros::self_referencing;

    use super::super::normalize::{normalize_frame, CaptureFormat};
    use super::super::{CameraBackend, CameraSettings};
    use crate::frame::Frame;

    pub(super) struct DeviceCamera {
        device_path: String,
        state: DeviceState,
        format: CaptureFormat,
        width: u32,
        height: u32,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl DeviceCamera {
        pub(super) fn open(backend: CameraBackend, settings: &CameraSettings) -> Result<Self> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let mut device = v4l::Device::with_path(&settings.device)
                .with_context(|| format!("open v4l2 device {}", settings.device))?;
            let current = device.format().context("read v4l2 format")?;

            let format = match backend {
                CameraBackend::Preferred => {
                    let mut requested = current.clone();
                    requested.width = settings.width;
                    requested.height = settings.height;
                    requested.fourcc = fourcc(&settings.fourcc)?;
                    let applied = device
                        .set_format(&requested)
                        .with_context(|| format!("set {} on {}", settings.fourcc, settings.device))?;
                    if applied.fourcc != requested.fourcc {
                        return Err(anyhow!(
                            "{} refused {} (driver chose {})",
                            settings.device,
                            settings.fourcc,
                            applied.fourcc
                        ));
                    }
                    applied
                }
                CameraBackend::Fallback => {
                    let mut requested = current.clone();
                    requested.width = settings.width;
                    requested.height = settings.height;
                    match device.set_format(&requested) {
                        Ok(applied) => applied,
                        Err(err) => {
                            log::warn!(
                                "CameraSource: failed to set {}x{} on {}: {}",
                                settings.width,
                                settings.height,
                                settings.device,
                                err
                            );
                            current
                        }
                    }
                }
            };

            if settings.fps > 0 {
                let params = v4l::video::capture::Parameters::with_fps(settings.fps);
                if let Err(err) = device.set_params(&params) {
                    log::warn!(
                        "CameraSource: failed to set fps on {}: {}",
                        settings.device,
                        err
                    );
                }
            }

            let capture_format = capture_format(&format.fourcc)?;
            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;

            log::info!(
                "CameraSource: {} streaming {} at {}x{}",
                settings.device,
                format.fourcc,
                format.width,
                format.height
            );

            Ok(Self {
                device_path: settings.device.clone(),
                state,
                format: capture_format,
                width: format.width,
                height: format.height,
            })
        }

        pub(super) fn next_frame(&mut self) -> Result<Option<Frame>> {
            use v4l::io::traits::CaptureStream;

            let device_path = &self.device_path;
            let bytes = self
                .state
                .with_mut(|fields| {
                    fields.stream.next().map(|(buf, meta)| {
                        let used = (meta.bytesused as usize).min(buf.len());
                        let used = if used == 0 { buf.len() } else { used };
                        buf[..used].to_vec()
                    })
                })
                .map_err(|err| {
                    anyhow::Error::new(err).context(format!("capture v4l2 frame from {}", device_path))
                })?;
            normalize_frame(&bytes, self.width, self.height, self.format).map(Some)
        }
    }

    fn fourcc(code: &str) -> Result<v4l::FourCC> {
        let bytes: [u8; 4] = code
            .as_bytes()
            .try_into()
            .map_err(|_| anyhow!("fourcc must be four characters: {:?}", code))?;
        Ok(v4l::FourCC::new(&bytes))
    }

    fn capture_format(fourcc: &v4l::FourCC) -> Result<CaptureFormat> {
        match &fourcc.repr {
            b"MJPG" => Ok(CaptureFormat::Mjpeg),
            b"YUYV" => Ok(CaptureFormat::Yuyv),
            b"RGB3" => Ok(CaptureFormat::Rgb24),
            b"GREY" => Ok(CaptureFormat::Gray8),
            b"NV12" => Ok(CaptureFormat::Nv12),
            _ => Err(anyhow!("unsupported camera pixel format {}", fourcc)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_invalid_frame;

    fn settings(device: &str) -> CameraSettings {
        CameraSettings {
            device: device.to_string(),
            width: 32,
            height: 24,
            fps: 0,
            fourcc: "MJPG".to_string(),
        }
    }

    #[test]
    fn stub_camera_produces_configured_size() -> Result<()> {
        let mut camera = CameraSource::open(CameraBackend::Preferred, &settings("stub://cam"))?;
        let frame = camera.read_frame()?.expect("frame");
        assert_eq!((frame.width, frame.height), (32, 24));
        Ok(())
    }

    #[test]
    fn offline_camera_fails_to_open() {
        assert!(CameraSource::open(CameraBackend::Preferred, &settings("stub://offline")).is_err());
        assert!(CameraSource::open(CameraBackend::Fallback, &settings("stub://offline")).is_err());
    }

    #[test]
    fn dead_camera_opens_but_cannot_read() -> Result<()> {
        let mut camera = CameraSource::open(CameraBackend::Preferred, &settings("stub://dead"))?;
        assert!(camera.read_frame().is_err());
        Ok(())
    }

    #[test]
    fn preferred_failure_only_affects_preferred_backend() -> Result<()> {
        let device = settings("stub://cam?preferred=fail");
        assert!(CameraSource::open(CameraBackend::Preferred, &device).is_err());
        let camera = CameraSource::open(CameraBackend::Fallback, &device)?;
        assert_eq!(camera.backend(), CameraBackend::Fallback);
        Ok(())
    }

    #[test]
    fn flaky_camera_yields_blank_run_after_first_frame() -> Result<()> {
        let mut camera =
            CameraSource::open(CameraBackend::Preferred, &settings("stub://flaky?blank=2"))?;
        assert!(camera.read_frame()?.is_some());
        assert!(is_invalid_frame(&camera.read_frame().unwrap_err()));
        assert!(is_invalid_frame(&camera.read_frame().unwrap_err()));
        assert!(camera.read_frame()?.is_some());
        Ok(())
    }

    #[test]
    fn frame_limit_ends_stream() -> Result<()> {
        let mut camera =
            CameraSource::open(CameraBackend::Preferred, &settings("stub://cam?frames=2"))?;
        assert!(camera.read_frame()?.is_some());
        assert!(camera.read_frame()?.is_some());
        assert!(camera.read_frame()?.is_none());
        Ok(())
    }
}
