//! MJPEG stream publishing.
//!
//! Each annotated frame becomes one JPEG record in a
//! `multipart/x-mixed-replace` body:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! ```
//!
//! The stream has no terminating boundary; it simply stops when the pipeline
//! ends. One publisher drives one pipeline: two viewers of the same source
//! each pull their own frames from the shared reader, so neither sees every
//! frame.

use std::io::Write;

use image::codecs::jpeg::JpegEncoder;

use crate::error::StreamError;
use crate::frame::AnnotatedFrame;

pub const DEFAULT_BOUNDARY: &str = "frame";

/// Encodes annotated frames into multipart JPEG records.
#[derive(Clone, Debug)]
pub struct MultipartEncoder {
    boundary: String,
    quality: u8,
}

impl MultipartEncoder {
    pub fn new(boundary: impl Into<String>, quality: u8) -> Self {
        Self {
            boundary: boundary.into(),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    pub fn encode_jpeg(&self, frame: &AnnotatedFrame) -> Result<Vec<u8>, StreamError> {
        let image = frame.frame.to_rgb_image().ok_or_else(|| {
            StreamError::Encoding(format!(
                "{}x{} frame buffer does not match its dimensions",
                frame.frame.width, frame.frame.height
            ))
        })?;
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(&image)
            .map_err(|err| StreamError::Encoding(format!("JPEG encode failed: {err}")))?;
        Ok(jpeg)
    }

    /// One complete multipart record for `frame`.
    pub fn encode(&self, frame: &AnnotatedFrame) -> Result<Vec<u8>, StreamError> {
        let jpeg = self.encode_jpeg(frame)?;
        let mut record = Vec::with_capacity(jpeg.len() + self.boundary.len() + 48);
        record.extend_from_slice(b"--");
        record.extend_from_slice(self.boundary.as_bytes());
        record.extend_from_slice(b"\r\n");
        record.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
        record.extend_from_slice(&jpeg);
        record.extend_from_slice(b"\r\n");
        Ok(record)
    }
}

impl Default for MultipartEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDARY, 90)
    }
}

/// How a publish run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The frame sequence ran out.
    Completed,
    /// Writing to the viewer failed; the viewer is gone.
    ViewerDisconnected,
    /// A frame could not be encoded; the stream was cut short.
    EncodingFailed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub outcome: PublishOutcome,
}

/// Writes a frame sequence to one viewer.
#[derive(Clone, Debug, Default)]
pub struct StreamPublisher {
    encoder: MultipartEncoder,
}

impl StreamPublisher {
    pub fn new(encoder: MultipartEncoder) -> Self {
        Self { encoder }
    }

    pub fn encoder(&self) -> &MultipartEncoder {
        &self.encoder
    }

    /// Encode and write frames until the sequence ends, encoding fails or the
    /// viewer goes away. Dropping the sequence on return stops the pipeline.
    pub fn publish<I, W>(&self, frames: I, writer: &mut W) -> PublishStats
    where
        I: IntoIterator<Item = AnnotatedFrame>,
        W: Write,
    {
        let mut frames_sent = 0u64;
        let mut bytes_sent = 0u64;

        for frame in frames {
            let record = match self.encoder.encode(&frame) {
                Ok(record) => record,
                Err(err) => {
                    log::error!("StreamPublisher: {}", err);
                    return PublishStats {
                        frames_sent,
                        bytes_sent,
                        outcome: PublishOutcome::EncodingFailed(err.to_string()),
                    };
                }
            };
            if let Err(err) = writer.write_all(&record).and_then(|_| writer.flush()) {
                log::info!(
                    "StreamPublisher: viewer disconnected after {} frames: {}",
                    frames_sent,
                    err
                );
                return PublishStats {
                    frames_sent,
                    bytes_sent,
                    outcome: PublishOutcome::ViewerDisconnected,
                };
            }
            frames_sent += 1;
            bytes_sent += record.len() as u64;
        }

        log::debug!("StreamPublisher: stream complete after {} frames", frames_sent);
        PublishStats {
            frames_sent,
            bytes_sent,
            outcome: PublishOutcome::Completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn frame(shade: u8) -> AnnotatedFrame {
        AnnotatedFrame::passthrough(Frame::rgb(vec![shade; 8 * 6 * 3], 8, 6).unwrap())
    }

    fn count_records(body: &[u8], boundary: &str) -> usize {
        let marker = format!("--{}\r\n", boundary);
        body.windows(marker.len())
            .filter(|w| *w == marker.as_bytes())
            .count()
    }

    struct BrokenPipe {
        accepted: usize,
    }

    impl Write for BrokenPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.accepted == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "viewer went away",
                ));
            }
            self.accepted -= 1;
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn record_layout() {
        let encoder = MultipartEncoder::default();
        let record = encoder.encode(&frame(50)).unwrap();
        assert!(record.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        assert!(record.ends_with(b"\xFF\xD9\r\n"));
        assert_eq!(
            encoder.content_type(),
            "multipart/x-mixed-replace; boundary=frame"
        );
    }

    #[test]
    fn n_frames_produce_n_records() {
        let publisher = StreamPublisher::new(MultipartEncoder::new("frame", 95));
        let mut body = Vec::new();
        let stats = publisher.publish((0..5).map(|i| frame(i * 40)), &mut body);

        assert_eq!(stats.outcome, PublishOutcome::Completed);
        assert_eq!(stats.frames_sent, 5);
        assert_eq!(stats.bytes_sent, body.len() as u64);
        assert_eq!(count_records(&body, "frame"), 5);
        // no terminating boundary
        assert!(!body.ends_with(b"--frame--\r\n"));
    }

    #[test]
    fn empty_sequence_writes_nothing() {
        let mut body = Vec::new();
        let stats = StreamPublisher::default().publish(Vec::new(), &mut body);
        assert_eq!(stats.frames_sent, 0);
        assert!(body.is_empty());
    }

    #[test]
    fn write_failure_means_viewer_left() {
        let mut pipe = BrokenPipe { accepted: 2 };
        let stats = StreamPublisher::default().publish((0..10).map(|_| frame(10)), &mut pipe);
        assert_eq!(stats.outcome, PublishOutcome::ViewerDisconnected);
        assert_eq!(stats.frames_sent, 2);
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(MultipartEncoder::new("frame", 0).quality(), 1);
        assert_eq!(MultipartEncoder::new("frame", 200).quality(), 100);
    }
}
