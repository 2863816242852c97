//! Roadwatch
//!
//! Road-condition streaming: frames from an uploaded video or a live camera
//! run through a detection model, come back annotated, and are served to
//! viewers as an MJPEG stream while pothole sightings go out over SSE.
//!
//! # Architecture
//!
//! At most one frame source is open at a time. `SourceManager` owns it and the
//! two activity flags (`file_active`, `camera_active`) that pipelines check
//! before every pull. Stopping a source clears the flags, so a running stream
//! ends at its next frame; swapping sources releases the old handle before
//! the new one is opened.
//!
//! # Module Structure
//!
//! - `ingest`: Frame readers (video files, cameras, `stub://` synthetic sources)
//! - `source`: Single-slot source ownership and activity flags
//! - `detect`: Detection oracle trait and backends (stub, tract ONNX)
//! - `annotate`: Box/label drawing and the pothole qualifying rule
//! - `pipeline`: Pull, detect, annotate, publish events
//! - `publish`: Multipart JPEG encoding and stream writing
//! - `events`: Pothole event queue and the SSE notifier
//! - `api`: HTTP control plane and stream endpoints
//! - `config`: TOML/JSON configuration with env overrides

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod publish;
pub mod source;

pub use annotate::FrameAnnotator;
pub use api::{ApiConfig, ApiContext, ApiHandle, ApiServer};
pub use config::RoadwatchConfig;
#[cfg(feature = "backend-tract")]
pub use detect::TractBackend;
pub use detect::{Detection, DetectionOracle, OracleRegistry, SharedOracle, StubBackend};
pub use error::StreamError;
pub use events::{EventNotifier, EventQueue, NotifierMessage, PotholeEvent};
pub use frame::{AnnotatedFrame, Frame, PixelFormat};
pub use ingest::{CameraBackend, CameraSettings, FrameReader, SourceOpener, SystemOpener};
pub use pipeline::{FramePipeline, PipelineOptions, PipelineStats};
pub use publish::{MultipartEncoder, PublishOutcome, PublishStats, StreamPublisher};
pub use source::{ActivityFlags, FlagSnapshot, SourceKind, SourceLease, SourceManager, SourceState};
