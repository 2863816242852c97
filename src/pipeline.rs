//! Frame processing pipeline.
//!
//! `FramePipeline` turns the active source into a lazy sequence of annotated
//! frames: pull, detect, annotate, publish events. It is pull-driven by the
//! viewer, so a viewer that stops consuming stops the pipeline without
//! touching the source.

use std::sync::Arc;

use crate::annotate::FrameAnnotator;
use crate::detect::SharedOracle;
use crate::error::{is_invalid_frame, StreamError};
use crate::events::{EventQueue, PotholeEvent};
use crate::frame::{AnnotatedFrame, Frame};
use crate::source::{SourceKind, SourceLease, SourceManager};

pub const DEFAULT_MAX_BLANK_FRAMES: u32 = 30;

#[derive(Clone, Copy, Debug)]
pub struct PipelineOptions {
    /// Consecutive zero-sized camera frames tolerated before the stream ends.
    pub max_blank_frames: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_blank_frames: DEFAULT_MAX_BLANK_FRAMES,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub events: u64,
    pub oracle_failures: u64,
    pub skipped: u64,
}

pub struct FramePipeline {
    manager: Arc<SourceManager>,
    lease: SourceLease,
    oracle: SharedOracle,
    annotator: FrameAnnotator,
    queue: Arc<EventQueue>,
    options: PipelineOptions,
    stats: PipelineStats,
    blank_run: u32,
    done: bool,
}

impl FramePipeline {
    pub fn new(
        manager: Arc<SourceManager>,
        lease: SourceLease,
        oracle: SharedOracle,
        annotator: FrameAnnotator,
        queue: Arc<EventQueue>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            manager,
            lease,
            oracle,
            annotator,
            queue,
            options,
            stats: PipelineStats::default(),
            blank_run: 0,
            done: false,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn kind(&self) -> SourceKind {
        self.lease.kind()
    }

    fn end(&mut self, reason: &str) {
        self.done = true;
        let released = self.manager.finish(&self.lease);
        log::info!(
            "FramePipeline: {} stream ended ({}): {} frames, {} events, {} oracle failures, {} skipped{}",
            self.lease.kind().as_str(),
            reason,
            self.stats.frames,
            self.stats.events,
            self.stats.oracle_failures,
            self.stats.skipped,
            if released { ", source released" } else { "" }
        );
    }

    fn process(&mut self, frame: Frame) -> AnnotatedFrame {
        let frame = frame.into_rgb();
        self.stats.frames += 1;

        let detections = match self.oracle.lock() {
            Ok(mut oracle) => oracle
                .detect(&frame)
                .map_err(|err| StreamError::ModelInference(format!("{:#}", err))),
            Err(_) => Err(StreamError::ModelInference(
                "detector lock poisoned".to_string(),
            )),
        };

        match detections {
            Ok(detections) => {
                let annotated = self.annotator.annotate(&frame, detections);
                if annotated.has_qualifying_detection {
                    self.queue.push(PotholeEvent::now());
                    self.stats.events += 1;
                }
                annotated
            }
            Err(err) => {
                self.stats.oracle_failures += 1;
                log::warn!(
                    "FramePipeline: frame {} passed through unannotated: {}",
                    self.stats.frames,
                    err
                );
                AnnotatedFrame::passthrough(frame)
            }
        }
    }
}

impl Iterator for FramePipeline {
    type Item = AnnotatedFrame;

    fn next(&mut self) -> Option<AnnotatedFrame> {
        if self.done {
            return None;
        }
        loop {
            let kind = self.lease.kind();
            if !self.manager.activity().is_active(kind) {
                self.end("stopped");
                return None;
            }
            if !self.manager.is_current(&self.lease) {
                self.end("source replaced");
                return None;
            }

            match self.manager.read_frame(&self.lease) {
                Ok(Some(frame)) => {
                    self.blank_run = 0;
                    return Some(self.process(frame));
                }
                Ok(None) => {
                    self.end("end of stream");
                    return None;
                }
                Err(err) if is_invalid_frame(&err) => match kind {
                    SourceKind::File => {
                        log::warn!("FramePipeline: {:#}", err);
                        self.end("zero-sized frame");
                        return None;
                    }
                    SourceKind::Camera => {
                        self.stats.skipped += 1;
                        self.blank_run += 1;
                        log::debug!("FramePipeline: skipping camera frame: {:#}", err);
                        if self.blank_run >= self.options.max_blank_frames {
                            self.end("too many zero-sized frames");
                            return None;
                        }
                    }
                },
                Err(err) => {
                    log::warn!("FramePipeline: read failed: {:#}", err);
                    self.end("read failure");
                    return None;
                }
            }
        }
    }
}
