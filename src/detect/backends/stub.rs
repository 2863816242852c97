use anyhow::{anyhow, Result};

use crate::detect::backend::DetectionOracle;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Scripted outcome for one `detect` call.
#[derive(Clone, Debug)]
pub enum StubOutcome {
    Detections(Vec<Detection>),
    Fail(String),
}

/// Stub oracle for tests and the synthetic demo.
///
/// Plays back its script one outcome per call, wrapping around at the end.
/// An empty script reports no detections.
pub struct StubBackend {
    script: Vec<StubOutcome>,
    cursor: usize,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::with_script(Vec::new())
    }

    pub fn with_script(script: Vec<StubOutcome>) -> Self {
        Self {
            script,
            cursor: 0,
            calls: 0,
        }
    }

    /// Every call returns the same detections.
    pub fn always(detections: Vec<Detection>) -> Self {
        Self::with_script(vec![StubOutcome::Detections(detections)])
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionOracle for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let outcome = self.script[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.script.len();
        match outcome {
            StubOutcome::Detections(detections) => Ok(detections),
            StubOutcome::Fail(reason) => Err(anyhow!(
                "stub oracle failure on {}x{} frame: {}",
                frame.width,
                frame.height,
                reason
            )),
        }
    }
}
