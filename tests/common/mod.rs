#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;

use roadwatch::{
    CameraBackend, CameraSettings, Frame, FrameReader, SourceOpener, SystemOpener,
};

/// One opener call or reader release, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    OpenFile(String),
    OpenCamera(CameraBackend),
    OpenFailed(String),
    Release(String),
}

#[derive(Default)]
struct Ledger {
    steps: Vec<Step>,
    open: usize,
    max_open: usize,
}

/// `SystemOpener` wrapper that records open/release order and how many
/// readers were alive at once.
#[derive(Clone, Default)]
pub struct RecordingOpener {
    ledger: Arc<Mutex<Ledger>>,
}

impl RecordingOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> Vec<Step> {
        self.ledger.lock().unwrap().steps.clone()
    }

    pub fn open_now(&self) -> usize {
        self.ledger.lock().unwrap().open
    }

    pub fn max_open(&self) -> usize {
        self.ledger.lock().unwrap().max_open
    }

    fn opened(&self, step: Step, reader: Result<Box<dyn FrameReader>>) -> Result<Box<dyn FrameReader>> {
        let mut ledger = self.ledger.lock().unwrap();
        match reader {
            Ok(inner) => {
                ledger.steps.push(step);
                ledger.open += 1;
                ledger.max_open = ledger.max_open.max(ledger.open);
                Ok(Box::new(RecordingReader {
                    inner,
                    ledger: Arc::clone(&self.ledger),
                    released: false,
                }))
            }
            Err(err) => {
                ledger.steps.push(Step::OpenFailed(format!("{:?}", step)));
                Err(err)
            }
        }
    }
}

impl SourceOpener for RecordingOpener {
    fn open_file(&self, path: &str) -> Result<Box<dyn FrameReader>> {
        let reader = SystemOpener.open_file(path);
        self.opened(Step::OpenFile(path.to_string()), reader)
    }

    fn open_camera(
        &self,
        backend: CameraBackend,
        settings: &CameraSettings,
    ) -> Result<Box<dyn FrameReader>> {
        let reader = SystemOpener.open_camera(backend, settings);
        self.opened(Step::OpenCamera(backend), reader)
    }
}

struct RecordingReader {
    inner: Box<dyn FrameReader>,
    ledger: Arc<Mutex<Ledger>>,
    released: bool,
}

impl RecordingReader {
    fn mark_released(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut ledger = self.ledger.lock().unwrap();
        ledger.open -= 1;
        ledger.steps.push(Step::Release(self.inner.describe()));
    }
}

impl FrameReader for RecordingReader {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.inner.read_frame()
    }

    fn release(&mut self) {
        self.inner.release();
        self.mark_released();
    }
}

impl Drop for RecordingReader {
    fn drop(&mut self) {
        self.mark_released();
    }
}

pub fn camera_settings(device: &str) -> CameraSettings {
    CameraSettings {
        device: device.to_string(),
        width: 32,
        height: 24,
        fps: 0,
        fourcc: "MJPG".to_string(),
    }
}
