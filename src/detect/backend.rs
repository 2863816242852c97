use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object-detection oracle.
///
/// The model behind an oracle is opaque to the streaming core: one frame in,
/// an ordered list of detections out. Calls are synchronous and may be slow.
/// A failed call is recoverable; the pipeline logs it and passes the frame
/// through unannotated.
///
/// Implementations must treat the frame as read-only.
pub trait DetectionOracle: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
