use anyhow::Result;

use crate::frame::{Detection, Frame};

/// Object detector.
///
/// Maps one frame to a list of detections with boxes in that frame's pixel
/// coordinates. The model behind it is opaque to the rest of the crate.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Order of the returned list is preserved
    /// through encoding and onto the wire.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
