use crate::config::SharedQuality;
use crate::detect::SharedDetector;
use crate::error::{DetectionError, ProcessError};
use crate::frame::{Detection, Frame};

use super::RegionEncoder;

/// A composited frame and the regions that drove it.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub frame: Frame,
    pub regions: Vec<Detection>,
}

impl ProcessedFrame {
    /// `"N detections: a(0.91), b(0.40)"`, or `"0 detections"`.
    pub fn status(&self) -> String {
        if self.regions.is_empty() {
            return "0 detections".to_string();
        }
        let summary: Vec<String> = self.regions.iter().map(Detection::summary).collect();
        format!("{} detections: {}", self.regions.len(), summary.join(", "))
    }
}

/// Detect, then encode, with the live quality setting.
///
/// Cheap to clone; clones share the detector and quality handle.
#[derive(Clone)]
pub struct FrameProcessor {
    detector: SharedDetector,
    encoder: RegionEncoder,
    quality: SharedQuality,
}

impl FrameProcessor {
    pub fn new(detector: SharedDetector, encoder: RegionEncoder, quality: SharedQuality) -> Self {
        Self {
            detector,
            encoder,
            quality,
        }
    }

    pub fn quality(&self) -> &SharedQuality {
        &self.quality
    }

    pub fn encoder(&self) -> RegionEncoder {
        self.encoder
    }

    /// A detector failure is returned unretried; the caller skips the frame.
    pub fn process(&self, frame: &Frame) -> Result<ProcessedFrame, ProcessError> {
        let detections = {
            let mut detector = match self.detector.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            detector.detect(frame).map_err(|err| DetectionError {
                backend: detector.name().to_string(),
                message: format!("{:#}", err),
            })?
        };

        let (out, regions) = self
            .encoder
            .process(Some(frame), &detections, self.quality.get())
            .map_err(|err| ProcessError::Encode(format!("{:#}", err)))?;
        let frame =
            out.ok_or_else(|| ProcessError::Encode("encoder returned no frame".to_string()))?;
        Ok(ProcessedFrame { frame, regions })
    }
}
