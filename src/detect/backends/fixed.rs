use anyhow::Result;

use crate::config::StaticBoxConfig;
use crate::detect::backend::Detector;
use crate::frame::{BoundingBox, Detection, Frame};

/// Reports the same boxes on every frame, clamped to the frame.
///
/// Useful for demos and for exercising the encoder and transport without a
/// model.
#[derive(Clone, Debug, Default)]
pub struct StaticDetector {
    detections: Vec<Detection>,
}

impl StaticDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn from_config(boxes: &[StaticBoxConfig]) -> Self {
        Self::new(
            boxes
                .iter()
                .map(|b| {
                    Detection::new(
                        b.class.clone(),
                        b.confidence,
                        BoundingBox::new(b.x, b.y, b.width, b.height),
                    )
                })
                .collect(),
        )
    }
}

impl Detector for StaticDetector {
    fn name(&self) -> &'static str {
        "static"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self
            .detections
            .iter()
            .map(|d| d.clamped_to(frame.width, frame.height))
            .filter(|d| d.bbox.area() > 0)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boxes_are_clamped_and_order_kept() -> Result<()> {
        let mut detector = StaticDetector::new(vec![
            Detection::new("car", 0.7, BoundingBox::new(5, 5, 100, 100)),
            Detection::new("person", 0.9, BoundingBox::new(0, 0, 4, 4)),
            Detection::new("ghost", 0.9, BoundingBox::new(50, 50, 4, 4)),
        ]);
        let found = detector.detect(&Frame::filled(20, 10, [0, 0, 0]))?;
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].class, "car");
        assert_eq!(found[0].bbox, BoundingBox::new(5, 5, 15, 5));
        assert_eq!(found[1].class, "person");
        Ok(())
    }
}
