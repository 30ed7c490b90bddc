//! Object detection behind a pluggable `Detector` trait.

mod backend;
mod backends;
mod registry;

use anyhow::Result;

pub use backend::Detector;
pub use backends::{MotionDetector, StaticDetector};
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use registry::{DetectorRegistry, SharedDetector};

use crate::config::DetectorSettings;
use crate::frame::Detection;

/// Drop detections overlapping a more confident one by more than
/// `iou_threshold`. Survivors are ordered by descending confidence.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..detections.len() {
        let overlaps = (0..kept).any(|prev| {
            detections[prev].bbox.iou(&detections[index].bbox) > iou_threshold
        });
        if !overlaps {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

/// Register the bundled backends and select the configured default.
pub fn registry_from_settings(settings: &DetectorSettings) -> Result<DetectorRegistry> {
    let mut registry = DetectorRegistry::new();
    registry.register(MotionDetector::default());
    registry.register(StaticDetector::from_config(&settings.boxes));

    #[cfg(feature = "backend-tract")]
    if let Some(model_path) = settings.model_path.as_ref() {
        let mut detector = TractDetector::new(
            model_path,
            settings.input_width,
            settings.input_height,
            settings.classes.clone(),
        )?
        .with_thresholds(settings.confidence, settings.iou);
        detector.warm_up()?;
        registry.register(detector);
    }

    registry.set_default(&settings.backend)?;
    log::info!(
        "detect: using '{}' (available: {})",
        settings.backend,
        registry.list().join(", ")
    );
    Ok(registry)
}
