use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::Detector;
use crate::frame::{Detection, Frame};

pub type SharedDetector = Arc<Mutex<dyn Detector>>;

/// Registry of named detector backends.
///
/// Backends are wrapped in `Mutex` because `Detector::detect` takes `&mut self`.
pub struct DetectorRegistry {
    backends: BTreeMap<String, SharedDetector>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<D: Detector + 'static>(&mut self, detector: D) {
        let name = detector.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(detector)));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!(
                "detector '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedDetector> {
        self.backends.get(name).cloned()
    }

    pub fn default_detector(&self) -> Option<SharedDetector> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Run detection with the named backend.
    pub fn detect_with(&self, name: &str, frame: &Frame) -> Result<Vec<Detection>> {
        let detector = self
            .get(name)
            .ok_or_else(|| anyhow!("detector '{}' not registered", name))?;
        let mut guard = detector
            .lock()
            .map_err(|_| anyhow!("detector '{}' lock poisoned", name))?;
        guard.detect(frame)
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{MotionDetector, StaticDetector};
    use crate::frame::BoundingBox;

    #[test]
    fn first_registered_is_default() -> Result<()> {
        let mut registry = DetectorRegistry::new();
        registry.register(StaticDetector::new(vec![Detection::new(
            "person",
            0.9,
            BoundingBox::new(1, 1, 2, 2),
        )]));
        registry.register(MotionDetector::default());
        assert_eq!(registry.default_name(), Some("static"));
        assert_eq!(registry.list(), vec!["motion", "static"]);

        registry.set_default("motion")?;
        assert_eq!(registry.default_name(), Some("motion"));
        assert!(registry.set_default("yolo").is_err());

        let frame = Frame::filled(8, 8, [0, 0, 0]);
        let found = registry.detect_with("static", &frame)?;
        assert_eq!(found.len(), 1);
        assert!(registry.detect_with("missing", &frame).is_err());
        Ok(())
    }
}
