use anyhow::Result;

use crate::detect::backend::Detector;
use crate::frame::{BoundingBox, Detection, Frame};

const DEFAULT_PIXEL_THRESHOLD: u8 = 25;
const DEFAULT_MIN_CHANGED: usize = 4;

/// CPU frame-differencing detector.
///
/// Compares luma against the previous frame and reports one `motion` box
/// around every pixel whose change exceeds the threshold. The first frame
/// (and any frame after a resolution change) only primes the reference.
pub struct MotionDetector {
    previous: Option<(u32, u32, Vec<u8>)>,
    pixel_threshold: u8,
    min_changed: usize,
}

impl MotionDetector {
    pub fn new(pixel_threshold: u8, min_changed: usize) -> Self {
        Self {
            previous: None,
            pixel_threshold,
            min_changed: min_changed.max(1),
        }
    }
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_PIXEL_THRESHOLD, DEFAULT_MIN_CHANGED)
    }
}

fn luma(frame: &Frame) -> Vec<u8> {
    if frame.channels == 1 {
        return frame.pixels().to_vec();
    }
    frame
        .pixels()
        .chunks_exact(frame.channels as usize)
        .map(|px| ((px[0] as u32 * 77 + px[1] as u32 * 150 + px[2] as u32 * 29) >> 8) as u8)
        .collect()
}

impl Detector for MotionDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current = luma(frame);
        let previous = self.previous.replace((frame.width, frame.height, current));
        let Some((prev_w, prev_h, prev)) = previous else {
            return Ok(Vec::new());
        };
        if prev_w != frame.width || prev_h != frame.height {
            return Ok(Vec::new());
        }
        let Some((_, _, current)) = self.previous.as_ref() else {
            return Ok(Vec::new());
        };

        let width = frame.width as usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        let mut changed = 0usize;
        for (i, (a, b)) in prev.iter().zip(current.iter()).enumerate() {
            if a.abs_diff(*b) > self.pixel_threshold {
                let (x, y) = (i % width, i / width);
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
                changed += 1;
            }
        }
        if changed < self.min_changed {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::new(
            min_x as u32,
            min_y as u32,
            (max_x - min_x + 1) as u32,
            (max_y - min_y + 1) as u32,
        );
        let confidence = changed as f32 / bbox.area().max(1) as f32;
        Ok(vec![Detection::new("motion", confidence, bbox)])
    }
}
