//! Synthetic capture backend for `stub://` descriptors.
//!
//! Produces a static gradient background with a bright block sweeping across
//! it, so motion detection and region encoding have something to find.

use anyhow::Result;

use super::CaptureBackend;
use crate::frame::{Frame, Resolution};

const BLOCK_FRACTION: u32 = 6;
const BLOCK_STEP: u32 = 4;

pub struct SyntheticSource {
    name: String,
    resolution: Resolution,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(name: impl Into<String>, resolution: Resolution) -> Self {
        let name = name.into();
        log::info!(
            "SyntheticSource: opened stub://{} ({}x{})",
            name,
            resolution.width,
            resolution.height
        );
        Self {
            name,
            resolution,
            frame_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    /// Top-left corner and side of the moving block for frame `n`.
    fn block_at(&self, n: u64) -> (u32, u32, u32) {
        let width = self.resolution.width.max(1);
        let height = self.resolution.height.max(1);
        let side = (width.min(height) / BLOCK_FRACTION).max(1);
        let travel = width.saturating_sub(side).max(1) as u64;
        let x = ((n * BLOCK_STEP as u64) % travel) as u32;
        let y = (height - side.min(height)) / 2;
        (x, y, side)
    }

    fn generate(&self) -> Result<Frame> {
        let width = self.resolution.width.max(1);
        let height = self.resolution.height.max(1);
        let (bx, by, side) = self.block_at(self.frame_count);

        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            for x in 0..width {
                let inside = x >= bx && x < bx + side && y >= by && y < by + side;
                if inside {
                    pixels.extend_from_slice(&[240, 240, 240]);
                } else {
                    let r = (x * 255 / width) as u8 / 2;
                    let g = (y * 255 / height) as u8 / 2;
                    pixels.extend_from_slice(&[r, g, 64]);
                }
            }
        }
        Frame::new(pixels, width, height, 3)
    }
}

impl CaptureBackend for SyntheticSource {
    fn describe(&self) -> String {
        format!("synthetic pattern '{}'", self.name)
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        self.generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_match_requested_resolution() -> Result<()> {
        let mut source = SyntheticSource::new("test", Resolution::new(48, 32));
        let frame = source.read_frame()?;
        assert_eq!((frame.width, frame.height, frame.channels), (48, 32, 3));
        assert_eq!(frame.pixels().len(), 48 * 32 * 3);
        assert_eq!(source.frames_generated(), 1);
        Ok(())
    }

    #[test]
    fn consecutive_frames_differ() -> Result<()> {
        let mut source = SyntheticSource::new("test", Resolution::new(64, 48));
        let first = source.read_frame()?;
        let second = source.read_frame()?;
        assert_ne!(first.pixels(), second.pixels());
        Ok(())
    }
}
