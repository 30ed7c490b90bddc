//! Frames, detection boxes and region masks.
//!
//! - `Frame`: owned pixel buffer plus capture time and running FPS estimate.
//! - `BoundingBox` / `Detection`: detector output, clamped to frame bounds.
//! - `RegionMask`: per-pixel union of detection boxes, built fresh per frame.
//!
//! A `Frame` is never mutated across ownership boundaries: the encoder takes
//! `&Frame` and returns a new one.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Requested capture resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded image. Rows are tightly packed (`stride == width * channels`).
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1 (gray) or 3 (RGB).
    pub channels: u8,
    pub captured_at: SystemTime,
    pub fps: Option<f32>,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, channels: u8) -> Result<Self> {
        if channels != 1 && channels != 3 {
            return Err(anyhow!("unsupported channel count {}", channels));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(channels as usize))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            channels,
            captured_at: SystemTime::now(),
            fps: None,
        })
    }

    /// Solid-colour RGB frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            pixels,
            width,
            height,
            channels: 3,
            captured_at: SystemTime::now(),
            fps: None,
        }
    }

    pub fn with_captured_at(mut self, captured_at: SystemTime) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn with_fps(mut self, fps: Option<f32>) -> Self {
        self.fps = fps;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Pixel at (x, y) as a channel slice.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let c = self.channels as usize;
        let start = y as usize * self.stride() + x as usize * c;
        self.pixels.get(start..start + c)
    }

    /// Milliseconds since the Unix epoch, 0 for pre-epoch clocks.
    pub fn captured_at_ms(&self) -> u64 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn to_image(&self) -> Result<DynamicImage> {
        match self.channels {
            3 => RgbImage::from_raw(self.width, self.height, self.pixels.clone())
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| anyhow!("RGB buffer does not match dimensions")),
            1 => GrayImage::from_raw(self.width, self.height, self.pixels.clone())
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| anyhow!("gray buffer does not match dimensions")),
            other => Err(anyhow!("unsupported channel count {}", other)),
        }
    }

    /// Build a frame from a decoded image, keeping gray images single-channel.
    pub fn from_image(image: DynamicImage) -> Result<Self> {
        match image {
            DynamicImage::ImageLuma8(gray) => {
                let (w, h) = gray.dimensions();
                Self::new(gray.into_raw(), w, h, 1)
            }
            other => {
                let rgb = other.to_rgb8();
                let (w, h) = rgb.dimensions();
                Self::new(rgb.into_raw(), w, h, 3)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Detections
// ----------------------------------------------------------------------------

/// Axis-aligned box in pixel coordinates covering `[x, x+width) × [y, y+height)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamp an arbitrary (possibly negative or overflowing) box into a frame.
    pub fn clamped_from_xywh(x: f32, y: f32, w: f32, h: f32, frame_w: u32, frame_h: u32) -> Self {
        let fw = frame_w as f32;
        let fh = frame_h as f32;
        let left = x.max(0.0).min(fw);
        let top = y.max(0.0).min(fh);
        let right = (x + w.max(0.0)).max(0.0).min(fw);
        let bottom = (y + h.max(0.0)).max(0.0).min(fh);
        Self {
            x: left as u32,
            y: top as u32,
            width: (right - left).max(0.0) as u32,
            height: (bottom - top).max(0.0) as u32,
        }
    }

    pub fn clamp_to(&self, frame_w: u32, frame_h: u32) -> Self {
        let x = self.x.min(frame_w);
        let y = self.y.min(frame_h);
        Self {
            x,
            y,
            width: self.width.min(frame_w - x),
            height: self.height.min(frame_h - y),
        }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0.0;
        }
        let inter = (right - left) as u64 * (bottom - top) as u64;
        let union = self.area() + other.area() - inter;
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

/// One object reported by a detector. Read-only once returned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            class: class.into(),
            confidence,
            bbox,
        }
    }

    pub fn clamped_to(&self, frame_w: u32, frame_h: u32) -> Self {
        Self {
            class: self.class.clone(),
            confidence: self.confidence,
            bbox: self.bbox.clamp_to(frame_w, frame_h),
        }
    }

    /// `class(0.87)` as shown in status lines.
    pub fn summary(&self) -> String {
        format!("{}({:.2})", self.class, self.confidence)
    }
}

// ----------------------------------------------------------------------------
// RegionMask
// ----------------------------------------------------------------------------

/// Binary mask, same dimensions as its frame; union of filled detection boxes.
#[derive(Clone, Debug)]
pub struct RegionMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl RegionMask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width as usize * height as usize],
        }
    }

    pub fn from_detections(width: u32, height: u32, detections: &[Detection]) -> Self {
        let mut mask = Self::empty(width, height);
        for detection in detections {
            mask.fill(&detection.bbox);
        }
        mask
    }

    pub fn fill(&mut self, bbox: &BoundingBox) {
        let b = bbox.clamp_to(self.width, self.height);
        for y in b.y..b.bottom() {
            let row = y as usize * self.width as usize;
            for x in b.x..b.right() {
                self.bits[row + x as usize] = true;
            }
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.bits[y as usize * self.width as usize + x as usize]
    }

    pub fn covered_pixels(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub(crate) fn bits(&self) -> &[bool] {
        &self.bits
    }
}

// ----------------------------------------------------------------------------
// FpsMeter
// ----------------------------------------------------------------------------

/// Frame-rate estimate over windows of at least one second.
#[derive(Debug)]
pub struct FpsMeter {
    window_start: Instant,
    frames_in_window: u32,
    current: Option<f32>,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames_in_window: 0,
            current: None,
        }
    }

    /// Count one frame and return the latest estimate.
    pub fn tick(&mut self) -> Option<f32> {
        self.tick_at(Instant::now())
    }

    pub(crate) fn tick_at(&mut self, now: Instant) -> Option<f32> {
        self.frames_in_window += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Duration::from_secs(1) {
            self.current = Some(self.frames_in_window as f32 / elapsed.as_secs_f32());
            self.frames_in_window = 0;
            self.window_start = now;
        }
        self.current
    }

    pub fn current(&self) -> Option<f32> {
        self.current
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_length_mismatch() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, 3).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2, 3).is_ok());
        assert!(Frame::new(vec![0u8; 4], 2, 2, 2).is_err());
    }

    #[test]
    fn frame_pixel_indexing_uses_stride() -> Result<()> {
        let pixels: Vec<u8> = (0..18).collect();
        let frame = Frame::new(pixels, 3, 2, 3)?;
        assert_eq!(frame.pixel(0, 1), Some(&[9u8, 10, 11][..]));
        assert_eq!(frame.pixel(3, 0), None);
        Ok(())
    }

    #[test]
    fn clamped_box_stays_inside_frame() {
        let b = BoundingBox::clamped_from_xywh(-5.0, 90.0, 20.0, 40.0, 100, 100);
        assert_eq!(b, BoundingBox::new(0, 90, 15, 10));

        let b = BoundingBox::new(95, 95, 20, 20).clamp_to(100, 100);
        assert_eq!(b, BoundingBox::new(95, 95, 5, 5));
    }

    #[test]
    fn mask_is_union_of_boxes() {
        let detections = vec![
            Detection::new("a", 0.9, BoundingBox::new(0, 0, 2, 2)),
            Detection::new("b", 0.8, BoundingBox::new(1, 1, 2, 2)),
        ];
        let mask = RegionMask::from_detections(4, 4, &detections);
        assert_eq!(mask.width(), 4);
        assert_eq!(mask.height(), 4);
        assert_eq!(mask.covered_pixels(), 7);
        assert!(mask.contains(0, 0));
        assert!(mask.contains(2, 2));
        assert!(!mask.contains(3, 3));
        assert!(!mask.contains(2, 0));
    }

    #[test]
    fn detection_confidence_is_clamped() {
        let d = Detection::new("person", 1.7, BoundingBox::new(0, 0, 1, 1));
        assert_eq!(d.confidence, 1.0);
        let d = Detection::new("person", f32::NAN, BoundingBox::new(0, 0, 1, 1));
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BoundingBox::new(10, 10, 20, 20);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&BoundingBox::new(50, 50, 5, 5)), 0.0);
    }

    #[test]
    fn fps_meter_reports_after_one_second() {
        let start = Instant::now();
        let mut meter = FpsMeter {
            window_start: start,
            frames_in_window: 0,
            current: None,
        };
        for i in 0..9 {
            assert_eq!(meter.tick_at(start + Duration::from_millis(100 * i)), None);
        }
        let fps = meter.tick_at(start + Duration::from_secs(1)).unwrap();
        assert!((fps - 10.0).abs() < 0.01);
    }
}
