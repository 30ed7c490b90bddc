//! Two-tier region encoding.
//!
//! The whole frame is JPEG re-encoded twice, once at the ROI fidelity and
//! once at the background fidelity, and the two decodes are composited
//! through the detection mask. This approximates per-region quantisation;
//! the output carries no region-specific bitstream.

mod overlay;
mod processor;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};

use crate::config::{OverlaySettings, QualityProfile};
use crate::frame::{Detection, Frame, RegionMask};

pub use overlay::{class_color, draw_detection, draw_quality_hud};
pub use processor::{FrameProcessor, ProcessedFrame};

pub const MIN_FIDELITY: i64 = 5;
pub const MAX_FIDELITY: i64 = 100;

/// JPEG quality for a quality parameter: `clamp(trunc(100 - qp * 2.5), 5, 100)`.
pub fn fidelity(quality_param: u8) -> u8 {
    let raw = (100.0 - quality_param as f64 * 2.5) as i64;
    raw.clamp(MIN_FIDELITY, MAX_FIDELITY) as u8
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        .context("JPEG decode failed")?;
    Ok(decoded.to_rgb8())
}

/// Encode at `quality` and decode back to pixels.
pub fn jpeg_roundtrip(image: &RgbImage, quality: u8) -> Result<RgbImage> {
    decode_jpeg(&encode_jpeg(image, quality)?)
}

/// Composites a frame from two fidelity tiers selected by detection boxes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegionEncoder {
    overlay: OverlaySettings,
}

impl RegionEncoder {
    pub fn new(overlay: OverlaySettings) -> Self {
        Self { overlay }
    }

    /// No boxes, no HUD: the output is exactly the composite of the two tiers.
    pub fn without_overlay() -> Self {
        Self::new(OverlaySettings {
            boxes: false,
            hud: false,
        })
    }

    pub fn overlay(&self) -> OverlaySettings {
        self.overlay
    }

    /// Returns the composited frame and the regions used, in detector order
    /// with boxes clamped to the frame. An absent frame yields `(None, [])`.
    ///
    /// The output is always 3-channel; grayscale input is expanded first.
    pub fn process(
        &self,
        frame: Option<&Frame>,
        detections: &[Detection],
        quality: QualityProfile,
    ) -> Result<(Option<Frame>, Vec<Detection>)> {
        let Some(frame) = frame else {
            return Ok((None, Vec::new()));
        };
        let (width, height) = (frame.width, frame.height);

        let regions: Vec<Detection> = detections
            .iter()
            .map(|d| d.clamped_to(width, height))
            .collect();
        let mask = RegionMask::from_detections(width, height, &regions);

        let mut working = frame.to_image()?.to_rgb8();
        if self.overlay.boxes {
            for region in &regions {
                draw_detection(&mut working, region);
            }
        }

        let roi_fidelity = fidelity(quality.roi_qp());
        let background_fidelity = fidelity(quality.background_qp());
        let roi = jpeg_roundtrip(&working, roi_fidelity)?;
        let background = jpeg_roundtrip(&working, background_fidelity)?;

        let mut composite = composite(&mask, &roi, &background)?;
        if self.overlay.hud {
            draw_quality_hud(&mut composite, quality);
        }

        log::debug!(
            "RegionEncoder: {}x{} with {} region(s), fidelity {}/{}, {} ROI pixels",
            width,
            height,
            regions.len(),
            roi_fidelity,
            background_fidelity,
            mask.covered_pixels()
        );

        let out = Frame::new(composite.into_raw(), width, height, 3)?
            .with_captured_at(frame.captured_at)
            .with_fps(frame.fps);
        Ok((Some(out), regions))
    }
}

/// Mask-true pixels from `roi`, the rest from `background`.
fn composite(mask: &RegionMask, roi: &RgbImage, background: &RgbImage) -> Result<RgbImage> {
    if roi.dimensions() != (mask.width(), mask.height())
        || background.dimensions() != (mask.width(), mask.height())
    {
        return Err(anyhow!(
            "tier size mismatch: mask {}x{}, roi {:?}, background {:?}",
            mask.width(),
            mask.height(),
            roi.dimensions(),
            background.dimensions()
        ));
    }
    let mut out = background.clone();
    for ((dst, src), &inside) in out
        .chunks_exact_mut(3)
        .zip(roi.as_raw().chunks_exact(3))
        .zip(mask.bits())
    {
        if inside {
            dst.copy_from_slice(src);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BoundingBox;

    #[test]
    fn fidelity_formula_and_bounds() {
        assert_eq!(fidelity(15), 62);
        assert_eq!(fidelity(35), 12);
        assert_eq!(fidelity(5), 87);
        assert_eq!(fidelity(40), 5);
        assert_eq!(fidelity(0), 100);
        assert_eq!(fidelity(60), 5);
    }

    #[test]
    fn fidelity_is_non_increasing() {
        for qp in 5..40u8 {
            assert!(fidelity(qp) >= fidelity(qp + 1));
        }
    }

    #[test]
    fn absent_frame_yields_nothing() -> Result<()> {
        let encoder = RegionEncoder::default();
        let detections = vec![Detection::new("x", 0.5, BoundingBox::new(0, 0, 1, 1))];
        let (frame, regions) = encoder.process(None, &detections, QualityProfile::default())?;
        assert!(frame.is_none());
        assert!(regions.is_empty());
        Ok(())
    }

    #[test]
    fn regions_keep_detector_order_and_are_clamped() -> Result<()> {
        let encoder = RegionEncoder::without_overlay();
        let frame = Frame::filled(32, 32, [120, 80, 40]);
        let detections = vec![
            Detection::new("b", 0.2, BoundingBox::new(20, 20, 40, 40)),
            Detection::new("a", 0.9, BoundingBox::new(0, 0, 4, 4)),
        ];
        let (out, regions) = encoder.process(Some(&frame), &detections, QualityProfile::default())?;
        let out = out.expect("frame");
        assert_eq!((out.width, out.height, out.channels), (32, 32, 3));
        assert_eq!(regions[0].class, "b");
        assert_eq!(regions[0].bbox, BoundingBox::new(20, 20, 12, 12));
        assert_eq!(regions[1].class, "a");
        Ok(())
    }

    #[test]
    fn grayscale_input_is_expanded() -> Result<()> {
        let frame = Frame::new(vec![90; 16 * 8], 16, 8, 1)?;
        let (out, _) =
            RegionEncoder::default().process(Some(&frame), &[], QualityProfile::default())?;
        assert_eq!(out.expect("frame").channels, 3);
        Ok(())
    }
}
