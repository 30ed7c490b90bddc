//! Still-image capture backend: one decoded picture served on every read.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::path::{Path, PathBuf};

use super::CaptureBackend;
use crate::frame::{Frame, Resolution};

const STILL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub fn is_still_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            STILL_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

pub struct StillImageSource {
    path: PathBuf,
    frame: Frame,
}

impl StillImageSource {
    /// Decode `path` and scale it to `resolution`.
    pub fn open(path: &Path, resolution: Resolution) -> Result<Self> {
        let decoded = image::open(path).with_context(|| format!("decode {}", path.display()))?;
        let scaled = if decoded.width() == resolution.width && decoded.height() == resolution.height
        {
            decoded
        } else {
            decoded.resize_exact(resolution.width, resolution.height, FilterType::Triangle)
        };
        let frame = Frame::from_image(image::DynamicImage::ImageRgb8(scaled.to_rgb8()))?;
        log::info!(
            "StillImageSource: loaded {} ({}x{})",
            path.display(),
            frame.width,
            frame.height
        );
        Ok(Self {
            path: path.to_path_buf(),
            frame,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureBackend for StillImageSource {
    fn describe(&self) -> String {
        format!("still image {}", self.path.display())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        Ok(self.frame.clone().with_captured_at(std::time::SystemTime::now()))
    }
}
