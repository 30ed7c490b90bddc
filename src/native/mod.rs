//! Pluggable streaming backends.
//!
//! `StreamPublisher` pushes processed frames and their regions to an outside
//! sink; `StreamIngest` is the symmetric side that delivers frames to a
//! callback. Teardown is `Drop`.
//!
//! Bundled:
//! - `SessionPublisher` for `tcp://host:port`, framed like any session client
//! - `CaptureIngest` over a `CaptureSource`
//! - `GstPublisher` for RTMP via GStreamer (feature `gstreamer`)

#[cfg(feature = "gstreamer")]
mod gst_publish;
mod ingest;
mod session;

#[cfg(feature = "gstreamer")]
pub use gst_publish::GstPublisher;
pub use ingest::CaptureIngest;
pub use session::SessionPublisher;

use anyhow::Result;
use url::Url;

use crate::config::validate_quality_param;
use crate::error::ConfigError;
use crate::frame::{Detection, Frame};

#[derive(Clone, Debug, PartialEq)]
pub struct PublisherConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames.
    pub gop: u32,
    /// Encoder quality parameter, same scale as the region tiers.
    pub quality: i64,
}

impl PublisherConfig {
    pub fn new(url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            url: url.into(),
            width,
            height,
            fps: 25,
            bitrate_kbps: 2_000,
            gop: 50,
            quality: 23,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Empty("publisher url"));
        }
        Url::parse(&self.url)
            .map_err(|err| ConfigError::Invalid(format!("publisher url '{}': {}", self.url, err)))?;
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(
                "publisher resolution must be non-zero".to_string(),
            ));
        }
        if self.fps == 0 || self.gop == 0 || self.bitrate_kbps == 0 {
            return Err(ConfigError::Invalid(
                "publisher fps, gop and bitrate must be non-zero".to_string(),
            ));
        }
        validate_quality_param("publisher quality", self.quality)?;
        Ok(())
    }
}

pub trait StreamPublisher: Send {
    fn initialize(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn push_frame(&mut self, frame: &Frame, regions: &[Detection]) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

pub type FrameCallback = Box<dyn FnMut(Frame) + Send>;

pub trait StreamIngest: Send {
    fn initialize(&mut self) -> Result<()>;
    fn start(&mut self, on_frame: FrameCallback) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// Pick a publisher by URL scheme.
pub fn create_publisher(config: PublisherConfig) -> Result<Box<dyn StreamPublisher>> {
    config.validate()?;
    let scheme = Url::parse(&config.url)?.scheme().to_string();
    match scheme.as_str() {
        "tcp" => Ok(Box::new(SessionPublisher::new(config)?)),
        #[cfg(feature = "gstreamer")]
        "rtmp" | "rtmps" => Ok(Box::new(GstPublisher::new(config))),
        other => Err(anyhow::anyhow!(
            "no publisher compiled in for scheme '{}'",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_config_validation() {
        assert!(PublisherConfig::new("tcp://127.0.0.1:9000", 640, 480)
            .validate()
            .is_ok());
        assert!(PublisherConfig::new("", 640, 480).validate().is_err());
        assert!(PublisherConfig::new("tcp://h:1", 0, 480).validate().is_err());

        let mut config = PublisherConfig::new("rtmp://live/app", 640, 480);
        config.quality = 99;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::QualityOutOfRange { .. })
        ));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(create_publisher(PublisherConfig::new("gopher://x", 8, 8)).is_err());
    }
}
