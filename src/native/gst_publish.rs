//! RTMP publishing through GStreamer.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use image::imageops::FilterType;

use super::{PublisherConfig, StreamPublisher};
use crate::config::validate_quality_param;
use crate::frame::{Detection, Frame};

pub struct GstPublisher {
    config: PublisherConfig,
    pipeline: Option<gstreamer::Pipeline>,
    appsrc: Option<gstreamer_app::AppSrc>,
    frames_pushed: u64,
}

impl GstPublisher {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config,
            pipeline: None,
            appsrc: None,
            frames_pushed: 0,
        }
    }

    pub fn frames_pushed(&self) -> u64 {
        self.frames_pushed
    }

    fn launch_description(&self) -> Result<String> {
        let c = &self.config;
        // x264enc takes a constant quantizer on the same 0..51 scale.
        let quantizer = validate_quality_param("publisher quality", c.quality)?;
        Ok(format!(
            "appsrc name=src is-live=true format=time do-timestamp=true \
             caps=video/x-raw,format=RGB,width={w},height={h},framerate={fps}/1 \
             ! videoconvert ! video/x-raw,format=I420 \
             ! x264enc tune=zerolatency speed-preset=ultrafast bitrate={bitrate} \
               key-int-max={gop} quantizer={q} \
             ! flvmux streamable=true ! rtmpsink location=\"{url} live=1\"",
            w = c.width,
            h = c.height,
            fps = c.fps,
            bitrate = c.bitrate_kbps,
            gop = c.gop,
            q = quantizer,
            url = c.url,
        ))
    }

    /// RGB bytes at the configured resolution.
    fn prepare(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut rgb = frame.to_image()?.to_rgb8();
        if rgb.width() != self.config.width || rgb.height() != self.config.height {
            rgb = image::imageops::resize(
                &rgb,
                self.config.width,
                self.config.height,
                FilterType::Triangle,
            );
        }
        Ok(rgb.into_raw())
    }
}

impl StreamPublisher for GstPublisher {
    fn initialize(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline = gstreamer::parse::launch(&self.launch_description()?)
            .context("build publish pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("publish pipeline is not a Pipeline"))?;
        let appsrc = pipeline
            .by_name("src")
            .context("appsrc element missing from pipeline")?
            .downcast::<gstreamer_app::AppSrc>()
            .map_err(|_| anyhow!("appsrc element has unexpected type"))?;

        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("publisher not initialized"))?;
        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set publish pipeline to Playing")?;
        log::info!("GstPublisher: publishing to {}", self.config.url);
        Ok(())
    }

    fn push_frame(&mut self, frame: &Frame, _regions: &[Detection]) -> Result<()> {
        let appsrc = self
            .appsrc
            .as_ref()
            .ok_or_else(|| anyhow!("publisher not initialized"))?;
        let bytes = self.prepare(frame)?;
        let buffer = gstreamer::Buffer::from_mut_slice(bytes);
        appsrc
            .push_buffer(buffer)
            .map_err(|flow| anyhow!("appsrc rejected buffer: {:?}", flow))?;
        self.frames_pushed += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(appsrc) = self.appsrc.take() {
            let _ = appsrc.end_of_stream();
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline
                .set_state(gstreamer::State::Null)
                .context("set publish pipeline to Null")?;
            log::info!(
                "GstPublisher: stopped after {} frames to {}",
                self.frames_pushed,
                self.config.url
            );
        }
        Ok(())
    }
}

impl Drop for GstPublisher {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
