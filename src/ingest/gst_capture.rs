//! GStreamer capture backend for network streams and video files.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::CaptureBackend;
use crate::frame::{Frame, Resolution};

const PULL_TIMEOUT: Duration = Duration::from_millis(2_000);

pub struct GstCapture {
    uri: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

impl GstCapture {
    /// Build `uridecodebin ! videoconvert ! videoscale ! appsink` for `uri`
    /// and start it playing.
    pub fn open(uri: &str, resolution: Resolution) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = format!(
            "uridecodebin uri={} ! videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            uri, resolution.width, resolution.height
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set capture pipeline to Playing")?;
        log::info!("GstCapture: playing {}", uri);

        Ok(Self {
            uri: uri.to_string(),
            pipeline,
            appsink,
        })
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("{} reached end of stream", self.uri)),
                _ => {}
            }
        }
        Ok(())
    }
}

impl CaptureBackend for GstCapture {
    fn describe(&self) -> String {
        format!("gstreamer {}", self.uri)
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.check_bus()?;
        let timeout = gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("{} stalled", self.uri))?;
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Frame::new(pixels, width, height, 3)
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstCapture: failed to stop {}: {}", self.uri, err);
        }
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
