//! V4L2 capture backend for local camera devices.

use anyhow::{Context, Result};
use ouroboros::self_referencing;

use super::CaptureBackend;
use crate::frame::{Frame, Resolution};

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct V4l2Capture {
    path: String,
    state: DeviceState,
    width: u32,
    height: u32,
}

impl V4l2Capture {
    /// Open `path`, negotiate RGB3 at the requested resolution, and start
    /// streaming. The device may pick a different size; the negotiated one
    /// is what frames carry.
    pub fn open(path: &str, resolution: Resolution) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = resolution.width;
        format.height = resolution.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Capture: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            anyhow::bail!("{} does not support RGB3 capture (got {})", path, format.fourcc);
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Capture: opened {} ({}x{})",
            path,
            format.width,
            format.height
        );
        Ok(Self {
            path: path.to_string(),
            state,
            width: format.width,
            height: format.height,
        })
    }
}

impl CaptureBackend for V4l2Capture {
    fn describe(&self) -> String {
        format!("v4l2 {} ({}x{})", self.path, self.width, self.height)
    }

    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let (buf, _meta) = self
            .state
            .with_mut(|fields| fields.stream.next())
            .with_context(|| format!("capture v4l2 frame from {}", self.path))?;
        let expected = self.width as usize * self.height as usize * 3;
        let pixels = buf
            .get(..expected)
            .with_context(|| format!("short v4l2 buffer from {}", self.path))?
            .to_vec();
        Frame::new(pixels, self.width, self.height, 3)
    }
}
