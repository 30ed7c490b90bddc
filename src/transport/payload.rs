//! Versioned frame payload carried inside one wire frame.
//!
//! Layout (version 1):
//!
//! ```text
//! [version u8][header_len u32 BE][header JSON][pixel body]
//! ```
//!
//! The header holds dimensions, capture time, encoding and the regions used,
//! in detector order. `unprocessed` marks a frame the server echoed back
//! without running it through detection and encoding.

use std::time::{Duration, UNIX_EPOCH};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::encode::{decode_jpeg, encode_jpeg};
use crate::error::ProtocolError;
use crate::frame::{Detection, Frame};

pub const PAYLOAD_VERSION: u8 = 1;
pub const TRANSPORT_JPEG_QUALITY: u8 = 90;
const FIXED_HEADER: usize = 1 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelEncoding {
    Raw,
    Jpeg,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub captured_at_ms: u64,
    #[serde(default)]
    pub fps: Option<f32>,
    pub encoding: PixelEncoding,
    #[serde(default)]
    pub regions: Vec<Detection>,
    #[serde(default)]
    pub unprocessed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EncodedFrame {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

impl EncodedFrame {
    pub fn from_frame(frame: &Frame, regions: &[Detection], encoding: PixelEncoding) -> Result<Self> {
        let (channels, body) = match encoding {
            PixelEncoding::Raw => (frame.channels, frame.pixels().to_vec()),
            PixelEncoding::Jpeg => {
                let rgb = frame.to_image()?.to_rgb8();
                (3, encode_jpeg(&rgb, TRANSPORT_JPEG_QUALITY)?)
            }
        };
        Ok(Self {
            header: FrameHeader {
                width: frame.width,
                height: frame.height,
                channels,
                captured_at_ms: frame.captured_at_ms(),
                fps: frame.fps,
                encoding,
                regions: regions.to_vec(),
                unprocessed: false,
            },
            body,
        })
    }

    /// Flag the payload as an echo of a frame that was not processed.
    pub fn mark_unprocessed(mut self) -> Self {
        self.header.unprocessed = true;
        self
    }

    pub fn is_unprocessed(&self) -> bool {
        self.header.unprocessed
    }

    pub fn regions(&self) -> &[Detection] {
        &self.header.regions
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let header = serde_json::to_vec(&self.header)
            .map_err(|err| ProtocolError::Malformed(format!("header encode: {}", err)))?;
        let mut out = Vec::with_capacity(FIXED_HEADER + header.len() + self.body.len());
        out.push(PAYLOAD_VERSION);
        out.extend_from_slice(&(header.len() as u32).to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let Some((&version, rest)) = bytes.split_first() else {
            return Err(ProtocolError::Malformed("empty payload".to_string()));
        };
        if version != PAYLOAD_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let len_bytes: [u8; 4] = rest
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ProtocolError::Malformed("missing header length".to_string()))?;
        let header_len = u32::from_be_bytes(len_bytes) as usize;
        let header_bytes = rest
            .get(4..4 + header_len)
            .ok_or_else(|| ProtocolError::Malformed("header extends past payload".to_string()))?;
        let header: FrameHeader = serde_json::from_slice(header_bytes)
            .map_err(|err| ProtocolError::Malformed(format!("header decode: {}", err)))?;
        let body = rest[4 + header_len..].to_vec();

        if header.encoding == PixelEncoding::Raw {
            let expected = header.width as usize * header.height as usize * header.channels as usize;
            if body.len() != expected {
                return Err(ProtocolError::Malformed(format!(
                    "raw body is {} bytes, expected {}",
                    body.len(),
                    expected
                )));
            }
        }
        Ok(Self { header, body })
    }

    /// Reconstruct the pixels. JPEG bodies decode to 3 channels.
    pub fn decode_frame(&self) -> Result<Frame, ProtocolError> {
        let header = &self.header;
        let frame = match header.encoding {
            PixelEncoding::Raw => {
                Frame::new(self.body.clone(), header.width, header.height, header.channels)
            }
            PixelEncoding::Jpeg => {
                let rgb = decode_jpeg(&self.body)
                    .map_err(|err| ProtocolError::Malformed(format!("{:#}", err)))?;
                if rgb.dimensions() != (header.width, header.height) {
                    return Err(ProtocolError::Malformed(format!(
                        "jpeg is {:?}, header says {}x{}",
                        rgb.dimensions(),
                        header.width,
                        header.height
                    )));
                }
                Frame::new(rgb.into_raw(), header.width, header.height, 3)
            }
        }
        .map_err(|err| ProtocolError::Malformed(format!("{:#}", err)))?;

        Ok(frame
            .with_captured_at(UNIX_EPOCH + Duration::from_millis(header.captured_at_ms))
            .with_fps(header.fps))
    }
}
