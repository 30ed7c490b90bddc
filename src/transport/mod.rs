//! Frame transport over TCP.
//!
//! `wire` handles length-prefixed framing, `payload` the versioned frame
//! encoding inside each wire frame, and `connection` a framed socket with a
//! serialised write half.

mod connection;
mod payload;
mod wire;

pub use connection::{FrameConnection, FrameWriter};
pub use payload::{EncodedFrame, FrameHeader, PixelEncoding, PAYLOAD_VERSION, TRANSPORT_JPEG_QUALITY};
pub use wire::{encode_frame, read_frame, write_frame, ReadOutcome, MAX_FRAME_BYTES, PREFIX_LEN, READ_CHUNK};
