//! Region-of-interest video streaming.
//!
//! Frames flow from a resilient capture source through a detector and a
//! two-tier region encoder, then out over a length-prefixed TCP session:
//!
//! ```text
//! CaptureSource ──► Detector ──► RegionEncoder ──► SessionClient ══► SessionServer
//!  (reconnects,      (regions)    (ROI tier +        4-byte BE        (thread per
//!   stale frames)                  background tier)  length prefix     session)
//! ```
//!
//! # Module Structure
//!
//! - `ingest`: capture backends, `CaptureSource` with bounded reconnection
//! - `detect`: `Detector` trait, bundled backends, `DetectorRegistry`
//! - `encode`: fidelity mapping, region compositing, overlays, `FrameProcessor`
//! - `transport`: wire framing, payload codec, `FrameConnection`
//! - `server` / `client`: the two ends of a session
//! - `pipeline`: the capture-driven loop for local and client roles
//! - `native`: pluggable publish/ingest backends (RTMP via GStreamer)
//!
//! Concurrency is plain threads and atomics. Every component that owns a
//! thread stops with a request followed by a bounded join.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub mod client;
pub mod config;
pub mod detect;
pub mod encode;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod native;
pub mod pipeline;
pub mod server;
pub mod transport;

pub use client::{ClientConfig, ClientState, SessionClient};
pub use config::{QualityProfile, SharedQuality, StreamConfig};
pub use detect::{Detector, DetectorRegistry};
pub use encode::{fidelity, FrameProcessor, ProcessedFrame, RegionEncoder};
pub use error::{
    ConfigError, DetectionError, OpenError, ProcessError, ProtocolError, ReconnectExhausted,
};
pub use frame::{BoundingBox, Detection, Frame, RegionMask, Resolution};
pub use ingest::{CaptureSource, ReconnectPolicy, SourceDescriptor, SourceHealth};
pub use pipeline::{Pipeline, PipelineConfig, PipelineHandle, Role};
pub use server::{ServerConfig, SessionId, SessionRegistry, SessionServer};
pub use transport::{EncodedFrame, FrameConnection, PixelEncoding};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Join `handle` if it finishes within `timeout`.
///
/// Returns `false` when the deadline passes first; the thread is then left
/// detached and finishes on its own.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        log::warn!("joined thread had panicked");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_with_timeout_joins_finished_threads() {
        let handle = std::thread::spawn(|| {});
        assert!(join_with_timeout(handle, Duration::from_secs(1)));
    }

    #[test]
    fn join_with_timeout_gives_up_on_stuck_threads() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let _ = rx.recv();
        });
        assert!(!join_with_timeout(handle, Duration::from_millis(30)));
        drop(tx);
    }
}
