//! Frame capture with automatic reconnection.
//!
//! A `CaptureSource` wraps one backend chosen from the shape of a
//! `SourceDescriptor`:
//! - `stub://name` synthetic pattern (tests, demos)
//! - still image files (`.jpg`, `.png`, `.bmp`)
//! - network streams and video files via GStreamer (feature `gstreamer`)
//! - V4L2 device indices (feature `ingest-v4l2`)
//!
//! Read failures never surface to the caller. `get_frame` keeps serving the
//! last good frame while a single background task reopens the backend, and
//! keeps serving it indefinitely if every attempt fails.

pub mod still;
pub mod synthetic;

#[cfg(feature = "gstreamer")]
pub mod gst_capture;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use url::Url;

use crate::error::{OpenError, ReconnectExhausted};
use crate::frame::{FpsMeter, Frame, Resolution};

pub use still::StillImageSource;
pub use synthetic::SyntheticSource;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const SLEEP_SLICE: Duration = Duration::from_millis(20);

// ----------------------------------------------------------------------------
// SourceDescriptor
// ----------------------------------------------------------------------------

/// What to capture from, resolved once at open time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    Device(u32),
    NetworkStream(Url),
    File(PathBuf),
    Synthetic(String),
}

impl SourceDescriptor {
    pub fn parse(raw: &str) -> Result<Self, OpenError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(OpenError::InvalidDescriptor(raw.to_string()));
        }
        if let Ok(index) = value.parse::<u32>() {
            return Ok(Self::Device(index));
        }
        if let Some(index) = value
            .strip_prefix("/dev/video")
            .and_then(|rest| rest.parse::<u32>().ok())
        {
            return Ok(Self::Device(index));
        }
        if let Some(name) = value.strip_prefix("stub://") {
            return Ok(Self::Synthetic(name.to_string()));
        }
        if !value.contains("://") {
            return Ok(Self::File(PathBuf::from(value)));
        }

        let url = Url::parse(value).map_err(|_| OpenError::InvalidDescriptor(raw.to_string()))?;
        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(Self::File)
                .map_err(|_| OpenError::InvalidDescriptor(raw.to_string())),
            "rtsp" | "rtsps" | "rtmp" | "rtmps" | "http" | "https" | "udp" | "tcp" | "srt" => {
                Ok(Self::NetworkStream(url))
            }
            _ => Err(OpenError::InvalidDescriptor(raw.to_string())),
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(index) => write!(f, "device:{}", index),
            Self::NetworkStream(url) => write!(f, "{}", url),
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Synthetic(name) => write!(f, "stub://{}", name),
        }
    }
}

// ----------------------------------------------------------------------------
// Backends
// ----------------------------------------------------------------------------

/// An open capture resource. Dropping it releases the resource.
pub trait CaptureBackend: Send {
    /// Block for at most one underlying read.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Short human-readable label for logs.
    fn describe(&self) -> String;
}

/// Opens a backend for a descriptor. Swappable so tests can script failures.
pub type BackendOpener = Arc<
    dyn Fn(&SourceDescriptor, Resolution) -> Result<Box<dyn CaptureBackend>, OpenError>
        + Send
        + Sync,
>;

/// Opener that dispatches on descriptor shape to the compiled-in backends.
pub fn default_opener() -> BackendOpener {
    Arc::new(open_backend)
}

fn open_backend(
    descriptor: &SourceDescriptor,
    resolution: Resolution,
) -> Result<Box<dyn CaptureBackend>, OpenError> {
    match descriptor {
        SourceDescriptor::Synthetic(name) => {
            Ok(Box::new(SyntheticSource::new(name.clone(), resolution)))
        }
        SourceDescriptor::File(path) if still::is_still_image(path) => {
            let source = StillImageSource::open(path, resolution).map_err(|err| {
                OpenError::Backend {
                    descriptor: descriptor.to_string(),
                    message: format!("{:#}", err),
                }
            })?;
            Ok(Box::new(source))
        }
        SourceDescriptor::File(path) => open_video_file(descriptor, path, resolution),
        SourceDescriptor::NetworkStream(url) => open_network(descriptor, url, resolution),
        SourceDescriptor::Device(index) => open_device(descriptor, *index, resolution),
    }
}

#[cfg(feature = "gstreamer")]
fn open_video_file(
    descriptor: &SourceDescriptor,
    path: &Path,
    resolution: Resolution,
) -> Result<Box<dyn CaptureBackend>, OpenError> {
    let absolute = std::fs::canonicalize(path).map_err(|err| OpenError::Backend {
        descriptor: descriptor.to_string(),
        message: err.to_string(),
    })?;
    let uri = Url::from_file_path(&absolute)
        .map_err(|_| OpenError::InvalidDescriptor(descriptor.to_string()))?;
    gst_capture::GstCapture::open(uri.as_str(), resolution)
        .map(|source| Box::new(source) as Box<dyn CaptureBackend>)
        .map_err(|err| OpenError::Backend {
            descriptor: descriptor.to_string(),
            message: format!("{:#}", err),
        })
}

#[cfg(not(feature = "gstreamer"))]
fn open_video_file(
    descriptor: &SourceDescriptor,
    _path: &Path,
    _resolution: Resolution,
) -> Result<Box<dyn CaptureBackend>, OpenError> {
    Err(OpenError::Unsupported(format!(
        "{} (video files require the gstreamer feature)",
        descriptor
    )))
}

#[cfg(feature = "gstreamer")]
fn open_network(
    descriptor: &SourceDescriptor,
    url: &Url,
    resolution: Resolution,
) -> Result<Box<dyn CaptureBackend>, OpenError> {
    gst_capture::GstCapture::open(url.as_str(), resolution)
        .map(|source| Box::new(source) as Box<dyn CaptureBackend>)
        .map_err(|err| OpenError::Backend {
            descriptor: descriptor.to_string(),
            message: format!("{:#}", err),
        })
}

#[cfg(not(feature = "gstreamer"))]
fn open_network(
    descriptor: &SourceDescriptor,
    _url: &Url,
    _resolution: Resolution,
) -> Result<Box<dyn CaptureBackend>, OpenError> {
    Err(OpenError::Unsupported(format!(
        "{} (network streams require the gstreamer feature)",
        descriptor
    )))
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(
    descriptor: &SourceDescriptor,
    index: u32,
    resolution: Resolution,
) -> Result<Box<dyn CaptureBackend>, OpenError> {
    v4l2::V4l2Capture::open(&format!("/dev/video{}", index), resolution)
        .map(|source| Box::new(source) as Box<dyn CaptureBackend>)
        .map_err(|err| OpenError::Backend {
            descriptor: descriptor.to_string(),
            message: format!("{:#}", err),
        })
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(
    descriptor: &SourceDescriptor,
    _index: u32,
    _resolution: Resolution,
) -> Result<Box<dyn CaptureBackend>, OpenError> {
    Err(OpenError::Unsupported(format!(
        "{} (devices require the ingest-v4l2 feature)",
        descriptor
    )))
}

// ----------------------------------------------------------------------------
// CaptureSource
// ----------------------------------------------------------------------------

/// Bounded reconnection: `max_attempts` full reopens separated by `delay`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceHealth {
    Live,
    Reconnecting,
    /// Every reconnection attempt failed; serving the last cached frame.
    Exhausted,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub read_failures: u64,
    pub reconnect_attempts: u64,
    pub descriptor: String,
}

struct CaptureTarget {
    descriptor: SourceDescriptor,
    resolution: Resolution,
}

struct Shared {
    policy: ReconnectPolicy,
    opener: BackendOpener,
    target: Mutex<Option<Arc<CaptureTarget>>>,
    backend: Mutex<Option<Box<dyn CaptureBackend>>>,
    last_frame: Mutex<Option<Frame>>,
    fps: Mutex<FpsMeter>,
    running: AtomicBool,
    reconnecting: AtomicBool,
    stop_requested: AtomicBool,
    /// Bumped by every open and stop. A reconnection task only touches
    /// shared state while the generation it was spawned under is current.
    generation: AtomicU64,
    exhausted: AtomicBool,
    frames_captured: AtomicU64,
    read_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
}

/// Resilient capture source. Safe to share across threads.
pub struct CaptureSource {
    shared: Arc<Shared>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSource {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self::with_opener(policy, default_opener())
    }

    pub fn with_opener(policy: ReconnectPolicy, opener: BackendOpener) -> Self {
        Self {
            shared: Arc::new(Shared {
                policy,
                opener,
                target: Mutex::new(None),
                backend: Mutex::new(None),
                last_frame: Mutex::new(None),
                fps: Mutex::new(FpsMeter::new()),
                running: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                exhausted: AtomicBool::new(false),
                frames_captured: AtomicU64::new(0),
                read_failures: AtomicU64::new(0),
                reconnect_attempts: AtomicU64::new(0),
            }),
            reconnect_task: Mutex::new(None),
        }
    }

    /// Open the source and confirm it with one trial read.
    pub fn open(
        &self,
        descriptor: SourceDescriptor,
        resolution: Resolution,
    ) -> Result<(), OpenError> {
        if self.shared.running.load(Ordering::SeqCst) {
            self.stop();
        }
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.exhausted.store(false, Ordering::SeqCst);

        let target = Arc::new(CaptureTarget {
            descriptor,
            resolution,
        });
        let (backend, frame) = self.shared.open_and_probe(&target)?;
        *lock(&self.shared.target) = Some(target.clone());
        *lock(&self.shared.backend) = Some(backend);
        self.shared.record(frame);
        self.shared.running.store(true, Ordering::SeqCst);
        let label = lock(&self.shared.backend)
            .as_ref()
            .map(|backend| backend.describe())
            .unwrap_or_default();
        log::info!(
            "CaptureSource: opened {} via {} ({}x{})",
            target.descriptor,
            label,
            resolution.width,
            resolution.height
        );
        Ok(())
    }

    /// Parse `raw` and open it.
    pub fn open_str(&self, raw: &str, resolution: Resolution) -> Result<(), OpenError> {
        self.open(SourceDescriptor::parse(raw)?, resolution)
    }

    /// Freshest frame, or the last good frame when the source is failing.
    ///
    /// Never raises. A failed read starts a reconnection task unless one is
    /// already running.
    pub fn get_frame(&self) -> Option<Frame> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return self.shared.cached();
        }

        let read = {
            let mut guard = lock(&self.shared.backend);
            guard.as_mut().map(|backend| backend.read_frame())
        };

        match read {
            Some(Ok(frame)) => return Some(self.shared.record(frame)),
            Some(Err(err)) => {
                self.shared.read_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("CaptureSource: read failed: {:#}", err);
                self.spawn_reconnect();
            }
            None => {}
        }
        self.shared.cached()
    }

    /// Idempotent. Releases the resource and waits (bounded) for an in-flight
    /// reconnection task to exit. A task still blocked in its backend after
    /// the bound is left detached and can no longer change this source.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);

        let task = lock(&self.reconnect_task).take();
        if let Some(task) = task {
            if !crate::join_with_timeout(task, STOP_JOIN_TIMEOUT) {
                log::warn!("CaptureSource: reconnection task did not exit in time, detaching it");
            }
        }
        self.shared.reconnecting.store(false, Ordering::SeqCst);

        let released = lock(&self.shared.backend).take();
        if released.is_some() {
            log::info!("CaptureSource: released {}", self.descriptor_label());
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> SourceHealth {
        if self.shared.stop_requested.load(Ordering::SeqCst) {
            SourceHealth::Stopped
        } else if self.shared.exhausted.load(Ordering::SeqCst) {
            SourceHealth::Exhausted
        } else if self.shared.reconnecting.load(Ordering::SeqCst) {
            SourceHealth::Reconnecting
        } else if self.shared.running.load(Ordering::SeqCst) {
            SourceHealth::Live
        } else {
            SourceHealth::Stopped
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            read_failures: self.shared.read_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.shared.reconnect_attempts.load(Ordering::Relaxed),
            descriptor: self.descriptor_label(),
        }
    }

    fn descriptor_label(&self) -> String {
        lock(&self.shared.target)
            .as_ref()
            .map(|target| target.descriptor.to_string())
            .unwrap_or_else(|| "<unopened>".to_string())
    }

    fn spawn_reconnect(&self) {
        if self
            .shared
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut task = lock(&self.reconnect_task);
        // The previous task has already cleared `reconnecting`, so it is done.
        if let Some(previous) = task.take() {
            let _ = previous.join();
        }

        let shared = self.shared.clone();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        match std::thread::Builder::new()
            .name("capture-reconnect".to_string())
            .spawn(move || shared.reconnect_loop(generation))
        {
            Ok(handle) => *task = Some(handle),
            Err(err) => {
                self.shared.reconnecting.store(false, Ordering::SeqCst);
                log::error!("CaptureSource: failed to spawn reconnection task: {}", err);
            }
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn open_and_probe(
        &self,
        target: &CaptureTarget,
    ) -> Result<(Box<dyn CaptureBackend>, Frame), OpenError> {
        let mut backend = (self.opener)(&target.descriptor, target.resolution)?;
        match backend.read_frame() {
            Ok(frame) => Ok((backend, frame)),
            Err(err) => Err(OpenError::NoFrame {
                descriptor: target.descriptor.to_string(),
                message: format!("{:#}", err),
            }),
        }
    }

    fn record(&self, frame: Frame) -> Frame {
        let fps = lock(&self.fps).tick();
        let frame = frame.with_fps(fps);
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_frame) = Some(frame.clone());
        frame
    }

    fn cached(&self) -> Option<Frame> {
        lock(&self.last_frame).clone()
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn superseded(&self, generation: u64) -> bool {
        self.stopping() || self.generation.load(Ordering::SeqCst) != generation
    }

    /// Clears `reconnecting` unless a newer open or stop already owns it.
    fn finish_reconnect(&self, generation: u64) {
        if !self.superseded(generation) {
            self.reconnecting.store(false, Ordering::SeqCst);
        }
    }

    fn reconnect_loop(&self, generation: u64) {
        let target = lock(&self.target).clone();
        let Some(target) = target else {
            self.finish_reconnect(generation);
            return;
        };
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if self.superseded(generation) {
                break;
            }
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "CaptureSource: reconnecting to {} (attempt {}/{})",
                target.descriptor,
                attempt,
                max_attempts
            );

            {
                let mut guard = lock(&self.backend);
                if self.superseded(generation) {
                    break;
                }
                drop(guard.take());
            }

            match self.open_and_probe(&target) {
                Ok((backend, frame)) => {
                    let mut guard = lock(&self.backend);
                    if self.superseded(generation) {
                        log::info!(
                            "CaptureSource: discarding reconnection to {} from a previous open",
                            target.descriptor
                        );
                        break;
                    }
                    *guard = Some(backend);
                    self.record(frame);
                    drop(guard);
                    log::info!(
                        "CaptureSource: reconnected to {} after {} attempt(s)",
                        target.descriptor,
                        attempt
                    );
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(err) => {
                    log::warn!(
                        "CaptureSource: reconnection attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        err
                    );
                }
            }

            if attempt < max_attempts {
                self.sleep_unless_superseded(self.policy.delay, generation);
            }
        }

        // Held so a concurrent open cannot interleave with the exhaustion flags.
        let guard = lock(&self.backend);
        if !self.superseded(generation) {
            self.running.store(false, Ordering::SeqCst);
            self.exhausted.store(true, Ordering::SeqCst);
            let exhausted = ReconnectExhausted {
                descriptor: target.descriptor.to_string(),
                attempts: max_attempts,
            };
            log::warn!("CaptureSource: {}", exhausted);
        }
        drop(guard);
        self.finish_reconnect(generation);
    }

    fn sleep_unless_superseded(&self, delay: Duration, generation: u64) {
        let deadline = Instant::now() + delay;
        while !self.superseded(generation) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_shapes() {
        assert_eq!(
            SourceDescriptor::parse("0").unwrap(),
            SourceDescriptor::Device(0)
        );
        assert_eq!(
            SourceDescriptor::parse("/dev/video2").unwrap(),
            SourceDescriptor::Device(2)
        );
        assert_eq!(
            SourceDescriptor::parse("stub://front").unwrap(),
            SourceDescriptor::Synthetic("front".to_string())
        );
        assert!(matches!(
            SourceDescriptor::parse("rtsp://10.0.0.5:554/stream").unwrap(),
            SourceDescriptor::NetworkStream(url) if url.scheme() == "rtsp"
        ));
        assert_eq!(
            SourceDescriptor::parse("clips/demo.mp4").unwrap(),
            SourceDescriptor::File(PathBuf::from("clips/demo.mp4"))
        );
        assert!(SourceDescriptor::parse("   ").is_err());
        assert!(SourceDescriptor::parse("gopher://x").is_err());
    }

    #[test]
    fn synthetic_source_opens_and_serves_frames() -> Result<()> {
        let source = CaptureSource::new(ReconnectPolicy::default());
        source.open_str("stub://unit", Resolution::new(32, 24))?;
        let frame = source.get_frame().expect("frame");
        assert_eq!((frame.width, frame.height, frame.channels), (32, 24, 3));
        assert_eq!(source.health(), SourceHealth::Live);

        source.stop();
        source.stop();
        assert_eq!(source.health(), SourceHealth::Stopped);
        // Stale frame stays available after stop.
        assert!(source.get_frame().is_some());
        Ok(())
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn network_streams_need_a_backend() {
        let source = CaptureSource::new(ReconnectPolicy::default());
        let err = source
            .open_str("rtsp://127.0.0.1/stream", Resolution::default())
            .unwrap_err();
        assert!(matches!(err, OpenError::Unsupported(_)));
        assert!(source.get_frame().is_none());
    }
}
