//! Capture-driven processing loop for the local and client roles.
//!
//! One dedicated thread pulls the freshest frame from a `CaptureSource`,
//! processes it (locally, remotely, or both) and hands the result to
//! observers, the snapshot writer and an optional publisher. The loop sleeps
//! a fixed `pacing` between iterations, which caps throughput at roughly
//! `1 / pacing` frames per second.
//!
//! The server role is `SessionServer` itself and does not run here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::client::SessionClient;
use crate::config::{SnapshotSettings, StreamConfig};
use crate::encode::{encode_jpeg, FrameProcessor, ProcessedFrame};
use crate::frame::Frame;
use crate::ingest::CaptureSource;
use crate::native::StreamPublisher;
use crate::transport::EncodedFrame;

const SNAPSHOT_JPEG_QUALITY: u8 = 90;

pub type PipelineObserver = Arc<dyn Fn(&ProcessedFrame) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub pacing: Duration,
    /// Client role only: forward the unprocessed capture and let the server
    /// do detection and encoding.
    pub send_raw: bool,
    pub snapshots: Option<SnapshotSettings>,
    pub health_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(10),
            send_raw: false,
            snapshots: None,
            health_interval: Duration::from_secs(5),
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            send_raw: config.client.send_raw,
            snapshots: config.snapshots.clone(),
            ..Self::default()
        }
    }
}

pub enum Role {
    Local,
    Client(SessionClient),
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Role::Local => "local",
            Role::Client(_) => "client",
        }
    }
}

#[derive(Default)]
struct PipelineShared {
    running: AtomicBool,
    status: Mutex<String>,
    frames_processed: AtomicU64,
    frames_skipped: AtomicU64,
}

impl PipelineShared {
    fn set_status(&self, status: impl Into<String>) {
        let mut guard = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = status.into();
    }

    fn status(&self) -> String {
        match self.status.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<CaptureSource>,
    processor: FrameProcessor,
    role: Role,
    observers: Vec<PipelineObserver>,
    publisher: Option<Box<dyn StreamPublisher>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<CaptureSource>,
        processor: FrameProcessor,
        role: Role,
    ) -> Self {
        Self {
            config,
            source,
            processor,
            role,
            observers: Vec::new(),
            publisher: None,
        }
    }

    /// Start with no observers or publisher.
    pub fn spawn(
        config: PipelineConfig,
        source: Arc<CaptureSource>,
        processor: FrameProcessor,
        role: Role,
    ) -> Result<PipelineHandle> {
        Self::new(config, source, processor, role).start()
    }

    pub fn with_observer(mut self, observer: PipelineObserver) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_publisher(mut self, publisher: Box<dyn StreamPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn start(mut self) -> Result<PipelineHandle> {
        if let Some(snapshots) = &self.config.snapshots {
            if snapshots.every_n_frames == 0 {
                return Err(anyhow!("snapshot interval must be at least 1 frame"));
            }
            std::fs::create_dir_all(&snapshots.dir)
                .with_context(|| format!("create snapshot dir {}", snapshots.dir.display()))?;
        }
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.initialize().context("initialize publisher")?;
            publisher.start().context("start publisher")?;
        }

        let shared = Arc::new(PipelineShared::default());
        shared.running.store(true, Ordering::SeqCst);
        shared.set_status("waiting for frames");
        let join_timeout = self.config.join_timeout;
        let label = self.role.label();

        let worker = Worker {
            pipeline: self,
            shared: shared.clone(),
        };
        let thread = std::thread::Builder::new()
            .name(format!("pipeline-{}", label))
            .spawn(move || worker.run())
            .map_err(|err| anyhow!("spawn pipeline thread: {}", err))?;
        log::info!("Pipeline: started in {} role", label);

        Ok(PipelineHandle {
            shared,
            thread: Some(thread),
            join_timeout,
        })
    }
}

pub struct PipelineHandle {
    shared: Arc<PipelineShared>,
    thread: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl PipelineHandle {
    /// Request the loop to exit and wait up to the join timeout. Idempotent.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if !crate::join_with_timeout(thread, self.join_timeout) {
                log::warn!("Pipeline: worker did not exit in time");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn status(&self) -> String {
        self.shared.status()
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.shared.frames_skipped.load(Ordering::Relaxed)
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    pipeline: Pipeline,
    shared: Arc<PipelineShared>,
}

impl Worker {
    fn run(mut self) {
        let mut last_health_log = Instant::now();
        while self.shared.running.load(Ordering::SeqCst) {
            self.step();

            if last_health_log.elapsed() >= self.pipeline.config.health_interval {
                let stats = self.pipeline.source.stats();
                log::info!(
                    "Pipeline: health source={} {:?} captured={} processed={} skipped={} status={}",
                    stats.descriptor,
                    self.pipeline.source.health(),
                    stats.frames_captured,
                    self.shared.frames_processed.load(Ordering::Relaxed),
                    self.shared.frames_skipped.load(Ordering::Relaxed),
                    self.shared.status()
                );
                last_health_log = Instant::now();
            }

            std::thread::sleep(self.pipeline.config.pacing);
        }

        if let Role::Client(client) = &mut self.pipeline.role {
            client.disconnect();
        }
        if let Some(publisher) = self.pipeline.publisher.as_mut() {
            if let Err(err) = publisher.stop() {
                log::warn!("Pipeline: publisher stop failed: {:#}", err);
            }
        }
        log::info!("Pipeline: stopped");
    }

    fn step(&mut self) {
        let Some(frame) = self.pipeline.source.get_frame() else {
            self.shared.set_status("waiting for frames");
            return;
        };

        let outcome = match self.pipeline.role {
            Role::Local => self.process_local(&frame),
            Role::Client(_) => self.process_remote(&frame),
        };
        match outcome {
            Ok(Some(processed)) => self.deliver(processed),
            Ok(None) => {}
            Err(err) => {
                self.shared.frames_skipped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Pipeline: frame skipped: {:#}", err);
            }
        }
    }

    fn process_local(&self, frame: &Frame) -> Result<Option<ProcessedFrame>> {
        let processed = self.pipeline.processor.process(frame).map_err(|err| {
            self.shared.set_status(format!("frame skipped: {}", err));
            err
        })?;
        Ok(Some(processed))
    }

    /// Client role. The server's reply wins when there is one; otherwise the
    /// locally processed frame (if any) is delivered.
    fn process_remote(&mut self, frame: &Frame) -> Result<Option<ProcessedFrame>> {
        let connected = match &self.pipeline.role {
            Role::Client(client) => client.is_connected(),
            Role::Local => return self.process_local(frame),
        };
        if !connected {
            self.shared.set_status("disconnected");
            return Ok(None);
        }

        let local = if self.pipeline.config.send_raw {
            None
        } else {
            self.process_local(frame)?
        };
        let Role::Client(client) = &mut self.pipeline.role else {
            return Ok(local);
        };

        let encoding = client.config().encoding;
        let payload = match &local {
            Some(processed) => {
                EncodedFrame::from_frame(&processed.frame, &processed.regions, encoding)?
            }
            None => EncodedFrame::from_frame(frame, &[], encoding)?,
        };

        match client.exchange(&payload) {
            Ok(Some(reply)) if reply.is_unprocessed() => {
                self.shared.frames_skipped.fetch_add(1, Ordering::Relaxed);
                self.shared.set_status("frame skipped by server");
                Ok(None)
            }
            Ok(Some(reply)) => {
                let frame = reply.decode_frame()?;
                Ok(Some(ProcessedFrame {
                    frame,
                    regions: reply.regions().to_vec(),
                }))
            }
            Ok(None) if client.is_connected() => Ok(local),
            Ok(None) => {
                self.shared.set_status("disconnected");
                Ok(None)
            }
            Err(err) => {
                self.shared.set_status("disconnected");
                Err(anyhow!(err).context("exchange with server"))
            }
        }
    }

    fn deliver(&mut self, processed: ProcessedFrame) {
        let count = self.shared.frames_processed.fetch_add(1, Ordering::Relaxed) + 1;

        for observer in &self.pipeline.observers {
            observer(&processed);
        }

        if let Some(snapshots) = &self.pipeline.config.snapshots {
            if count % snapshots.every_n_frames == 0 {
                if let Err(err) = write_snapshot(&snapshots.dir, count, &processed.frame) {
                    log::warn!("Pipeline: snapshot {} failed: {:#}", count, err);
                }
            }
        }

        if let Some(publisher) = self.pipeline.publisher.as_mut() {
            if let Err(err) = publisher.push_frame(&processed.frame, &processed.regions) {
                log::warn!("Pipeline: publish failed: {:#}", err);
            }
        }

        self.shared.set_status(processed.status());
    }
}

fn write_snapshot(dir: &std::path::Path, index: u64, frame: &Frame) -> Result<PathBuf> {
    let rgb = frame.to_image()?.to_rgb8();
    let bytes = encode_jpeg(&rgb, SNAPSHOT_JPEG_QUALITY)?;
    let path = dir.join(format!("frame_{:06}.jpg", index));
    std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    log::debug!("Pipeline: snapshot {}", path.display());
    Ok(path)
}
