use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::frame::Resolution;
use crate::ingest::{CaptureSource, ReconnectPolicy, SourceDescriptor};

use super::{FrameCallback, StreamIngest};

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Delivers frames from a `CaptureSource` to a callback on its own thread.
pub struct CaptureIngest {
    descriptor: SourceDescriptor,
    resolution: Resolution,
    interval: Duration,
    source: Arc<CaptureSource>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureIngest {
    pub fn new(
        descriptor: SourceDescriptor,
        resolution: Resolution,
        policy: ReconnectPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            descriptor,
            resolution,
            interval,
            source: Arc::new(CaptureSource::new(policy)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn source(&self) -> Arc<CaptureSource> {
        self.source.clone()
    }
}

impl StreamIngest for CaptureIngest {
    fn initialize(&mut self) -> Result<()> {
        self.source
            .open(self.descriptor.clone(), self.resolution)
            .map_err(Into::into)
    }

    fn start(&mut self, mut on_frame: FrameCallback) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("ingest already started"));
        }
        let source = self.source.clone();
        let running = self.running.clone();
        let interval = self.interval;
        let worker = std::thread::Builder::new()
            .name("capture-ingest".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if let Some(frame) = source.get_frame() {
                        on_frame(frame);
                    }
                    std::thread::sleep(interval);
                }
            });
        match worker {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(anyhow!("spawn ingest thread: {}", err))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if !crate::join_with_timeout(worker, JOIN_TIMEOUT) {
                log::warn!("CaptureIngest: worker did not exit in time");
            }
        }
        self.source.stop();
        Ok(())
    }
}

impl Drop for CaptureIngest {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
