use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;

use roi_stream::error::OpenError;
use roi_stream::ingest::{BackendOpener, CaptureBackend, CaptureSource, ReconnectPolicy, SourceHealth};
use roi_stream::{Frame, Resolution, SourceDescriptor};

/// A camera whose availability the test controls.
#[derive(Clone, Default)]
struct Script {
    opens: Arc<AtomicUsize>,
    refuse_open: Arc<AtomicBool>,
    broken: Arc<AtomicBool>,
    /// The next open blocks until `release` is set.
    hang_next: Arc<AtomicBool>,
    release: Arc<AtomicBool>,
    hung_returned: Arc<AtomicBool>,
}

impl Script {
    fn outage(&self) {
        self.refuse_open.store(true, Ordering::SeqCst);
        self.broken.store(true, Ordering::SeqCst);
    }

    fn recover(&self) {
        self.broken.store(false, Ordering::SeqCst);
        self.refuse_open.store(false, Ordering::SeqCst);
    }

    fn opener(&self) -> BackendOpener {
        let script = self.clone();
        Arc::new(move |descriptor: &SourceDescriptor, _resolution: Resolution| {
            let generation = script.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if script.hang_next.swap(false, Ordering::SeqCst) {
                while !script.release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                script.hung_returned.store(true, Ordering::SeqCst);
            }
            if script.refuse_open.load(Ordering::SeqCst) {
                return Err(OpenError::Backend {
                    descriptor: descriptor.to_string(),
                    message: "device unplugged".to_string(),
                });
            }
            Ok(Box::new(ScriptedCamera {
                generation: generation as u8,
                broken: script.broken.clone(),
            }) as Box<dyn CaptureBackend>)
        })
    }
}

struct ScriptedCamera {
    generation: u8,
    broken: Arc<AtomicBool>,
}

impl CaptureBackend for ScriptedCamera {
    fn read_frame(&mut self) -> anyhow::Result<Frame> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(anyhow!("read timed out"));
        }
        let g = self.generation;
        Ok(Frame::filled(4, 4, [g, g, g]))
    }

    fn describe(&self) -> String {
        format!("scripted camera #{}", self.generation)
    }
}

fn policy(max_attempts: u32, delay_ms: u64) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        delay: Duration::from_millis(delay_ms),
    }
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn open(script: &Script, policy: ReconnectPolicy) -> anyhow::Result<CaptureSource> {
    let source = CaptureSource::with_opener(policy, script.opener());
    source.open(SourceDescriptor::Device(0), Resolution::new(4, 4))?;
    Ok(source)
}

#[test]
fn serves_last_frame_through_an_outage_until_exhausted() -> anyhow::Result<()> {
    let script = Script::default();
    let source = open(&script, policy(3, 10))?;
    let before = source.get_frame().expect("live frame");
    assert_eq!(source.health(), SourceHealth::Live);

    script.outage();
    let stale = source.get_frame().expect("cached frame during outage");
    assert_eq!(stale.pixels(), before.pixels());

    assert!(wait_for(|| source.health() == SourceHealth::Exhausted));
    assert!(!source.is_running());
    assert_eq!(source.stats().reconnect_attempts, 3);

    let after = source.get_frame().expect("cached frame after exhaustion");
    assert_eq!(after.pixels(), before.pixels());
    Ok(())
}

#[test]
fn recovers_when_the_device_returns() -> anyhow::Result<()> {
    let script = Script::default();
    let source = open(&script, policy(50, 20))?;
    assert_eq!(source.get_frame().expect("frame").pixel(0, 0), Some(&[1, 1, 1][..]));

    script.outage();
    assert!(source.get_frame().is_some());
    assert!(wait_for(|| source.stats().reconnect_attempts >= 2));
    script.recover();

    assert!(wait_for(|| source.health() == SourceHealth::Live));
    let fresh = source.get_frame().expect("fresh frame");
    assert!(fresh.pixel(0, 0).expect("pixel")[0] > 1);
    assert!(source.stats().read_failures >= 1);
    Ok(())
}

#[test]
fn concurrent_failures_start_a_single_reconnection() -> anyhow::Result<()> {
    let script = Script::default();
    let source = Arc::new(open(&script, policy(3, 30))?);
    script.outage();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let source = source.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    assert!(source.get_frame().is_some());
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().expect("reader thread");
    }

    assert!(wait_for(|| source.health() == SourceHealth::Exhausted));
    // One initial open plus one per reconnection attempt.
    assert_eq!(script.opens.load(Ordering::SeqCst), 4);
    Ok(())
}

#[test]
fn stop_interrupts_a_pending_reconnection() -> anyhow::Result<()> {
    let script = Script::default();
    let source = open(&script, policy(5, 10_000))?;
    script.outage();
    assert!(source.get_frame().is_some());
    assert!(wait_for(|| source.stats().reconnect_attempts >= 1));

    let started = Instant::now();
    source.stop();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(source.health(), SourceHealth::Stopped);

    source.stop();
    assert_eq!(source.health(), SourceHealth::Stopped);
    Ok(())
}

#[test]
fn open_failures_are_reported() {
    let script = Script::default();
    script.outage();
    let source = CaptureSource::with_opener(policy(1, 1), script.opener());
    assert!(matches!(
        source.open(SourceDescriptor::Device(0), Resolution::new(4, 4)),
        Err(OpenError::Backend { .. })
    ));
    assert!(source.get_frame().is_none());

    script.refuse_open.store(false, Ordering::SeqCst);
    assert!(matches!(
        source.open(SourceDescriptor::Device(0), Resolution::new(4, 4)),
        Err(OpenError::NoFrame { .. })
    ));
}

#[test]
fn unsupported_descriptors_fail_to_open() {
    let source = CaptureSource::new(ReconnectPolicy::default());
    #[cfg(not(feature = "gstreamer"))]
    assert!(matches!(
        source.open_str("rtsp://camera.local/stream", Resolution::new(4, 4)),
        Err(OpenError::Unsupported(_))
    ));
    assert!(matches!(
        source.open_str("", Resolution::new(4, 4)),
        Err(OpenError::InvalidDescriptor(_))
    ));
}

#[test]
fn detached_reconnection_cannot_hijack_a_reopened_source() -> anyhow::Result<()> {
    let script = Script::default();
    let source = open(&script, policy(50, 20))?;

    script.hang_next.store(true, Ordering::SeqCst);
    script.broken.store(true, Ordering::SeqCst);
    assert!(source.get_frame().is_some());
    assert!(wait_for(|| script.opens.load(Ordering::SeqCst) == 2));

    // The reconnection task is stuck in the backend past the stop bound.
    source.stop();
    assert_eq!(source.health(), SourceHealth::Stopped);

    script.broken.store(false, Ordering::SeqCst);
    source.open(SourceDescriptor::Device(0), Resolution::new(4, 4))?;
    assert_eq!(source.get_frame().expect("frame").pixel(0, 0), Some(&[3, 3, 3][..]));

    script.release.store(true, Ordering::SeqCst);
    assert!(wait_for(|| script.hung_returned.load(Ordering::SeqCst)));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(source.health(), SourceHealth::Live);
    assert_eq!(source.get_frame().expect("frame").pixel(0, 0), Some(&[3, 3, 3][..]));

    // A fresh failure still starts its own reconnection.
    script.outage();
    assert!(source.get_frame().is_some());
    assert!(wait_for(|| script.opens.load(Ordering::SeqCst) >= 4));
    script.recover();
    assert!(wait_for(|| source.health() == SourceHealth::Live));
    let fresh = source.get_frame().expect("fresh frame");
    assert!(fresh.pixel(0, 0).expect("pixel")[0] >= 4);
    Ok(())
}
