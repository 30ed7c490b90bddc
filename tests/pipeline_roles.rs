use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use roi_stream::detect::{Detector, SharedDetector, StaticDetector};
use roi_stream::encode::ProcessedFrame;
use roi_stream::native::{create_publisher, PublisherConfig};
use roi_stream::server::SessionId;
use roi_stream::{
    BoundingBox, CaptureSource, ClientConfig, Detection, FrameProcessor, Pipeline, PipelineConfig,
    QualityProfile, ReconnectPolicy, RegionEncoder, Resolution, Role, ServerConfig,
    SessionClient, SessionServer, SharedQuality,
};

struct FailingDetector;

impl Detector for FailingDetector {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn detect(&mut self, _frame: &roi_stream::Frame) -> anyhow::Result<Vec<Detection>> {
        Err(anyhow::anyhow!("model unavailable"))
    }
}

fn processor(class: &str) -> anyhow::Result<FrameProcessor> {
    let detector: SharedDetector = Arc::new(Mutex::new(StaticDetector::new(vec![Detection::new(
        class,
        0.8,
        BoundingBox::new(4, 4, 8, 8),
    )])));
    Ok(FrameProcessor::new(
        detector,
        RegionEncoder::without_overlay(),
        SharedQuality::new(QualityProfile::new(15, 35)?),
    ))
}

fn stub_source(name: &str) -> anyhow::Result<Arc<CaptureSource>> {
    let source = Arc::new(CaptureSource::new(ReconnectPolicy::default()));
    source.open_str(&format!("stub://{}", name), Resolution::new(32, 24))?;
    Ok(source)
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn raw_client_uses_server_regions() -> anyhow::Result<()> {
    let server = SessionServer::new(ServerConfig::ephemeral("127.0.0.1"), processor("server")?);
    let addr = server.start()?;

    let mut client = SessionClient::new(ClientConfig::default());
    client.connect("127.0.0.1", addr.port() as i64)?;

    let classes = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = classes.clone();
    let source = stub_source("client")?;
    let mut handle = Pipeline::new(
        PipelineConfig {
            send_raw: true,
            ..PipelineConfig::default()
        },
        source.clone(),
        processor("local")?,
        Role::Client(client),
    )
    .with_observer(Arc::new(move |processed: &ProcessedFrame| {
        let mut seen = seen.lock().unwrap();
        seen.extend(processed.regions.iter().map(|r| r.class.clone()));
    }))
    .start()?;

    assert!(wait_for(|| handle.frames_processed() >= 3));
    assert_eq!(server.session_count(), 1);
    assert_eq!(handle.status(), "1 detections: server(0.80)");

    handle.stop();
    assert!(classes.lock().unwrap().iter().all(|class| class == "server"));
    assert!(wait_for(|| server.session_count() == 0));

    source.stop();
    server.stop();
    Ok(())
}

#[test]
fn client_reports_disconnect_when_server_stops() -> anyhow::Result<()> {
    let server = SessionServer::new(ServerConfig::ephemeral("127.0.0.1"), processor("server")?);
    let addr = server.start()?;

    let mut client = SessionClient::new(ClientConfig::default());
    client.connect("127.0.0.1", addr.port() as i64)?;
    let source = stub_source("outage")?;
    let mut handle = Pipeline::spawn(
        PipelineConfig::default(),
        source.clone(),
        processor("local")?,
        Role::Client(client),
    )?;
    assert!(wait_for(|| handle.frames_processed() >= 1));

    server.stop();
    assert!(wait_for(|| handle.status() == "disconnected"));
    let processed = handle.frames_processed();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(handle.frames_processed(), processed);

    handle.stop();
    source.stop();
    Ok(())
}

#[test]
fn local_pipeline_publishes_over_a_session() -> anyhow::Result<()> {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let server = SessionServer::new(ServerConfig::ephemeral("127.0.0.1"), processor("server")?)
    .with_observer(Arc::new(move |_id: SessionId, _processed: &ProcessedFrame| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let addr = server.start()?;

    let publisher = create_publisher(PublisherConfig::new(
        format!("tcp://127.0.0.1:{}", addr.port()),
        32,
        24,
    ))?;
    let source = stub_source("publish")?;
    let mut handle = Pipeline::new(
        PipelineConfig::default(),
        source.clone(),
        processor("local")?,
        Role::Local,
    )
    .with_publisher(publisher)
    .start()?;

    assert!(wait_for(|| received.load(Ordering::SeqCst) >= 3));
    assert_eq!(server.session_count(), 1);

    handle.stop();
    assert!(wait_for(|| server.session_count() == 0));
    source.stop();
    server.stop();
    Ok(())
}

#[test]
fn publisher_start_failure_aborts_the_pipeline() -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let publisher = create_publisher(PublisherConfig::new(
        format!("tcp://127.0.0.1:{}", port),
        32,
        24,
    ))?;
    let source = stub_source("nowhere")?;
    let started = Pipeline::new(
        PipelineConfig::default(),
        source.clone(),
        processor("local")?,
        Role::Local,
    )
    .with_publisher(publisher)
    .start();
    assert!(started.is_err());
    source.stop();
    Ok(())
}

#[test]
fn frames_the_server_cannot_process_are_skipped() -> anyhow::Result<()> {
    let failing: SharedDetector = Arc::new(Mutex::new(FailingDetector));
    let server = SessionServer::new(
        ServerConfig::ephemeral("127.0.0.1"),
        FrameProcessor::new(
            failing,
            RegionEncoder::without_overlay(),
            SharedQuality::new(QualityProfile::new(15, 35)?),
        ),
    );
    let addr = server.start()?;

    let mut client = SessionClient::new(ClientConfig::default());
    client.connect("127.0.0.1", addr.port() as i64)?;
    let source = stub_source("skipped")?;
    let mut handle = Pipeline::spawn(
        PipelineConfig {
            send_raw: true,
            ..PipelineConfig::default()
        },
        source.clone(),
        processor("local")?,
        Role::Client(client),
    )?;

    assert!(wait_for(|| handle.frames_skipped() >= 3));
    assert_eq!(handle.frames_processed(), 0);
    assert_eq!(handle.status(), "frame skipped by server");
    assert_eq!(server.session_count(), 1);

    handle.stop();
    source.stop();
    server.stop();
    Ok(())
}
