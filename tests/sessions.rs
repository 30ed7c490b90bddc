use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;

use roi_stream::detect::{Detector, SharedDetector, StaticDetector};
use roi_stream::error::ProtocolError;
use roi_stream::encode::ProcessedFrame;
use roi_stream::server::{ServerState, SessionId, SessionState};
use roi_stream::transport::{write_frame, EncodedFrame, PixelEncoding};
use roi_stream::{
    BoundingBox, ClientConfig, ClientState, Detection, Frame, FrameProcessor, QualityProfile,
    RegionEncoder, ServerConfig, SessionClient, SessionServer, SharedQuality,
};

struct BrokenDetector;

impl Detector for BrokenDetector {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        Err(anyhow!("model crashed"))
    }
}

fn processor(detector: SharedDetector) -> anyhow::Result<FrameProcessor> {
    Ok(FrameProcessor::new(
        detector,
        RegionEncoder::without_overlay(),
        SharedQuality::new(QualityProfile::new(15, 35)?),
    ))
}

fn person_detector() -> SharedDetector {
    Arc::new(Mutex::new(StaticDetector::new(vec![Detection::new(
        "person",
        0.9,
        BoundingBox::new(1, 1, 4, 4),
    )])))
}

fn start_server(config: ServerConfig, detector: SharedDetector) -> anyhow::Result<(SessionServer, SocketAddr)> {
    let server = SessionServer::new(config, processor(detector)?);
    let addr = server.start()?;
    Ok((server, addr))
}

fn connect(addr: SocketAddr) -> anyhow::Result<SessionClient> {
    let mut client = SessionClient::new(ClientConfig::default());
    client.connect("127.0.0.1", addr.port() as i64)?;
    Ok(client)
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

fn small_frame() -> anyhow::Result<EncodedFrame> {
    EncodedFrame::from_frame(&Frame::filled(8, 8, [90, 60, 30]), &[], PixelEncoding::Raw)
}

#[test]
fn sessions_are_tracked_per_client() -> anyhow::Result<()> {
    let (server, addr) = start_server(ServerConfig::ephemeral("127.0.0.1"), person_detector())?;
    assert_eq!(server.state(), ServerState::Listening);

    let mut first = connect(addr)?;
    let mut second = connect(addr)?;
    assert!(wait_for(|| server.session_count() == 2));
    assert_eq!(server.status(), format!("listening on {}, 2 sessions", addr));

    let reply = first.exchange(&small_frame()?)?.expect("reply");
    assert_eq!(reply.regions().len(), 1);
    assert!(!reply.is_unprocessed());
    assert!(second.exchange(&small_frame()?)?.is_some());

    let sessions = server.sessions();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.state == SessionState::Connected));
    assert!(sessions.iter().all(|s| s.frames_received == 1));
    assert!(sessions[0].id < sessions[1].id);

    first.disconnect();
    assert_eq!(first.state(), ClientState::Disconnected);
    assert!(wait_for(|| server.session_count() == 1));

    // The surviving session is unaffected.
    assert!(second.exchange(&small_frame()?)?.is_some());

    server.stop();
    assert_eq!(server.session_count(), 0);
    assert_eq!(server.status(), "stopped");
    Ok(())
}

#[test]
fn truncated_frame_drops_only_that_session() -> anyhow::Result<()> {
    let (server, addr) = start_server(ServerConfig::ephemeral("127.0.0.1"), person_detector())?;
    let mut healthy = connect(addr)?;

    let mut raw = TcpStream::connect(addr)?;
    assert!(wait_for(|| server.session_count() == 2));
    raw.write_all(&1_000u32.to_be_bytes())?;
    raw.write_all(&[0u8; 10])?;
    drop(raw);

    assert!(wait_for(|| server.session_count() == 1));
    assert!(healthy.exchange(&small_frame()?)?.is_some());
    server.stop();
    Ok(())
}

#[test]
fn malformed_payload_closes_the_session() -> anyhow::Result<()> {
    let (server, addr) = start_server(ServerConfig::ephemeral("127.0.0.1"), person_detector())?;
    let mut raw = TcpStream::connect(addr)?;
    assert!(wait_for(|| server.session_count() == 1));

    write_frame(&mut raw, &[9, 0, 0, 0, 0])?;
    assert!(wait_for(|| server.session_count() == 0));
    server.stop();
    Ok(())
}

#[test]
fn detector_failure_echoes_the_frame() -> anyhow::Result<()> {
    let broken: SharedDetector = Arc::new(Mutex::new(BrokenDetector));
    let (server, addr) = start_server(ServerConfig::ephemeral("127.0.0.1"), broken)?;
    let mut client = connect(addr)?;

    let frame = Frame::filled(6, 4, [1, 2, 3]);
    let reply = client
        .exchange(&EncodedFrame::from_frame(&frame, &[], PixelEncoding::Raw)?)?
        .expect("echo");
    assert!(reply.regions().is_empty());
    assert!(reply.is_unprocessed());
    assert_eq!(reply.decode_frame()?.pixels(), frame.pixels());
    assert!(client.is_connected());
    server.stop();
    Ok(())
}

#[test]
fn reply_timeout_disconnects_the_client() -> anyhow::Result<()> {
    let config = ServerConfig::ephemeral("127.0.0.1").with_reply(false);
    let (server, addr) = start_server(config, person_detector())?;

    let mut client = SessionClient::new(ClientConfig {
        reply_timeout: Duration::from_millis(100),
        ..ClientConfig::default()
    });
    client.connect("127.0.0.1", addr.port() as i64)?;
    let err = client.exchange(&small_frame()?).unwrap_err();
    assert!(matches!(err, ProtocolError::Io(_)));
    assert_eq!(client.state(), ClientState::Disconnected);
    server.stop();
    Ok(())
}

#[test]
fn fire_and_forget_clients_feed_observers() -> anyhow::Result<()> {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let server = SessionServer::new(
        ServerConfig::ephemeral("127.0.0.1").with_reply(false),
        processor(person_detector())?,
    )
    .with_observer(Arc::new(move |_id: SessionId, processed: &ProcessedFrame| {
        assert_eq!(processed.regions.len(), 1);
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let addr = server.start()?;

    let mut client = SessionClient::new(ClientConfig {
        expect_reply: false,
        ..ClientConfig::default()
    });
    client.connect("127.0.0.1", addr.port() as i64)?;
    for _ in 0..3 {
        assert!(client.exchange(&small_frame()?)?.is_none());
    }
    assert!(wait_for(|| seen.load(Ordering::SeqCst) == 3));
    server.stop();
    Ok(())
}

#[test]
fn fire_and_forget_client_keeps_up_with_a_replying_server() -> anyhow::Result<()> {
    let (server, addr) = start_server(ServerConfig::ephemeral("127.0.0.1"), person_detector())?;
    let mut client = SessionClient::new(ClientConfig {
        expect_reply: false,
        ..ClientConfig::default()
    });
    client.connect("127.0.0.1", addr.port() as i64)?;

    // Enough reply bytes to fill both socket buffers many times over.
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let sender = std::thread::spawn(move || -> anyhow::Result<SessionClient> {
        let frame = Frame::filled(320, 240, [40, 80, 120]);
        for _ in 0..80 {
            client.send_frame(&frame, &[])?;
        }
        let _ = done_tx.send(());
        Ok(client)
    });
    assert!(
        done_rx.recv_timeout(Duration::from_secs(60)).is_ok(),
        "sender stalled or failed"
    );
    let mut client = sender.join().expect("sender thread")?;
    assert!(client.is_connected());
    assert!(wait_for(|| client.replies_discarded() >= 1));

    client.disconnect();
    assert!(wait_for(|| server.session_count() == 0));
    server.stop();
    Ok(())
}

#[test]
fn fire_and_forget_client_notices_server_close() -> anyhow::Result<()> {
    let (server, addr) = start_server(ServerConfig::ephemeral("127.0.0.1"), person_detector())?;
    let mut client = SessionClient::new(ClientConfig {
        expect_reply: false,
        ..ClientConfig::default()
    });
    client.connect("127.0.0.1", addr.port() as i64)?;
    assert!(wait_for(|| server.session_count() == 1));

    server.stop();
    let closed = wait_for(|| client.send(&small_frame().expect("frame")).is_err());
    assert!(closed);
    assert_eq!(client.state(), ClientState::Disconnected);
    Ok(())
}

#[test]
fn stop_closes_connected_clients() -> anyhow::Result<()> {
    let (server, addr) = start_server(ServerConfig::ephemeral("127.0.0.1"), person_detector())?;
    let mut client = connect(addr)?;
    assert!(wait_for(|| server.session_count() == 1));
    assert!(server.start().is_err());

    let started = Instant::now();
    server.stop();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(server.state(), ServerState::Stopped);

    assert!(client.exchange(&small_frame()?).is_err() || !client.is_connected());
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
    server.stop();
    Ok(())
}

#[test]
fn invalid_ports_are_rejected() {
    assert!(ServerConfig::new("127.0.0.1", 0).is_err());
    assert!(ServerConfig::new("127.0.0.1", 65_536).is_err());
    assert!(ServerConfig::new("", 8089).is_err());
    assert!(ServerConfig::new("127.0.0.1", 8089).is_ok());
}
