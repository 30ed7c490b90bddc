//! roi_streamd - capture, region-encode and stream video frames.
//!
//! Modes:
//! - `local`: capture, detect and encode in-process; snapshots and an
//!   optional publisher receive the result
//! - `client`: capture and send each frame to a `server`, displaying replies
//! - `server`: accept sessions and process every frame clients send

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use roi_stream::config::validate_port;
use roi_stream::detect::registry_from_settings;
use roi_stream::encode::ProcessedFrame;
use roi_stream::native::{create_publisher, PublisherConfig};
use roi_stream::{
    CaptureSource, ClientConfig, FrameProcessor, Pipeline, PipelineConfig, QualityProfile,
    ReconnectPolicy, RegionEncoder, Resolution, Role, ServerConfig, SessionClient,
    SessionId, SessionServer, SharedQuality, StreamConfig,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Local,
    Client,
    Server,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Local)]
    mode: Mode,
    /// JSON or TOML config file.
    #[arg(long, env = "ROI_STREAM_CONFIG")]
    config: Option<PathBuf>,
    /// Capture source: device index, /dev/videoN, stream URL, file path or stub://name.
    #[arg(long)]
    source: Option<String>,
    /// Server address to bind (server) or connect to (client).
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    port: Option<i64>,
    #[arg(long)]
    roi_qp: Option<i64>,
    #[arg(long)]
    background_qp: Option<i64>,
    /// Detector backend name (motion, static, tract).
    #[arg(long)]
    detector: Option<String>,
    /// Publish processed frames to this URL (tcp://host:port, rtmp://...).
    #[arg(long)]
    publish: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = resolve_config(&args)?;
    log::info!(
        "roi_streamd {} starting in {:?} mode (roi_qp={}, background_qp={})",
        env!("CARGO_PKG_VERSION"),
        args.mode,
        cfg.quality.roi_qp(),
        cfg.quality.background_qp()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    match args.mode {
        Mode::Server => run_server(&cfg, &rx),
        Mode::Local | Mode::Client => run_pipeline(&cfg, args.mode, args.publish.as_deref(), &rx),
    }
}

fn resolve_config(args: &Args) -> Result<StreamConfig> {
    let mut cfg = StreamConfig::load_from(args.config.as_deref())?;
    if let Some(source) = &args.source {
        cfg.capture.source = source.clone();
    }
    if let Some(address) = &args.address {
        if address.trim().is_empty() {
            return Err(anyhow!("--address must not be empty"));
        }
        cfg.server.address = address.clone();
    }
    if let Some(port) = args.port {
        cfg.server.port = validate_port(port)?;
    }
    if args.roi_qp.is_some() || args.background_qp.is_some() {
        cfg.quality = QualityProfile::new(
            args.roi_qp.unwrap_or(cfg.quality.roi_qp() as i64),
            args.background_qp
                .unwrap_or(cfg.quality.background_qp() as i64),
        )?;
    }
    if let Some(detector) = &args.detector {
        cfg.detector.backend = detector.clone();
    }
    Ok(cfg)
}

fn build_processor(cfg: &StreamConfig) -> Result<FrameProcessor> {
    let registry = registry_from_settings(&cfg.detector)?;
    let detector = registry
        .default_detector()
        .ok_or_else(|| anyhow!("no detector backend registered"))?;
    log::info!(
        "detector: {} (available: {})",
        registry.default_name().unwrap_or("?"),
        registry.list().join(", ")
    );
    Ok(FrameProcessor::new(
        detector,
        RegionEncoder::new(cfg.overlay),
        SharedQuality::new(cfg.quality),
    ))
}

fn run_server(cfg: &StreamConfig, shutdown: &mpsc::Receiver<()>) -> Result<()> {
    let server = SessionServer::new(ServerConfig::from_settings(&cfg.server)?, build_processor(cfg)?)
        .with_observer(Arc::new(|id: SessionId, processed: &ProcessedFrame| {
            log::debug!("{}: {}", id, processed.status());
        }));
    server.start()?;

    while shutdown.recv_timeout(STATUS_INTERVAL).is_err() {
        log::info!("server: {}", server.status());
    }
    log::info!("shutdown signal received, stopping server...");
    server.stop();
    Ok(())
}

fn run_pipeline(
    cfg: &StreamConfig,
    mode: Mode,
    publish: Option<&str>,
    shutdown: &mpsc::Receiver<()>,
) -> Result<()> {
    let source = Arc::new(CaptureSource::new(ReconnectPolicy {
        max_attempts: cfg.capture.reconnect_attempts,
        delay: cfg.capture.reconnect_delay,
    }));
    let resolution = Resolution::new(cfg.capture.width, cfg.capture.height);
    source.open_str(&cfg.capture.source, resolution)?;

    let role = match mode {
        Mode::Client => {
            let mut client = SessionClient::new(ClientConfig::from_settings(&cfg.client));
            client.connect(&cfg.server.address, cfg.server.port as i64)?;
            Role::Client(client)
        }
        _ => Role::Local,
    };

    let mut pipeline = Pipeline::new(
        PipelineConfig::from_config(cfg),
        source.clone(),
        build_processor(cfg)?,
        role,
    );
    if let Some(url) = publish {
        pipeline = pipeline.with_publisher(create_publisher(PublisherConfig::new(
            url,
            cfg.capture.width,
            cfg.capture.height,
        ))?);
    }
    let mut handle = pipeline.start()?;

    while shutdown.recv_timeout(STATUS_INTERVAL).is_err() {
        log::info!("pipeline: {}", handle.status());
    }
    log::info!("shutdown signal received, stopping pipeline...");
    handle.stop();
    source.stop();
    Ok(())
}
