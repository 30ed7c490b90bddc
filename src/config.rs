use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::ConfigError;

pub const MIN_QUALITY_PARAM: i64 = 5;
pub const MAX_QUALITY_PARAM: i64 = 40;

const DEFAULT_SOURCE: &str = "stub://camera";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
const DEFAULT_ROI_QP: i64 = 15;
const DEFAULT_BACKGROUND_QP: i64 = 35;
const DEFAULT_SERVER_ADDR: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: i64 = 8089;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_REPLY_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_DETECTOR: &str = "motion";
const DEFAULT_SNAPSHOT_EVERY: u64 = 10;

// ----------------------------------------------------------------------------
// Quality
// ----------------------------------------------------------------------------

/// Two quality parameters, each independently validated to [5, 40].
/// Lower values mean higher fidelity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QualityProfile {
    roi_qp: u8,
    background_qp: u8,
}

impl QualityProfile {
    pub fn new(roi_qp: i64, background_qp: i64) -> Result<Self, ConfigError> {
        let roi_qp = validate_quality_param("roi_quality_param", roi_qp)?;
        let background_qp = validate_quality_param("background_quality_param", background_qp)?;
        Ok(Self {
            roi_qp,
            background_qp,
        })
    }

    pub fn roi_qp(&self) -> u8 {
        self.roi_qp
    }

    pub fn background_qp(&self) -> u8 {
        self.background_qp
    }
}

impl Default for QualityProfile {
    fn default() -> Self {
        Self {
            roi_qp: DEFAULT_ROI_QP as u8,
            background_qp: DEFAULT_BACKGROUND_QP as u8,
        }
    }
}

pub fn validate_quality_param(name: &'static str, value: i64) -> Result<u8, ConfigError> {
    if !(MIN_QUALITY_PARAM..=MAX_QUALITY_PARAM).contains(&value) {
        return Err(ConfigError::QualityOutOfRange {
            name,
            value,
            min: MIN_QUALITY_PARAM,
            max: MAX_QUALITY_PARAM,
        });
    }
    Ok(value as u8)
}

pub fn validate_port(value: i64) -> Result<u16, ConfigError> {
    if !(1..=65535).contains(&value) {
        return Err(ConfigError::PortOutOfRange(value));
    }
    Ok(value as u16)
}

/// Quality profile shared between the operator and running loops.
///
/// Updates are validated before they replace the current profile, so loops
/// only ever observe valid values.
#[derive(Clone, Debug, Default)]
pub struct SharedQuality {
    inner: Arc<RwLock<QualityProfile>>,
}

impl SharedQuality {
    pub fn new(profile: QualityProfile) -> Self {
        Self {
            inner: Arc::new(RwLock::new(profile)),
        }
    }

    pub fn get(&self) -> QualityProfile {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, profile: QualityProfile) {
        match self.inner.write() {
            Ok(mut guard) => *guard = profile,
            Err(poisoned) => *poisoned.into_inner() = profile,
        }
    }

    pub fn set_roi_qp(&self, value: i64) -> Result<(), ConfigError> {
        let current = self.get();
        self.set(QualityProfile::new(value, current.background_qp as i64)?);
        Ok(())
    }

    pub fn set_background_qp(&self, value: i64) -> Result<(), ConfigError> {
        let current = self.get();
        self.set(QualityProfile::new(current.roi_qp as i64, value)?);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// File model (all optional)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    capture: Option<CaptureConfigFile>,
    quality: Option<QualityConfigFile>,
    server: Option<ServerConfigFile>,
    client: Option<ClientConfigFile>,
    detector: Option<DetectorConfigFile>,
    overlay: Option<OverlayConfigFile>,
    snapshots: Option<SnapshotConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct QualityConfigFile {
    roi_qp: Option<i64>,
    background_qp: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    address: Option<String>,
    port: Option<i64>,
    reply: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    connect_timeout_ms: Option<u64>,
    reply_timeout_ms: Option<u64>,
    expect_reply: Option<bool>,
    send_raw: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    classes: Option<Vec<String>>,
    boxes: Option<Vec<StaticBoxConfig>>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    confidence: Option<f32>,
    iou: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    boxes: Option<bool>,
    hud: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    dir: Option<PathBuf>,
    every_n_frames: Option<u64>,
}

/// One fixed detection for the `static` detector backend.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StaticBoxConfig {
    pub class: String,
    pub confidence: f32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

// ----------------------------------------------------------------------------
// Resolved configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub capture: CaptureSettings,
    pub quality: QualityProfile,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub detector: DetectorSettings,
    pub overlay: OverlaySettings,
    pub snapshots: Option<SnapshotSettings>,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub address: String,
    pub port: u16,
    pub reply: bool,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub expect_reply: bool,
    pub send_raw: bool,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub classes: Vec<String>,
    pub boxes: Vec<StaticBoxConfig>,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence: f32,
    pub iou: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlaySettings {
    pub boxes: bool,
    pub hud: bool,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            boxes: true,
            hud: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub dir: PathBuf,
    pub every_n_frames: u64,
}

/// Unvalidated numeric inputs held until `validate` runs.
#[derive(Debug, Clone, Copy)]
struct RawNumbers {
    roi_qp: i64,
    background_qp: i64,
    port: i64,
}

impl StreamConfig {
    /// Load from `ROI_STREAM_CONFIG` (if set), apply env overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROI_STREAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let (mut cfg, mut raw) = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env(&mut raw)?;
        cfg.validate(raw)?;
        Ok(cfg)
    }

    fn from_file(file: StreamConfigFile) -> (Self, RawNumbers) {
        let capture_file = file.capture.unwrap_or_default();
        let quality_file = file.quality.unwrap_or_default();
        let server_file = file.server.unwrap_or_default();
        let client_file = file.client.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();
        let overlay_file = file.overlay.unwrap_or_default();

        let raw = RawNumbers {
            roi_qp: quality_file.roi_qp.unwrap_or(DEFAULT_ROI_QP),
            background_qp: quality_file.background_qp.unwrap_or(DEFAULT_BACKGROUND_QP),
            port: server_file.port.unwrap_or(DEFAULT_SERVER_PORT),
        };

        let capture = CaptureSettings {
            source: capture_file
                .source
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            width: capture_file.width.unwrap_or(DEFAULT_WIDTH),
            height: capture_file.height.unwrap_or(DEFAULT_HEIGHT),
            reconnect_attempts: capture_file
                .reconnect_attempts
                .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
            reconnect_delay: Duration::from_millis(
                capture_file
                    .reconnect_delay_ms
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
        };
        let server = ServerSettings {
            address: server_file
                .address
                .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string()),
            port: 0,
            reply: server_file.reply.unwrap_or(true),
        };
        let client = ClientSettings {
            connect_timeout: Duration::from_millis(
                client_file
                    .connect_timeout_ms
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            reply_timeout: Duration::from_millis(
                client_file
                    .reply_timeout_ms
                    .unwrap_or(DEFAULT_REPLY_TIMEOUT_MS),
            ),
            expect_reply: client_file.expect_reply.unwrap_or(true),
            send_raw: client_file.send_raw.unwrap_or(false),
        };
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            classes: detector_file.classes.unwrap_or_default(),
            boxes: detector_file.boxes.unwrap_or_default(),
            model_path: detector_file.model_path,
            input_width: detector_file.input_width.unwrap_or(640),
            input_height: detector_file.input_height.unwrap_or(640),
            confidence: detector_file.confidence.unwrap_or(0.5),
            iou: detector_file.iou.unwrap_or(0.4),
        };
        let overlay = OverlaySettings {
            boxes: overlay_file.boxes.unwrap_or(true),
            hud: overlay_file.hud.unwrap_or(true),
        };
        let snapshots = file.snapshots.and_then(|snap| {
            snap.dir.map(|dir| SnapshotSettings {
                dir,
                every_n_frames: snap.every_n_frames.unwrap_or(DEFAULT_SNAPSHOT_EVERY),
            })
        });

        (
            Self {
                capture,
                quality: QualityProfile::default(),
                server,
                client,
                detector,
                overlay,
                snapshots,
            },
            raw,
        )
    }

    fn apply_env(&mut self, raw: &mut RawNumbers) -> Result<()> {
        if let Ok(source) = std::env::var("ROI_STREAM_SOURCE") {
            if !source.trim().is_empty() {
                self.capture.source = source;
            }
        }
        if let Ok(addr) = std::env::var("ROI_STREAM_SERVER_ADDR") {
            if !addr.trim().is_empty() {
                self.server.address = addr;
            }
        }
        if let Ok(port) = std::env::var("ROI_STREAM_SERVER_PORT") {
            raw.port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROI_STREAM_SERVER_PORT must be an integer"))?;
        }
        if let Ok(qp) = std::env::var("ROI_STREAM_ROI_QP") {
            raw.roi_qp = qp
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROI_STREAM_ROI_QP must be an integer"))?;
        }
        if let Ok(qp) = std::env::var("ROI_STREAM_BACKGROUND_QP") {
            raw.background_qp = qp
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROI_STREAM_BACKGROUND_QP must be an integer"))?;
        }
        if let Ok(backend) = std::env::var("ROI_STREAM_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_lowercase();
            }
        }
        Ok(())
    }

    fn validate(&mut self, raw: RawNumbers) -> Result<(), ConfigError> {
        self.quality = QualityProfile::new(raw.roi_qp, raw.background_qp)?;
        self.server.port = validate_port(raw.port)?;
        if self.server.address.trim().is_empty() {
            return Err(ConfigError::Empty("server address"));
        }
        if self.capture.source.trim().is_empty() {
            return Err(ConfigError::Empty("capture source"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ConfigError::Invalid(
                "capture resolution must be non-zero".to_string(),
            ));
        }
        if self.capture.reconnect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.client.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "client.connect_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.client.reply_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "client.reply_timeout_ms must be at least 1".to_string(),
            ));
        }
        if let Some(snapshots) = &self.snapshots {
            if snapshots.every_n_frames == 0 {
                return Err(ConfigError::Invalid(
                    "snapshots.every_n_frames must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<StreamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_params_are_validated_independently() {
        assert!(QualityProfile::new(5, 40).is_ok());
        assert_eq!(
            QualityProfile::new(4, 35),
            Err(ConfigError::QualityOutOfRange {
                name: "roi_quality_param",
                value: 4,
                min: 5,
                max: 40,
            })
        );
        assert!(matches!(
            QualityProfile::new(15, 41),
            Err(ConfigError::QualityOutOfRange {
                name: "background_quality_param",
                ..
            })
        ));
    }

    #[test]
    fn port_bounds() {
        assert_eq!(validate_port(1), Ok(1));
        assert_eq!(validate_port(65535), Ok(65535));
        assert_eq!(validate_port(0), Err(ConfigError::PortOutOfRange(0)));
        assert_eq!(
            validate_port(70000),
            Err(ConfigError::PortOutOfRange(70000))
        );
    }

    #[test]
    fn shared_quality_rejects_invalid_updates() -> Result<()> {
        let shared = SharedQuality::new(QualityProfile::default());
        shared.set_roi_qp(10)?;
        assert_eq!(shared.get().roi_qp(), 10);
        assert!(shared.set_background_qp(99).is_err());
        assert_eq!(shared.get().background_qp(), 35);
        Ok(())
    }

    #[test]
    fn defaults_validate() {
        let (mut cfg, raw) = StreamConfig::from_file(StreamConfigFile::default());
        cfg.validate(raw).unwrap();
        assert_eq!(cfg.server.port, 8089);
        assert_eq!(cfg.quality, QualityProfile::default());
        assert_eq!(cfg.capture.source, "stub://camera");
        assert!(cfg.snapshots.is_none());
    }
}
