use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::relay::{DirectoryConnector, DisabledConnector, RelayConnector, RelaySettings};
use crate::worker::ReadPolicy;

const DEFAULT_DB_PATH: &str = "rtsp_data.db";
const DEFAULT_STREAM_WORKERS: usize = 10;
const DEFAULT_RELAY_WORKERS: usize = 2;
const DEFAULT_RELAY_QUEUE: usize = 64;
const DEFAULT_FLUSH_THRESHOLD: usize = crate::dispatch::DEFAULT_FLUSH_THRESHOLD;
const DEFAULT_MAX_READ_MISSES: u32 = 50;
const DEFAULT_READ_RETRY_DELAY_MS: u64 = 100;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
const DEFAULT_FTP_PORT: u16 = 21;
const DEFAULT_REMOTE_PATH: &str = "/";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_CAPTURE_FPS: u32 = 10;
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MonitorConfigFile {
    catalog: Option<CatalogConfigFile>,
    engine: Option<EngineConfigFile>,
    capture: Option<CaptureConfigFile>,
    relay: Option<RelayConfigFile>,
    log: Option<LogConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CatalogConfigFile {
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EngineConfigFile {
    stream_workers: Option<usize>,
    relay_workers: Option<usize>,
    relay_queue: Option<usize>,
    buffer_flush_threshold: Option<usize>,
    max_read_misses: Option<u32>,
    read_retry_delay_ms: Option<u64>,
    shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    kind: Option<RelayKind>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    remote_path: Option<String>,
    directory: Option<PathBuf>,
    connect_timeout_secs: Option<u64>,
    connect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LogConfigFile {
    file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    #[default]
    None,
    Directory,
    Ftp,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub db_path: String,
    pub engine: EngineConfig,
    pub capture: CaptureSettings,
    pub relay: RelayConfig,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stream_workers: usize,
    pub relay_workers: usize,
    pub relay_queue: usize,
    pub buffer_flush_threshold: usize,
    pub max_read_misses: u32,
    pub read_retry_delay: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone)]
pub struct RelayConfig {
    pub kind: RelayKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub remote_path: String,
    pub directory: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("remote_path", &self.remote_path)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl MonitorConfig {
    /// Load from `path`, else `RTSP_MONITOR_CONFIG`, else defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("RTSP_MONITOR_CONFIG").ok().map(PathBuf::from));
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let db_path = file
            .catalog
            .and_then(|catalog| catalog.db_path)
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let engine = file.engine.unwrap_or_default();
        let engine = EngineConfig {
            stream_workers: engine.stream_workers.unwrap_or(DEFAULT_STREAM_WORKERS),
            relay_workers: engine.relay_workers.unwrap_or(DEFAULT_RELAY_WORKERS),
            relay_queue: engine.relay_queue.unwrap_or(DEFAULT_RELAY_QUEUE),
            buffer_flush_threshold: engine
                .buffer_flush_threshold
                .unwrap_or(DEFAULT_FLUSH_THRESHOLD),
            max_read_misses: engine.max_read_misses.unwrap_or(DEFAULT_MAX_READ_MISSES),
            read_retry_delay: Duration::from_millis(
                engine
                    .read_retry_delay_ms
                    .unwrap_or(DEFAULT_READ_RETRY_DELAY_MS),
            ),
            shutdown_grace: Duration::from_secs(
                engine
                    .shutdown_grace_secs
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
        };

        let capture = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            target_fps: capture.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
            width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
            height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
        };

        let relay = file.relay.unwrap_or_default();
        let relay = RelayConfig {
            kind: relay.kind.unwrap_or_default(),
            host: relay.host.unwrap_or_default(),
            port: relay.port.unwrap_or(DEFAULT_FTP_PORT),
            username: relay.username.unwrap_or_default(),
            password: relay.password.unwrap_or_default(),
            remote_path: relay
                .remote_path
                .unwrap_or_else(|| DEFAULT_REMOTE_PATH.to_string()),
            directory: relay.directory,
            connect_timeout: Duration::from_secs(
                relay
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            connect_attempts: relay.connect_attempts.unwrap_or(DEFAULT_CONNECT_ATTEMPTS),
        };

        Self {
            db_path,
            engine,
            capture,
            relay,
            log_file: file.log.and_then(|log| log.file),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("RTSP_MONITOR_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(host) = std::env::var("RTSP_MONITOR_RELAY_HOST") {
            if !host.trim().is_empty() {
                self.relay.host = host;
            }
        }
        if let Ok(user) = std::env::var("RTSP_MONITOR_RELAY_USER") {
            if !user.trim().is_empty() {
                self.relay.username = user;
            }
        }
        if let Ok(password) = std::env::var("RTSP_MONITOR_RELAY_PASSWORD") {
            self.relay.password = password;
        }
        if let Ok(workers) = std::env::var("RTSP_MONITOR_STREAM_WORKERS") {
            self.engine.stream_workers = workers.trim().parse().map_err(|_| {
                anyhow!("RTSP_MONITOR_STREAM_WORKERS must be a positive integer")
            })?;
        }
        if let Ok(file) = std::env::var("RTSP_MONITOR_LOG_FILE") {
            if !file.trim().is_empty() {
                self.log_file = Some(PathBuf::from(file));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("catalog.db_path must not be empty"));
        }
        if self.engine.stream_workers == 0 {
            return Err(anyhow!("engine.stream_workers must be at least 1"));
        }
        if self.engine.relay_workers == 0 {
            return Err(anyhow!("engine.relay_workers must be at least 1"));
        }
        if self.engine.relay_queue == 0 {
            return Err(anyhow!("engine.relay_queue must be at least 1"));
        }
        if self.engine.buffer_flush_threshold == 0 {
            return Err(anyhow!("engine.buffer_flush_threshold must be at least 1"));
        }
        if self.engine.max_read_misses == 0 {
            return Err(anyhow!("engine.max_read_misses must be at least 1"));
        }
        if self.relay.connect_attempts == 0 {
            return Err(anyhow!("relay.connect_attempts must be at least 1"));
        }
        match self.relay.kind {
            RelayKind::None => {}
            RelayKind::Directory => {
                if self.relay.directory.is_none() {
                    return Err(anyhow!("relay.kind = \"directory\" requires relay.directory"));
                }
            }
            RelayKind::Ftp => {
                if self.relay.host.trim().is_empty() {
                    return Err(anyhow!("relay.kind = \"ftp\" requires relay.host"));
                }
            }
        }
        if !self.relay.remote_path.starts_with('/') {
            self.relay.remote_path = format!("/{}", self.relay.remote_path);
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            stream_workers: self.engine.stream_workers,
            relay_workers: self.engine.relay_workers,
            relay_queue: Some(self.engine.relay_queue),
            flush_threshold: self.engine.buffer_flush_threshold,
            read_policy: ReadPolicy {
                max_read_misses: self.engine.max_read_misses,
                retry_delay: self.engine.read_retry_delay,
            },
            shutdown_grace: self.engine.shutdown_grace,
        }
    }

    pub fn capture_config(&self) -> crate::ingest::RtspConfig {
        crate::ingest::RtspConfig {
            target_fps: self.capture.target_fps,
            width: self.capture.width,
            height: self.capture.height,
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            remote_path: self.relay.remote_path.clone(),
            connect_attempts: self.relay.connect_attempts,
            ..RelaySettings::default()
        }
    }

    /// Connector for the configured relay kind.
    pub fn relay_connector(&self) -> Result<Box<dyn RelayConnector>> {
        match self.relay.kind {
            RelayKind::None => Ok(Box::new(DisabledConnector)),
            RelayKind::Directory => {
                let directory = self
                    .relay
                    .directory
                    .clone()
                    .ok_or_else(|| anyhow!("relay.directory is not set"))?;
                Ok(Box::new(DirectoryConnector::new(directory)))
            }
            RelayKind::Ftp => ftp_connector(&self.relay),
        }
    }
}

#[cfg(feature = "relay-ftp")]
fn ftp_connector(relay: &RelayConfig) -> Result<Box<dyn RelayConnector>> {
    Ok(Box::new(crate::relay::FtpConnector {
        host: relay.host.clone(),
        port: relay.port,
        username: relay.username.clone(),
        password: relay.password.clone(),
        timeout: relay.connect_timeout,
    }))
}

#[cfg(not(feature = "relay-ftp"))]
fn ftp_connector(_relay: &RelayConfig) -> Result<Box<dyn RelayConnector>> {
    Err(anyhow!(
        "relay.kind = \"ftp\" requires building with the relay-ftp feature"
    ))
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
