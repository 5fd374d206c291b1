use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::counter::{CountingLine, CrossingMode, Point, MAX_COORDINATE};
use crate::frame::CameraId;
use crate::notify::HttpNotifierConfig;
use crate::reader::ReaderConfig;
use crate::registry::discover_locators;
use crate::scheduler::SchedulerConfig;

const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 5_000;
const DEFAULT_IDLE_POLL_MS: u64 = 10;
const DEFAULT_HEALTH_LOG_SECS: u64 = 5;
const DEFAULT_API_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct CounterdConfigFile {
    sources: Option<Vec<String>>,
    cameras: Option<BTreeMap<String, CameraConfigFile>>,
    reader: Option<ReaderConfigFile>,
    scheduler: Option<SchedulerConfigFile>,
    crossing: Option<String>,
    api: Option<ApiConfigFile>,
    detections_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    line: Option<[i64; 4]>,
    terminal_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ReaderConfigFile {
    reconnect_backoff_ms: Option<u64>,
    retry_initial_failure: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerConfigFile {
    idle_poll_ms: Option<u64>,
    health_log_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CounterdConfig {
    /// Capture locators; camera ids are positions in this list, from 1.
    pub sources: Vec<String>,
    pub cameras: BTreeMap<CameraId, CameraSettings>,
    pub reader: ReaderConfig,
    pub scheduler: SchedulerConfig,
    pub crossing: CrossingMode,
    /// Remote counting API; events are only logged when absent.
    pub api: Option<HttpNotifierConfig>,
    pub detections_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct CameraSettings {
    /// Counting is disabled for the camera when absent.
    pub line: Option<CountingLine>,
    pub terminal_id: Option<String>,
}

impl CounterdConfig {
    /// Load from `COUNTER_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("COUNTER_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => CounterdConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn camera(&self, camera_id: CameraId) -> Option<&CameraSettings> {
        self.cameras.get(&camera_id)
    }

    fn from_file(file: CounterdConfigFile) -> Result<Self> {
        let sources = file.sources.unwrap_or_default();

        let mut cameras = BTreeMap::new();
        for (key, camera) in file.cameras.unwrap_or_default() {
            let camera_id: CameraId = key
                .trim()
                .parse()
                .ok()
                .filter(|id| *id > 0)
                .ok_or_else(|| anyhow!("camera key '{}' must be a positive integer", key))?;
            cameras.insert(
                camera_id,
                CameraSettings {
                    line: camera.line.map(CountingLine::from_coords),
                    terminal_id: camera.terminal_id.filter(|t| !t.trim().is_empty()),
                },
            );
        }

        let reader = ReaderConfig {
            reconnect_backoff: Duration::from_millis(
                file.reader
                    .as_ref()
                    .and_then(|r| r.reconnect_backoff_ms)
                    .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS),
            ),
            retry_initial_failure: file
                .reader
                .as_ref()
                .and_then(|r| r.retry_initial_failure)
                .unwrap_or(false),
            ..ReaderConfig::default()
        };
        let scheduler = SchedulerConfig {
            idle_poll: Duration::from_millis(
                file.scheduler
                    .as_ref()
                    .and_then(|s| s.idle_poll_ms)
                    .unwrap_or(DEFAULT_IDLE_POLL_MS),
            ),
            health_log_interval: Duration::from_secs(
                file.scheduler
                    .as_ref()
                    .and_then(|s| s.health_log_secs)
                    .unwrap_or(DEFAULT_HEALTH_LOG_SECS),
            ),
            ..SchedulerConfig::default()
        };
        let crossing = match file.crossing {
            Some(mode) => mode.parse()?,
            None => CrossingMode::default(),
        };
        let api = file.api.and_then(|api| {
            let timeout = Duration::from_secs(api.timeout_secs.unwrap_or(DEFAULT_API_TIMEOUT_SECS));
            api.url
                .filter(|url| !url.trim().is_empty())
                .map(|url| HttpNotifierConfig {
                    timeout,
                    ..HttpNotifierConfig::new(&url)
                })
        });

        Ok(Self {
            sources,
            cameras,
            reader,
            scheduler,
            crossing,
            api,
            detections_path: file.detections_path,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        let locators = discover_locators(|key| std::env::var(key).ok());
        if !locators.is_empty() {
            self.sources = locators;
        }
        if let Ok(url) = std::env::var("COUNTER_API_URL") {
            if !url.trim().is_empty() {
                let timeout = self
                    .api
                    .as_ref()
                    .map(|api| api.timeout)
                    .unwrap_or(Duration::from_secs(DEFAULT_API_TIMEOUT_SECS));
                self.api = Some(HttpNotifierConfig {
                    timeout,
                    ..HttpNotifierConfig::new(&url)
                });
            }
        }
        if let Ok(ms) = std::env::var("COUNTER_RECONNECT_BACKOFF_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                anyhow!("COUNTER_RECONNECT_BACKOFF_MS must be an integer number of milliseconds")
            })?;
            self.reader.reconnect_backoff = Duration::from_millis(ms);
        }
        if let Ok(ms) = std::env::var("COUNTER_IDLE_POLL_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                anyhow!("COUNTER_IDLE_POLL_MS must be an integer number of milliseconds")
            })?;
            self.scheduler.idle_poll = Duration::from_millis(ms);
        }
        if let Ok(mode) = std::env::var("COUNTER_CROSSING_MODE") {
            if !mode.trim().is_empty() {
                self.crossing = mode.parse()?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!(
                "no cameras configured (set RTSP_CAMERAS, RTSP_CAM_<n>, or \"sources\" in the config file)"
            ));
        }
        if self.reader.reconnect_backoff.is_zero() {
            return Err(anyhow!("reconnect backoff must be greater than zero"));
        }
        if self.scheduler.idle_poll.is_zero() {
            return Err(anyhow!("idle poll interval must be greater than zero"));
        }
        for (camera_id, camera) in &self.cameras {
            if let Some(line) = &camera.line {
                validate_line(*camera_id, line)?;
            }
            if *camera_id as usize > self.sources.len() {
                log::warn!(
                    "camera {} is configured but only {} sources exist; ignoring",
                    camera_id,
                    self.sources.len()
                );
            }
        }
        Ok(())
    }
}

fn validate_line(camera_id: CameraId, line: &CountingLine) -> Result<()> {
    if line.is_degenerate() {
        return Err(anyhow!(
            "camera {}: counting line endpoints must differ",
            camera_id
        ));
    }
    let in_range = |p: Point| p.x.abs() <= MAX_COORDINATE && p.y.abs() <= MAX_COORDINATE;
    if !in_range(line.start()) || !in_range(line.end()) {
        return Err(anyhow!(
            "camera {}: counting line coordinates out of range",
            camera_id
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<CounterdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
