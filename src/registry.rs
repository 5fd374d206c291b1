//! Camera registry.
//!
//! Builds one `SourceReader` per configured locator, assigning camera ids in
//! discovery order starting at 1, and starts/stops the readers as a group.

use anyhow::{anyhow, Result};

use crate::frame::CameraId;
use crate::ingest::{open_source, FrameSource};
use crate::reader::{ReaderConfig, ReaderStats, SourceReader};

/// Comma-delimited list of locators.
pub const CAMERA_LIST_KEY: &str = "RTSP_CAMERAS";
/// Numbered fallback keys: `RTSP_CAM_1`, `RTSP_CAM_2`, ...
pub const CAMERA_KEY_PREFIX: &str = "RTSP_CAM_";

/// Resolve camera locators from a key/value lookup (normally the process
/// environment).
///
/// The delimited list wins when present and non-empty. Otherwise numbered
/// keys are scanned from 1 and the scan stops at the first missing or empty
/// key.
pub fn discover_locators(lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
    if let Some(list) = lookup(CAMERA_LIST_KEY).filter(|v| !v.trim().is_empty()) {
        return list.split(',').filter_map(clean_locator).collect();
    }

    let mut locators = Vec::new();
    for n in 1.. {
        let Some(raw) = lookup(&format!("{}{}", CAMERA_KEY_PREFIX, n)) else {
            break;
        };
        if raw.is_empty() {
            break;
        }
        if let Some(locator) = clean_locator(&raw) {
            locators.push(locator);
        }
    }
    locators
}

/// Trim whitespace and surrounding quotes. Empty results are dropped.
pub fn clean_locator(raw: &str) -> Option<String> {
    let cleaned = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[derive(Default)]
pub struct SourceRegistry {
    readers: Vec<SourceReader>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a reader for every locator. Connection failures are not errors;
    /// an unsupported locator is.
    pub fn from_locators(locators: &[String], config: &ReaderConfig) -> Result<Self> {
        let mut registry = Self::new();
        for locator in locators {
            let source = open_source(locator)?;
            let camera_id = registry.add(source, config.clone());
            log::info!("camera {}: registered {}", camera_id, locator);
        }
        Ok(registry)
    }

    /// Register a source under the next camera id.
    pub fn add(&mut self, source: Box<dyn FrameSource>, config: ReaderConfig) -> CameraId {
        let camera_id = self.readers.len() as CameraId + 1;
        self.readers
            .push(SourceReader::new(camera_id, source, config));
        camera_id
    }

    /// Start every reader. Returns how many workers are running.
    pub fn start_all(&mut self) -> Result<usize> {
        let mut running = 0;
        for reader in &mut self.readers {
            if reader.start()? {
                running += 1;
            }
        }
        log::info!(
            "started {} of {} camera readers",
            running,
            self.readers.len()
        );
        Ok(running)
    }

    /// Stop every reader, even if some fail to stop in time.
    pub fn stop_all(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for reader in &mut self.readers {
            if let Err(e) = reader.stop() {
                failures.push(format!("{:#}", e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("readers failed to stop: {}", failures.join("; ")))
        }
    }

    pub fn readers(&self) -> &[SourceReader] {
        &self.readers
    }

    pub fn get(&self, camera_id: CameraId) -> Option<&SourceReader> {
        self.readers.iter().find(|r| r.camera_id() == camera_id)
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.readers.iter().map(|r| r.camera_id()).collect()
    }

    pub fn stats(&self) -> Vec<ReaderStats> {
        self.readers.iter().map(|r| r.stats()).collect()
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn delimited_list_is_split_and_cleaned() {
        let lookup = lookup_from(&[(
            "RTSP_CAMERAS",
            " \"rtsp://a/1\", 'rtsp://b/2' ,, stub://c ",
        )]);
        assert_eq!(
            discover_locators(lookup),
            vec!["rtsp://a/1", "rtsp://b/2", "stub://c"]
        );
    }

    #[test]
    fn numbered_keys_stop_at_first_gap() {
        let lookup = lookup_from(&[
            ("RTSP_CAM_1", "rtsp://a/1"),
            ("RTSP_CAM_2", "\"rtsp://b/2\""),
            ("RTSP_CAM_4", "rtsp://d/4"),
        ]);
        assert_eq!(discover_locators(lookup), vec!["rtsp://a/1", "rtsp://b/2"]);
    }

    #[test]
    fn list_takes_precedence_over_numbered_keys() {
        let lookup = lookup_from(&[("RTSP_CAMERAS", "stub://x"), ("RTSP_CAM_1", "stub://y")]);
        assert_eq!(discover_locators(lookup), vec!["stub://x"]);
    }

    #[test]
    fn empty_list_falls_back_to_numbered_keys() {
        let lookup = lookup_from(&[("RTSP_CAMERAS", "  "), ("RTSP_CAM_1", "stub://y")]);
        assert_eq!(discover_locators(lookup), vec!["stub://y"]);
    }

    #[test]
    fn nothing_configured_yields_no_locators() {
        assert!(discover_locators(|_| None).is_empty());
    }

    #[test]
    fn assigns_ids_in_discovery_order() -> Result<()> {
        let config = ReaderConfig {
            reconnect_backoff: Duration::from_millis(20),
            ..ReaderConfig::default()
        };
        let locators = vec!["stub://a".to_string(), "stub://b".to_string()];
        let mut registry = SourceRegistry::from_locators(&locators, &config)?;
        assert_eq!(registry.camera_ids(), vec![1, 2]);
        assert_eq!(registry.get(2).map(|r| r.locator()), Some("stub://b"));

        assert_eq!(registry.start_all()?, 2);
        registry.stop_all()?;
        assert!(registry.stats().iter().all(|s| !s.running));
        Ok(())
    }

    #[test]
    fn unsupported_locator_is_rejected() {
        let locators = vec!["ftp://nowhere/x".to_string()];
        assert!(SourceRegistry::from_locators(&locators, &ReaderConfig::default()).is_err());
    }
}
