//! Count event delivery.
//!
//! The counting path hands each counted crossing to an `EventNotifier` and
//! moves on. Notifiers never report failure back: delivery problems are
//! logged by the notifier itself.

use chrono::{DateTime, Local};
use std::sync::Arc;

use crate::frame::CameraId;

mod http;

pub use http::{HttpNotifier, HttpNotifierConfig};

/// One counted crossing, as delivered to the remote API.
#[derive(Clone, Debug, PartialEq)]
pub struct CountEvent {
    pub camera_id: CameraId,
    pub terminal_id: String,
    pub label: String,
    pub detected_at: DateTime<Local>,
}

/// Fire-and-forget event sink. Implementations must not block the caller on
/// network I/O.
pub trait EventNotifier: Send + Sync {
    fn notify(&self, event: CountEvent);
}

/// Per-camera handle bound at construction: camera id and terminal id are
/// copied in, the sink is shared.
#[derive(Clone)]
pub struct CameraNotifier {
    camera_id: CameraId,
    terminal_id: String,
    sink: Arc<dyn EventNotifier>,
}

impl CameraNotifier {
    /// Without an explicit terminal id the camera id is used.
    pub fn new(
        camera_id: CameraId,
        terminal_id: Option<String>,
        sink: Arc<dyn EventNotifier>,
    ) -> Self {
        Self {
            camera_id,
            terminal_id: terminal_id.unwrap_or_else(|| camera_id.to_string()),
            sink,
        }
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn emit(&self, label: &str) {
        self.sink.notify(CountEvent {
            camera_id: self.camera_id,
            terminal_id: self.terminal_id.clone(),
            label: label.to_string(),
            detected_at: Local::now(),
        });
    }
}

/// Logs events instead of delivering them. Used when no API is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl EventNotifier for LogNotifier {
    fn notify(&self, event: CountEvent) {
        log::info!(
            "count event: terminal={} label={} at={}",
            event.terminal_id,
            event.label,
            event.detected_at.to_rfc3339()
        );
    }
}
