use serde::Deserialize;
use std::collections::BTreeMap;

use crate::counter::Point;
use crate::frame::CameraId;

/// Label used for class ids missing from the class table.
pub const UNKNOWN_CLASS: &str = "unknown";

/// Pixel-space box, corners (x1, y1) and (x2, y2).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Integer centroid, truncated toward zero. `None` for non-finite boxes.
    pub fn centroid(&self) -> Option<Point> {
        let cx = (self.x1 + self.x2) / 2.0;
        let cy = (self.y1 + self.y2) / 2.0;
        if !cx.is_finite() || !cy.is_finite() {
            return None;
        }
        Some(Point::new(cx as i64, cy as i64))
    }
}

/// One tracked object in one frame.
#[derive(Clone, Debug)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Persistent track id; absent when the tracker has not assigned one.
    pub track_id: Option<u64>,
    pub class_id: u32,
    pub confidence: f32,
}

/// Engine output for one submitted frame.
#[derive(Clone, Debug)]
pub struct TrackResult {
    pub camera_id: CameraId,
    pub sequence: u64,
    pub detections: Vec<Detection>,
}

/// Class id -> human-readable label.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct ClassNames(BTreeMap<u32, String>);

impl ClassNames {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(|(id, name)| (id, name.into())).collect())
    }

    /// Label for a class id, or `UNKNOWN_CLASS`.
    pub fn label(&self, class_id: u32) -> &str {
        self.0
            .get(&class_id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_CLASS)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for ClassNames {
    /// JSON object keys are strings; entries whose key is not an integer are skipped.
    fn from(raw: BTreeMap<String, String>) -> Self {
        Self(
            raw.into_iter()
                .filter_map(|(key, name)| key.trim().parse::<u32>().ok().map(|id| (id, name)))
                .collect(),
        )
    }
}
