//! Scripted tracking engine.
//!
//! Stands in for an external detector/tracker by replaying recorded per-camera
//! detections. The n-th frame submitted for a camera receives the n-th
//! scripted entry for that camera; frames past the end of a camera's script
//! get no detections. Pixels are never inspected.
//!
//! Script format (JSON):
//!
//! ```json
//! {
//!   "class_names": { "0": "paquete", "1": "sobre" },
//!   "frames": [
//!     { "camera": 1, "detections": [ { "bbox": [40, 40, 60, 60], "track_id": 7, "class_id": 0 } ] }
//!   ]
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use crate::detect::engine::TrackingEngine;
use crate::detect::result::{BoundingBox, ClassNames, Detection, TrackResult};
use crate::frame::{CameraId, Frame};

#[derive(Debug, Deserialize)]
struct ReplayScript {
    #[serde(default)]
    class_names: ClassNames,
    #[serde(default)]
    frames: Vec<ReplayFrame>,
}

#[derive(Debug, Deserialize)]
struct ReplayFrame {
    camera: CameraId,
    #[serde(default)]
    detections: Vec<ReplayDetection>,
}

#[derive(Debug, Deserialize)]
struct ReplayDetection {
    bbox: [f32; 4],
    track_id: Option<u64>,
    class_id: u32,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

impl From<ReplayDetection> for Detection {
    fn from(raw: ReplayDetection) -> Self {
        let [x1, y1, x2, y2] = raw.bbox;
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            track_id: raw.track_id,
            class_id: raw.class_id,
            confidence: raw.confidence,
        }
    }
}

pub struct ReplayEngine {
    class_names: ClassNames,
    pending: HashMap<CameraId, VecDeque<Vec<Detection>>>,
    submitted: u64,
}

impl ReplayEngine {
    pub fn new(class_names: ClassNames) -> Self {
        Self {
            class_names,
            pending: HashMap::new(),
            submitted: 0,
        }
    }

    /// Queue the detections returned for the next frame of `camera_id`.
    pub fn push_frame(&mut self, camera_id: CameraId, detections: Vec<Detection>) {
        self.pending
            .entry(camera_id)
            .or_default()
            .push_back(detections);
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let script: ReplayScript =
            serde_json::from_str(json).map_err(|e| anyhow!("invalid replay script: {}", e))?;
        let mut engine = Self::new(script.class_names);
        for frame in script.frames {
            let detections = frame.detections.into_iter().map(Detection::from).collect();
            engine.push_frame(frame.camera, detections);
        }
        Ok(engine)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay script {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("loading {}", path.display()))
    }

    /// Scripted frames not yet consumed, across all cameras.
    pub fn remaining(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Frames answered so far.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }
}

impl TrackingEngine for ReplayEngine {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn class_names(&self) -> &ClassNames {
        &self.class_names
    }

    fn track(&mut self, frames: &[Arc<Frame>], persist: bool) -> Result<Vec<TrackResult>> {
        let mut results = Vec::with_capacity(frames.len());
        for frame in frames {
            let mut detections = self
                .pending
                .get_mut(&frame.camera_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default();
            if !persist {
                // Without persistence there is no identity across calls.
                for detection in &mut detections {
                    detection.track_id = None;
                }
            }
            self.submitted += 1;
            results.push(TrackResult {
                camera_id: frame.camera_id,
                sequence: frame.sequence,
                detections,
            });
        }
        Ok(results)
    }
}
