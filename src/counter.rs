//! Line-crossing counter.
//!
//! One `LineCounter` per camera with a configured line. Each update takes the
//! engine's detections for one frame, compares every track's centroid with
//! the centroid it had on its previous sighting, and counts a crossing when
//! the two positions fall strictly on opposite sides of the counting line.
//!
//! A track id is counted at most once for the lifetime of the counter.
//! Positions are kept per track id and never evicted.
//!
//! Geometry is done on integer centroids with `i128` cross products, so the
//! side test is exact: a point lying exactly on the line (cross product 0) is
//! on neither side and never produces a crossing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::detect::{ClassNames, Detection};
use crate::frame::CameraId;
use crate::notify::CameraNotifier;

/// Largest accepted centroid coordinate magnitude.
pub const MAX_COORDINATE: i64 = 1 << 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    fn in_range(&self) -> bool {
        self.x.abs() <= MAX_COORDINATE && self.y.abs() <= MAX_COORDINATE
    }
}

/// How the crossing of the infinite line is confined to the drawn segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossingMode {
    /// Movement segment's bounding box must overlap the line's bounding box.
    /// Coarse: accepts some movements that pass beside the segment.
    #[default]
    Approximate,
    /// Movement segment must actually intersect the line segment.
    Exact,
}

impl std::str::FromStr for CrossingMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "approximate" => Ok(Self::Approximate),
            "exact" => Ok(Self::Exact),
            other => Err(anyhow::anyhow!(
                "unknown crossing mode '{}'; expected approximate or exact",
                other
            )),
        }
    }
}

/// Counting line P1 -> P2, fixed for the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountingLine {
    start: Point,
    end: Point,
}

impl CountingLine {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    /// From `[x1, y1, x2, y2]`.
    pub fn from_coords(coords: [i64; 4]) -> Self {
        Self::new(
            Point::new(coords[0], coords[1]),
            Point::new(coords[2], coords[3]),
        )
    }

    pub fn start(&self) -> Point {
        self.start
    }

    pub fn end(&self) -> Point {
        self.end
    }

    pub fn is_degenerate(&self) -> bool {
        self.start == self.end
    }

    /// Did the movement `prev -> curr` cross this line?
    pub fn crossed_by(&self, prev: Point, curr: Point, mode: CrossingMode) -> bool {
        let side_prev = cross(self.start, self.end, prev).signum();
        let side_curr = cross(self.start, self.end, curr).signum();
        if side_prev == 0 || side_curr == 0 || side_prev == side_curr {
            return false;
        }
        match mode {
            CrossingMode::Approximate => boxes_overlap((prev, curr), (self.start, self.end)),
            // prev/curr are strictly on opposite sides of the line, so only
            // the line endpoints need testing against the movement.
            CrossingMode::Exact => {
                let a = cross(prev, curr, self.start).signum();
                let b = cross(prev, curr, self.end).signum();
                a * b <= 0
            }
        }
    }
}

/// `cross(to - from, p - from)`; the sign gives which side of from->to `p` is on.
fn cross(from: Point, to: Point, p: Point) -> i128 {
    let lx = (to.x - from.x) as i128;
    let ly = (to.y - from.y) as i128;
    let px = (p.x - from.x) as i128;
    let py = (p.y - from.y) as i128;
    lx * py - ly * px
}

fn boxes_overlap(a: (Point, Point), b: (Point, Point)) -> bool {
    let (a_min_x, a_max_x) = (a.0.x.min(a.1.x), a.0.x.max(a.1.x));
    let (a_min_y, a_max_y) = (a.0.y.min(a.1.y), a.0.y.max(a.1.y));
    let (b_min_x, b_max_x) = (b.0.x.min(b.1.x), b.0.x.max(b.1.x));
    let (b_min_y, b_max_y) = (b.0.y.min(b.1.y), b.0.y.max(b.1.y));
    b_max_x >= a_min_x && a_max_x >= b_min_x && b_max_y >= a_min_y && a_max_y >= b_min_y
}

/// Per-camera counts.
#[derive(Clone, Debug, Default)]
pub struct CounterState {
    counts: BTreeMap<String, u64>,
    total: u64,
    counted: HashSet<u64>,
}

impl CounterState {
    fn new(class_names: &ClassNames) -> Self {
        Self {
            counts: class_names.labels().map(|l| (l.to_string(), 0)).collect(),
            total: 0,
            counted: HashSet::new(),
        }
    }

    /// Record a crossing. Returns false if the track was already counted.
    fn record(&mut self, track_id: u64, label: &str) -> bool {
        if !self.counted.insert(track_id) {
            return false;
        }
        *self.counts.entry(label.to_string()).or_insert(0) += 1;
        self.total += 1;
        true
    }
}

/// A counted crossing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrossingEvent {
    pub camera_id: CameraId,
    pub track_id: u64,
    pub class_id: u32,
    pub label: String,
}

/// Counts for display or logging.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub camera_id: CameraId,
    pub total: u64,
    pub counts: BTreeMap<String, u64>,
}

pub struct LineCounter {
    camera_id: CameraId,
    line: CountingLine,
    mode: CrossingMode,
    class_names: ClassNames,
    history: HashMap<u64, Point>,
    state: CounterState,
    notifier: Option<CameraNotifier>,
}

impl LineCounter {
    pub fn new(camera_id: CameraId, line: CountingLine, class_names: ClassNames) -> Self {
        let state = CounterState::new(&class_names);
        Self {
            camera_id,
            line,
            mode: CrossingMode::default(),
            class_names,
            history: HashMap::new(),
            state,
            notifier: None,
        }
    }

    pub fn with_mode(mut self, mode: CrossingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_notifier(mut self, notifier: CameraNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn line(&self) -> &CountingLine {
        &self.line
    }

    /// Apply one frame's detections. Returns the crossings counted.
    ///
    /// Detections without a track id or with a non-finite or out-of-range
    /// box are dropped individually.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<CrossingEvent> {
        let mut events = Vec::new();
        for detection in detections {
            let Some(track_id) = detection.track_id else {
                log::debug!(
                    "camera {}: dropping detection without track id",
                    self.camera_id
                );
                continue;
            };
            let Some(current) = detection.bbox.centroid().filter(Point::in_range) else {
                log::debug!(
                    "camera {}: dropping track {} with invalid box {:?}",
                    self.camera_id,
                    track_id,
                    detection.bbox
                );
                continue;
            };

            if let Some(previous) = self.history.insert(track_id, current) {
                if self.line.crossed_by(previous, current, self.mode) {
                    if let Some(event) = self.count(track_id, detection.class_id) {
                        events.push(event);
                    }
                }
            }
        }
        events
    }

    fn count(&mut self, track_id: u64, class_id: u32) -> Option<CrossingEvent> {
        let label = self.class_names.label(class_id).to_string();
        if !self.state.record(track_id, &label) {
            return None;
        }
        log::info!(
            "camera {}: track {} crossed ({}), total {}",
            self.camera_id,
            track_id,
            label,
            self.state.total
        );
        if let Some(notifier) = &self.notifier {
            notifier.emit(&label);
        }
        Some(CrossingEvent {
            camera_id: self.camera_id,
            track_id,
            class_id,
            label,
        })
    }

    pub fn total(&self) -> u64 {
        self.state.total
    }

    pub fn count_for(&self, label: &str) -> u64 {
        self.state.counts.get(label).copied().unwrap_or(0)
    }

    pub fn is_counted(&self, track_id: u64) -> bool {
        self.state.counted.contains(&track_id)
    }

    pub fn tracked(&self) -> usize {
        self.history.len()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            camera_id: self.camera_id,
            total: self.state.total,
            counts: self.state.counts.clone(),
        }
    }
}
