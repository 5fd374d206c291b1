//! Multi-camera line-crossing counter.
//!
//! Frames are captured from any number of independent cameras (RTSP/HTTP
//! streams or local files), batched through an external detection/tracking
//! engine, and the tracked objects' centroids are checked against a per-camera
//! counting line. Every track id is counted at most once and each count is
//! pushed, best-effort, to a remote API.
//!
//! # Architecture
//!
//! - one reader thread per camera keeps only the newest frame and reconnects
//!   on its own (`reader`, `registry`)
//! - a single main loop polls readers, batches fresh frames, runs the engine
//!   and updates counters (`scheduler`, `counter`)
//! - counted crossings leave through a fire-and-forget notifier (`notify`)
//!
//! # Module Structure
//!
//! - `frame`: captured frame container
//! - `ingest`: capture backends behind the `FrameSource` trait
//! - `reader`: per-camera background reader
//! - `registry`: camera discovery, group start/stop
//! - `detect`: tracking engine boundary and result types
//! - `counter`: counting line geometry and per-camera counts
//! - `notify`: count event delivery
//! - `scheduler`: main loop
//! - `config`: daemon configuration

pub mod config;
pub mod counter;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod reader;
pub mod registry;
pub mod scheduler;

pub use counter::{
    CounterSnapshot, CountingLine, CrossingEvent, CrossingMode, LineCounter, Point,
};
pub use detect::{BoundingBox, ClassNames, Detection, ReplayEngine, TrackResult, TrackingEngine};
pub use frame::{CameraId, Frame};
pub use ingest::{open_source, FrameSource, SourceLocator, StubSource};
pub use notify::{CameraNotifier, CountEvent, EventNotifier, HttpNotifier, LogNotifier};
pub use reader::{ReaderConfig, ReaderStats, SourceReader};
pub use registry::{discover_locators, SourceRegistry};
pub use scheduler::{CycleReport, FrameScheduler, SchedulerConfig};
