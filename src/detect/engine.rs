use anyhow::Result;
use std::sync::Arc;

use crate::detect::result::{ClassNames, TrackResult};
use crate::frame::Frame;

/// Detection + tracking engine boundary.
///
/// The engine is stateful across calls: with `persist` set, a physical object
/// keeps its track id from one batch to the next within the same camera
/// stream. Batches are variable-membership (only cameras with a fresh frame
/// are included), so implementations key their tracker state by
/// `Frame::camera_id`, never by batch position.
pub trait TrackingEngine: Send {
    /// Engine identifier.
    fn name(&self) -> &'static str;

    /// Class id -> label table.
    fn class_names(&self) -> &ClassNames;

    /// Run detection and tracking on a batch of frames.
    ///
    /// Must return exactly one `TrackResult` per input frame, in input order.
    fn track(&mut self, frames: &[Arc<Frame>], persist: bool) -> Result<Vec<TrackResult>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
