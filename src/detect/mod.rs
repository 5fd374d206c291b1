mod engine;
mod replay;
mod result;

pub use engine::TrackingEngine;
pub use replay::ReplayEngine;
pub use result::{BoundingBox, ClassNames, Detection, TrackResult, UNKNOWN_CLASS};
