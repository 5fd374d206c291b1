//! Capture sources.
//!
//! A `FrameSource` owns one capture handle (network stream or local file)
//! and is driven exclusively by its `SourceReader` worker. Sources are
//! reconnected in place: `connect()` may be called again after `release()`
//! or after a failed `next_frame()`.
//!
//! Backends:
//! - `stub://name`: synthetic frames, always available.
//! - `rtsp://`, `http(s)://`, local paths: GStreamer decode (feature `capture-gstreamer`).

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use url::Url;

use crate::frame::Frame;

#[cfg(feature = "capture-gstreamer")]
mod pipeline;
mod stub;

#[cfg(feature = "capture-gstreamer")]
pub use pipeline::GstreamerSource;
pub use stub::StubSource;

/// A capture handle driven by a single reader worker.
pub trait FrameSource: Send {
    /// Human-readable locator, for logs.
    fn describe(&self) -> &str;

    /// Open (or re-open) the underlying capture.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is decoded. An error means the connection
    /// is lost and the caller should reconnect.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Release the capture handle. Must be safe to call more than once.
    fn release(&mut self);
}

/// Classified capture locator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocator {
    Stub(String),
    Network(Url),
    File(PathBuf),
}

impl SourceLocator {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("empty source locator"));
        }
        if let Some(name) = raw.strip_prefix("stub://") {
            return Ok(Self::Stub(name.to_string()));
        }
        match Url::parse(raw) {
            Ok(url) => match url.scheme() {
                "rtsp" | "rtsps" | "http" | "https" => Ok(Self::Network(url)),
                "file" => url
                    .to_file_path()
                    .map(Self::File)
                    .map_err(|_| anyhow!("invalid file url '{}'", raw)),
                // Drive letters ("C:\videos\dock.mp4") parse as one-letter schemes.
                scheme if scheme.len() == 1 => Ok(Self::File(PathBuf::from(raw))),
                other => Err(anyhow!(
                    "unsupported source scheme '{}'; expected rtsp, http(s), file or stub",
                    other
                )),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Self::File(PathBuf::from(raw))),
            Err(e) => Err(anyhow!("invalid source locator '{}': {}", raw, e)),
        }
    }
}

/// Build the capture backend for a locator. Does not connect.
pub fn open_source(locator: &str) -> Result<Box<dyn FrameSource>> {
    match SourceLocator::parse(locator)? {
        SourceLocator::Stub(name) => Ok(Box::new(StubSource::new(&name))),
        #[cfg(feature = "capture-gstreamer")]
        parsed => Ok(Box::new(GstreamerSource::new(locator.trim(), parsed)?)),
        #[cfg(not(feature = "capture-gstreamer"))]
        _ => Err(anyhow!(
            "capturing '{}' requires the capture-gstreamer feature",
            locator
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_locators() -> Result<()> {
        assert_eq!(
            SourceLocator::parse("stub://dock")?,
            SourceLocator::Stub("dock".to_string())
        );
        assert!(matches!(
            SourceLocator::parse("rtsp://10.0.0.5:554/stream1")?,
            SourceLocator::Network(_)
        ));
        assert!(matches!(
            SourceLocator::parse("https://cam.local/mjpeg")?,
            SourceLocator::Network(_)
        ));
        assert_eq!(
            SourceLocator::parse("/data/dock.mp4")?,
            SourceLocator::File(PathBuf::from("/data/dock.mp4"))
        );
        assert_eq!(
            SourceLocator::parse("videos/dock.mp4")?,
            SourceLocator::File(PathBuf::from("videos/dock.mp4"))
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_schemes_and_empty() {
        assert!(SourceLocator::parse("ftp://host/file.mp4").is_err());
        assert!(SourceLocator::parse("   ").is_err());
    }

    #[test]
    fn opens_stub_source() -> Result<()> {
        let mut source = open_source("stub://bay")?;
        source.connect()?;
        let frame = source.next_frame()?;
        assert!(frame.byte_len() > 0);
        assert_eq!(source.describe(), "stub://bay");
        source.release();
        Ok(())
    }
}
