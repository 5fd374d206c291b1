//! Captured frame container.
//!
//! A `Frame` is produced by a `FrameSource`, stamped by the owning
//! `SourceReader` with its camera id and a per-reader sequence number, and
//! handed to the scheduler behind an `Arc`. Frames are never queued: the
//! reader holds at most one and replaces it on every successful read.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

const BYTES_PER_PIXEL: usize = 3;

/// Opaque camera identifier, assigned in discovery order starting at 1.
pub type CameraId = u32;

/// One decoded video frame (packed RGB24).
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Camera that captured this frame. Zero until the reader stamps it.
    pub camera_id: CameraId,

    /// Per-reader capture counter, starting at 1. Used by the scheduler to
    /// tell a fresh frame from one it already submitted.
    pub sequence: u64,

    captured_at: Instant,
}

impl Frame {
    /// Create a new frame. Called by capture backends.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            camera_id: 0,
            sequence: 0,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from RGB rows laid out `stride` bytes apart, dropping
    /// any row padding.
    pub fn from_rows(data: &[u8], stride: usize, width: u32, height: u32) -> Result<Self> {
        let row_len = width as usize * BYTES_PER_PIXEL;
        let rows = height as usize;
        let needed = stride * rows.saturating_sub(1) + row_len;
        if row_len == 0 || rows == 0 || stride < row_len || data.len() < needed {
            return Err(anyhow!(
                "{} bytes cannot hold {}x{} RGB rows with stride {}",
                data.len(),
                width,
                height,
                stride
            ));
        }
        let pixels = if stride == row_len {
            data[..row_len * rows].to_vec()
        } else {
            data.chunks(stride)
                .take(rows)
                .flat_map(|row| &row[..row_len])
                .copied()
                .collect()
        };
        Ok(Self::new(pixels, width, height))
    }

    pub(crate) fn stamp(mut self, camera_id: CameraId, sequence: u64) -> Self {
        self.camera_id = camera_id;
        self.sequence = sequence;
        self
    }

    /// Read-only pixel access for the tracking engine.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Time since capture.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_sets_camera_and_sequence() {
        let frame = Frame::new(vec![0u8; 12], 2, 2).stamp(3, 41);
        assert_eq!(frame.camera_id, 3);
        assert_eq!(frame.sequence, 41);
        assert_eq!(frame.byte_len(), 12);
        assert_eq!(frame.pixels().len(), 12);
    }

    #[test]
    fn from_rows_strips_row_padding() -> Result<()> {
        // 2x2 RGB, rows padded to 8 bytes.
        let data = [1, 2, 3, 4, 5, 6, 0, 0, 7, 8, 9, 10, 11, 12];
        let frame = Frame::from_rows(&data, 8, 2, 2)?;
        assert_eq!(frame.pixels(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);

        let packed = Frame::from_rows(frame.pixels(), 6, 2, 2)?;
        assert_eq!(packed.byte_len(), 12);
        Ok(())
    }

    #[test]
    fn from_rows_rejects_short_buffers() {
        assert!(Frame::from_rows(&[0u8; 13], 8, 2, 2).is_err());
        assert!(Frame::from_rows(&[0u8; 12], 4, 2, 2).is_err());
        assert!(Frame::from_rows(&[], 0, 0, 0).is_err());
    }

    #[test]
    fn debug_output_omits_pixels() {
        let frame = Frame::new(vec![7u8; 3], 1, 1).stamp(1, 1);
        let text = format!("{:?}", frame);
        assert!(text.contains("bytes: 3"));
        assert!(!text.contains("[7"));
    }
}
