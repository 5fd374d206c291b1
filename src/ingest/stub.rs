//! Synthetic source (`stub://`) for demos and tests.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::FrameSource;
use crate::frame::Frame;

const STUB_WIDTH: u32 = 64;
const STUB_HEIGHT: u32 = 48;
const STUB_FRAME_INTERVAL: Duration = Duration::from_millis(40);

/// Always-available source producing a shifting gradient at ~25 fps.
pub struct StubSource {
    locator: String,
    frame_count: u64,
    connected: bool,
}

impl StubSource {
    pub fn new(name: &str) -> Self {
        Self {
            locator: format!("stub://{}", name),
            frame_count: 0,
            connected: false,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (STUB_WIDTH * STUB_HEIGHT * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for StubSource {
    fn describe(&self) -> &str {
        &self.locator
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::debug!("StubSource: connected to {}", self.locator);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("{} is not connected", self.locator));
        }
        std::thread::sleep(STUB_FRAME_INTERVAL);
        self.frame_count += 1;
        Ok(Frame::new(self.generate_pixels(), STUB_WIDTH, STUB_HEIGHT))
    }

    fn release(&mut self) {
        self.connected = false;
    }
}
