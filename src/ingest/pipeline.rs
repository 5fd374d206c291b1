//! GStreamer capture backend.
//!
//! One pipeline per connection: `connect()` builds a fresh pipeline and sets it
//! to Playing, `release()` tears it down to Null. The appsink keeps a single
//! buffer so a slow consumer never builds up latency on live streams.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceLocator};
use crate::frame::Frame;

const PULL_TIMEOUT_MS: u64 = 2_000;
const PREROLL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GstreamerSource {
    locator: String,
    description: String,
    pipeline: Option<Live>,
    frame_count: u64,
    connected_at: Option<Instant>,
}

struct Live {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

impl GstreamerSource {
    pub fn new(locator: &str, parsed: SourceLocator) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        let description = pipeline_description(&parsed)?;
        Ok(Self {
            locator: locator.to_string(),
            description,
            pipeline: None,
            frame_count: 0,
            connected_at: None,
        })
    }

    fn build(&self) -> Result<Live> {
        let pipeline = gstreamer::parse::launch(&self.description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_sync(false);

        Ok(Live { pipeline, appsink })
    }

    fn first_bus_error(&self, live: &Live) -> Option<String> {
        let bus = live.pipeline.bus()?;
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Some("end of stream".to_string()),
                _ => {}
            }
        }
        None
    }
}

impl FrameSource for GstreamerSource {
    fn describe(&self) -> &str {
        &self.locator
    }

    fn connect(&mut self) -> Result<()> {
        self.release();
        let live = self.build()?;
        live.pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start capture pipeline for {}", self.locator))?;

        // Wait for preroll so an unreachable source fails here, not on first read.
        let timeout = gstreamer::ClockTime::from_mseconds(PREROLL_TIMEOUT.as_millis() as u64);
        let (result, _, _) = live.pipeline.state(timeout);
        if let Err(e) = result {
            let detail = self
                .first_bus_error(&live)
                .unwrap_or_else(|| format!("{:?}", e));
            let _ = live.pipeline.set_state(gstreamer::State::Null);
            return Err(anyhow!("failed to open {}: {}", self.locator, detail));
        }

        self.pipeline = Some(live);
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let live = self
            .pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("{} is not connected", self.locator))?;
        if let Some(err) = self.first_bus_error(live) {
            return Err(anyhow!("{}: {}", self.locator, err));
        }

        let sample = live
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
            .ok_or_else(|| anyhow!("{}: stream stalled or ended", self.locator))?;
        let frame = frame_from_sample(&sample)?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if let Some(live) = self.pipeline.take() {
            if let Err(e) = live.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("failed to stop pipeline for {}: {:?}", self.locator, e);
            }
            if let Some(connected_at) = self.connected_at.take() {
                log::debug!(
                    "{} released after {:.1}s ({} frames)",
                    self.locator,
                    connected_at.elapsed().as_secs_f64(),
                    self.frame_count
                );
            }
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn pipeline_description(locator: &SourceLocator) -> Result<String> {
    const SINK: &str = "decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink name=appsink";
    let description = match locator {
        SourceLocator::Network(url) if url.scheme().starts_with("rtsp") => format!(
            "rtspsrc location=\"{}\" latency=0 ! {} drop=true",
            url, SINK
        ),
        SourceLocator::Network(url) => format!(
            "souphttpsrc location=\"{}\" is-live=true ! {} drop=true",
            url, SINK
        ),
        // Files are read in order; the sink blocks the decoder instead of dropping.
        SourceLocator::File(path) => format!(
            "filesrc location=\"{}\" ! {} drop=false",
            path.display(),
            SINK
        ),
        SourceLocator::Stub(_) => return Err(anyhow!("stub sources do not use gstreamer")),
    };
    Ok(description)
}

fn frame_from_sample(sample: &gstreamer::Sample) -> Result<Frame> {
    let caps = sample.caps().context("appsink sample has no caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("appsink caps are not video")?;
    let buffer = sample.buffer().context("appsink sample has no buffer")?;
    let map = buffer.map_readable().context("map appsink buffer")?;
    Frame::from_rows(
        map.as_slice(),
        info.stride()[0] as usize,
        info.width(),
        info.height(),
    )
}
