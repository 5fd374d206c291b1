//! Main processing loop.
//!
//! Each cycle polls every reader without blocking, batches the cameras that
//! have a frame newer than the one last submitted for them, runs the whole
//! batch through the tracking engine in one call, and routes each result to
//! that camera's `LineCounter`. Cameras without a fresh frame are left out of
//! the cycle rather than waited for.
//!
//! The scheduler owns all counting state; nothing here is shared with the
//! reader threads except the per-camera frame cells read through
//! `SourceReader::read()`.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::counter::{CounterSnapshot, CrossingEvent, LineCounter};
use crate::detect::TrackingEngine;
use crate::frame::{CameraId, Frame};
use crate::registry::SourceRegistry;

const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(10);
const DEFAULT_HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Sleep after a cycle in which no camera had a fresh frame.
    pub idle_poll: Duration,
    pub health_log_interval: Duration,
    /// Ask the engine to keep track identity across calls.
    pub persist_tracks: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_poll: DEFAULT_IDLE_POLL,
            health_log_interval: DEFAULT_HEALTH_LOG_INTERVAL,
            persist_tracks: true,
        }
    }
}

/// What one cycle did.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    /// Cameras whose frame went to the engine, in batch order.
    pub submitted: Vec<CameraId>,
    /// Cameras with no fresh frame this cycle.
    pub skipped: Vec<CameraId>,
    pub crossings: Vec<CrossingEvent>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.submitted.is_empty()
    }
}

pub struct FrameScheduler {
    registry: SourceRegistry,
    engine: Box<dyn TrackingEngine>,
    counters: BTreeMap<CameraId, LineCounter>,
    config: SchedulerConfig,
    last_sequence: HashMap<CameraId, u64>,
    frames_submitted: HashMap<CameraId, u64>,
    cycles: u64,
    last_health_log: Instant,
}

impl FrameScheduler {
    pub fn new(
        registry: SourceRegistry,
        engine: Box<dyn TrackingEngine>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            counters: BTreeMap::new(),
            config,
            last_sequence: HashMap::new(),
            frames_submitted: HashMap::new(),
            cycles: 0,
            last_health_log: Instant::now(),
        }
    }

    /// Attach a counter to a registered camera. At most one per camera.
    pub fn add_counter(&mut self, counter: LineCounter) -> Result<()> {
        let camera_id = counter.camera_id();
        if self.registry.get(camera_id).is_none() {
            return Err(anyhow!("camera {} is not registered", camera_id));
        }
        if self.counters.contains_key(&camera_id) {
            return Err(anyhow!("camera {} already has a counter", camera_id));
        }
        self.counters.insert(camera_id, counter);
        Ok(())
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &dyn TrackingEngine {
        self.engine.as_ref()
    }

    pub fn counter(&self, camera_id: CameraId) -> Option<&LineCounter> {
        self.counters.get(&camera_id)
    }

    pub fn snapshots(&self) -> Vec<CounterSnapshot> {
        self.counters.values().map(LineCounter::snapshot).collect()
    }

    /// Non-empty cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn collect_batch(&mut self) -> (Vec<Arc<Frame>>, Vec<CameraId>) {
        let mut batch = Vec::new();
        let mut skipped = Vec::new();
        for reader in self.registry.readers() {
            let camera_id = reader.camera_id();
            match reader.read() {
                Some(frame) if self.last_sequence.get(&camera_id) != Some(&frame.sequence) => {
                    log::trace!(
                        "camera {}: frame {} ({} bytes) is {:?} old",
                        camera_id,
                        frame.sequence,
                        frame.byte_len(),
                        frame.age()
                    );
                    self.last_sequence.insert(camera_id, frame.sequence);
                    batch.push(frame);
                }
                _ => skipped.push(camera_id),
            }
        }
        (batch, skipped)
    }

    /// Run one cycle. Never sleeps; an idle report means nothing was fresh.
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        let (batch, skipped) = self.collect_batch();
        if batch.is_empty() {
            return Ok(CycleReport {
                skipped,
                ..CycleReport::default()
            });
        }

        let results = self.engine.track(&batch, self.config.persist_tracks)?;
        if results.len() != batch.len() {
            return Err(anyhow!(
                "engine '{}' returned {} results for a batch of {} frames",
                self.engine.name(),
                results.len(),
                batch.len()
            ));
        }
        self.cycles += 1;

        let mut report = CycleReport {
            submitted: Vec::with_capacity(batch.len()),
            skipped,
            crossings: Vec::new(),
        };
        for (frame, result) in batch.iter().zip(results) {
            // Results are positional; the frame decides the camera.
            let camera_id = frame.camera_id;
            if result.camera_id != camera_id {
                log::warn!(
                    "engine result tagged camera {} at batch slot of camera {}",
                    result.camera_id,
                    camera_id
                );
            }
            *self.frames_submitted.entry(camera_id).or_insert(0) += 1;
            report.submitted.push(camera_id);

            if let Some(counter) = self.counters.get_mut(&camera_id) {
                report.crossings.extend(counter.update(&result.detections));
            }
        }
        log::debug!(
            "cycle {}: submitted {:?}, skipped {:?}, crossings {}",
            self.cycles,
            report.submitted,
            report.skipped,
            report.crossings.len()
        );
        Ok(report)
    }

    /// Loop until `stop` is set or `max_cycles` non-empty cycles have run.
    ///
    /// Returns the first unexpected error; the caller is responsible for
    /// `shutdown()` in either case.
    pub fn run(&mut self, stop: &AtomicBool, max_cycles: Option<u64>) -> Result<()> {
        log::info!(
            "scheduler running: {} cameras, {} counters, engine '{}'",
            self.registry.len(),
            self.counters.len(),
            self.engine.name()
        );
        self.engine.warm_up()?;
        while !stop.load(Ordering::SeqCst) {
            if max_cycles.is_some_and(|max| self.cycles >= max) {
                log::info!("reached {} cycles, stopping", self.cycles);
                break;
            }
            let report = self.run_cycle()?;
            if report.is_idle() {
                std::thread::sleep(self.config.idle_poll);
            }
            if self.last_health_log.elapsed() >= self.config.health_log_interval {
                self.log_health();
                self.last_health_log = Instant::now();
            }
        }
        Ok(())
    }

    fn log_health(&self) {
        for stats in self.registry.stats() {
            log::info!(
                "camera {} connected={} frames={} submitted={} reconnects={} source={}",
                stats.camera_id,
                stats.connected,
                stats.frames_captured,
                self.frames_submitted
                    .get(&stats.camera_id)
                    .copied()
                    .unwrap_or(0),
                stats.reconnects,
                stats.locator
            );
        }
    }

    /// Stop every reader and return final counts.
    pub fn shutdown(&mut self) -> Result<Vec<CounterSnapshot>> {
        log::info!("stopping {} camera readers", self.registry.len());
        self.registry.stop_all()?;
        Ok(self.snapshots())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CountingLine;
    use crate::detect::{BoundingBox, ClassNames, Detection, ReplayEngine, TrackResult};
    use crate::ingest::FrameSource;
    use crate::reader::ReaderConfig;

    /// Yields `frames` frames, then fails every read and reconnect.
    struct FiniteSource {
        frames: u32,
    }

    impl FrameSource for FiniteSource {
        fn describe(&self) -> &str {
            "test://finite"
        }

        fn connect(&mut self) -> Result<()> {
            if self.frames > 0 {
                Ok(())
            } else {
                Err(anyhow!("exhausted"))
            }
        }

        fn next_frame(&mut self) -> Result<Frame> {
            if self.frames == 0 {
                return Err(anyhow!("exhausted"));
            }
            std::thread::sleep(Duration::from_millis(20));
            self.frames -= 1;
            Ok(Frame::new(vec![0u8; 3], 1, 1))
        }

        fn release(&mut self) {}
    }

    fn reader_config() -> ReaderConfig {
        ReaderConfig {
            reconnect_backoff: Duration::from_secs(60),
            ..ReaderConfig::default()
        }
    }

    fn detection(track_id: u64, cy: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(40.0, cy - 10.0, 60.0, cy + 10.0),
            track_id: Some(track_id),
            class_id: 0,
            confidence: 0.9,
        }
    }

    fn names() -> ClassNames {
        ClassNames::new([(0, "paquete")])
    }

    fn run_until(scheduler: &mut FrameScheduler, mut done: impl FnMut(&FrameScheduler) -> bool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(scheduler) {
            if Instant::now() >= deadline {
                return Err(anyhow!("condition not reached before deadline"));
            }
            if scheduler.run_cycle()?.is_idle() {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(())
    }

    #[test]
    fn routes_results_to_the_owning_camera_counter() -> Result<()> {
        let mut registry = SourceRegistry::new();
        registry.add(Box::new(FiniteSource { frames: 100 }), reader_config());
        registry.add(Box::new(FiniteSource { frames: 100 }), reader_config());
        registry.start_all()?;

        let mut engine = ReplayEngine::new(names());
        for camera in [1, 2] {
            engine.push_frame(camera, vec![detection(7, 50.0)]);
            engine.push_frame(camera, vec![detection(7, 150.0)]);
        }
        let mut scheduler = FrameScheduler::new(registry, Box::new(engine), SchedulerConfig::default());
        scheduler.add_counter(LineCounter::new(
            1,
            CountingLine::from_coords([0, 100, 200, 100]),
            names(),
        ))?;

        run_until(&mut scheduler, |s| {
            s.counter(1).map(|c| c.total() == 1).unwrap_or(false)
        })?;
        assert!(scheduler.counter(2).is_none());
        assert_eq!(scheduler.counter(1).map(|c| c.count_for("paquete")), Some(1));

        let snapshots = scheduler.shutdown()?;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].camera_id, 1);
        Ok(())
    }

    #[test]
    fn stale_frames_are_not_resubmitted() -> Result<()> {
        let mut registry = SourceRegistry::new();
        registry.add(Box::new(FiniteSource { frames: 1 }), reader_config());
        registry.start_all()?;
        let mut scheduler =
            FrameScheduler::new(registry, Box::new(ReplayEngine::new(names())), SchedulerConfig::default());

        run_until(&mut scheduler, |s| s.cycles() == 1)?;
        // The reader now holds its only frame and has lost the source.
        let report = scheduler.run_cycle()?;
        assert!(report.is_idle());
        assert_eq!(report.skipped, vec![1]);
        scheduler.shutdown()?;
        Ok(())
    }

    #[test]
    fn empty_registry_cycles_are_idle() -> Result<()> {
        let mut scheduler = FrameScheduler::new(
            SourceRegistry::new(),
            Box::new(ReplayEngine::new(names())),
            SchedulerConfig::default(),
        );
        let report = scheduler.run_cycle()?;
        assert!(report.is_idle());
        assert!(report.skipped.is_empty());
        Ok(())
    }

    struct ShortEngine(ClassNames);

    impl TrackingEngine for ShortEngine {
        fn name(&self) -> &'static str {
            "short"
        }

        fn class_names(&self) -> &ClassNames {
            &self.0
        }

        fn track(&mut self, _frames: &[Arc<Frame>], _persist: bool) -> Result<Vec<TrackResult>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn mismatched_result_count_is_fatal() -> Result<()> {
        let mut registry = SourceRegistry::new();
        registry.add(Box::new(FiniteSource { frames: 100 }), reader_config());
        registry.start_all()?;
        let mut scheduler =
            FrameScheduler::new(registry, Box::new(ShortEngine(names())), SchedulerConfig::default());

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match scheduler.run_cycle() {
                Err(e) => break e,
                Ok(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                Ok(_) => return Err(anyhow!("engine error never surfaced")),
            }
        };
        assert!(err.to_string().contains("returned 0 results"));
        scheduler.shutdown()?;
        Ok(())
    }

    #[test]
    fn run_honours_stop_flag_and_cycle_limit() -> Result<()> {
        let mut registry = SourceRegistry::new();
        registry.add(Box::new(FiniteSource { frames: 100 }), reader_config());
        registry.start_all()?;
        let mut scheduler =
            FrameScheduler::new(registry, Box::new(ReplayEngine::new(names())), SchedulerConfig::default());

        let stop = AtomicBool::new(true);
        scheduler.run(&stop, None)?;
        assert_eq!(scheduler.cycles(), 0);

        stop.store(false, Ordering::SeqCst);
        scheduler.run(&stop, Some(2))?;
        assert_eq!(scheduler.cycles(), 2);
        scheduler.shutdown()?;
        Ok(())
    }

    #[test]
    fn rejects_counter_for_unknown_or_duplicate_camera() -> Result<()> {
        let mut registry = SourceRegistry::new();
        registry.add(Box::new(FiniteSource { frames: 1 }), reader_config());
        let mut scheduler =
            FrameScheduler::new(registry, Box::new(ReplayEngine::new(names())), SchedulerConfig::default());
        let line = CountingLine::from_coords([0, 100, 200, 100]);

        assert!(scheduler.add_counter(LineCounter::new(9, line, names())).is_err());
        scheduler.add_counter(LineCounter::new(1, line, names()))?;
        assert!(scheduler.add_counter(LineCounter::new(1, line, names())).is_err());
        Ok(())
    }
}
