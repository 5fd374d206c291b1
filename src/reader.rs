//! Per-camera background reader.
//!
//! Each `SourceReader` owns one `FrameSource` and runs its acquisition loop
//! on a dedicated thread. The loop is the sole writer of a small shared cell
//! (latest frame + connection flag) guarded by a mutex scoped to this camera;
//! the scheduler polls it through `read()` without ever blocking on I/O.
//!
//! Only the newest frame is kept. A successful read replaces whatever the
//! cell held, so unread frames are dropped rather than queued.
//!
//! Connection handling:
//! - initial `connect()` happens at construction; failure is logged, not fatal
//! - a failed read marks the reader disconnected
//! - while disconnected the loop sleeps `reconnect_backoff` and re-opens the
//!   same source in place, forever, until `stop()`

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{CameraId, Frame};
use crate::ingest::FrameSource;

const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Sleep before each reconnection attempt.
    pub reconnect_backoff: Duration,
    /// Start the acquisition loop even if the initial connection failed, so
    /// the reader keeps retrying. Off by default: a reader that never
    /// connected stays inert.
    pub retry_initial_failure: bool,
    /// Upper bound on how long `stop()` waits for the worker to exit.
    pub stop_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            retry_initial_failure: false,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct SharedState {
    frame: Option<Arc<Frame>>,
    connected: bool,
    frames_captured: u64,
    reconnects: u64,
}

/// Point-in-time reader statistics.
#[derive(Clone, Debug)]
pub struct ReaderStats {
    pub camera_id: CameraId,
    pub locator: String,
    pub connected: bool,
    pub running: bool,
    pub frames_captured: u64,
    pub reconnects: u64,
}

pub struct SourceReader {
    camera_id: CameraId,
    locator: String,
    config: ReaderConfig,
    shared: Arc<Mutex<SharedState>>,
    stop: Arc<AtomicBool>,
    /// Held here until `start()` hands it to the worker.
    source: Option<Box<dyn FrameSource>>,
    worker: Option<JoinHandle<()>>,
}

impl SourceReader {
    /// Wrap a source and attempt the initial connection.
    pub fn new(camera_id: CameraId, mut source: Box<dyn FrameSource>, config: ReaderConfig) -> Self {
        let locator = source.describe().to_string();
        let connected = match source.connect() {
            Ok(()) => {
                log::info!("camera {}: connected to {}", camera_id, locator);
                true
            }
            Err(e) => {
                log::warn!("camera {}: could not connect to {}: {:#}", camera_id, locator, e);
                false
            }
        };
        let shared = SharedState {
            connected,
            ..SharedState::default()
        };
        Self {
            camera_id,
            locator,
            config,
            shared: Arc::new(Mutex::new(shared)),
            stop: Arc::new(AtomicBool::new(false)),
            source: Some(source),
            worker: None,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Spawn the acquisition loop. Returns whether a worker is running.
    ///
    /// A reader whose initial connection failed is left inert when
    /// `retry_initial_failure` is off.
    pub fn start(&mut self) -> Result<bool> {
        if self.worker.is_some() {
            return Ok(true);
        }
        if !self.is_connected() && !self.config.retry_initial_failure {
            log::warn!(
                "camera {}: not connected, reader left inactive",
                self.camera_id
            );
            return Ok(false);
        }
        let Some(source) = self.source.take() else {
            return Err(anyhow!("camera {}: reader already stopped", self.camera_id));
        };

        self.stop.store(false, Ordering::SeqCst);
        let worker = AcquisitionLoop {
            camera_id: self.camera_id,
            source: ReleaseOnExit(source),
            shared: self.shared.clone(),
            stop: self.stop.clone(),
            backoff: self.config.reconnect_backoff,
        };
        let handle = std::thread::Builder::new()
            .name(format!("camera-{}", self.camera_id))
            .spawn(move || worker.run())
            .map_err(|e| anyhow!("camera {}: failed to spawn reader: {}", self.camera_id, e))?;
        self.worker = Some(handle);
        Ok(true)
    }

    /// Latest captured frame, if any. Never blocks on I/O.
    pub fn read(&self) -> Option<Arc<Frame>> {
        lock_shared(&self.shared).frame.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock_shared(&self.shared).connected
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> ReaderStats {
        let shared = lock_shared(&self.shared);
        ReaderStats {
            camera_id: self.camera_id,
            locator: self.locator.clone(),
            connected: shared.connected,
            running: self.is_running(),
            frames_captured: shared.frames_captured,
            reconnects: shared.reconnects,
        }
    }

    /// Stop the loop, wait (bounded) for the worker, release the capture.
    ///
    /// Idempotent. The worker releases its source on exit; an inert reader
    /// releases here.
    pub fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);

        if let Some(mut source) = self.source.take() {
            source.release();
        }

        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.config.stop_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "camera {}: reader did not stop within {:?}",
                    self.camera_id,
                    self.config.stop_timeout
                ));
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
        handle
            .join()
            .map_err(|_| anyhow!("camera {}: reader thread panicked", self.camera_id))?;
        lock_shared(&self.shared).connected = false;
        log::info!("camera {}: reader stopped", self.camera_id);
        Ok(())
    }
}

impl Drop for SourceReader {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("{:#}", e);
        }
    }
}

fn lock_shared(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    // The state is a plain value cell; a panic mid-write cannot leave it torn.
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ReleaseOnExit(Box<dyn FrameSource>);

impl Drop for ReleaseOnExit {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct AcquisitionLoop {
    camera_id: CameraId,
    source: ReleaseOnExit,
    shared: Arc<Mutex<SharedState>>,
    stop: Arc<AtomicBool>,
    backoff: Duration,
}

impl AcquisitionLoop {
    fn run(mut self) {
        let mut sequence = 0u64;
        while !self.stopped() {
            if !lock_shared(&self.shared).connected {
                if !self.sleep_unless_stopped(self.backoff) {
                    break;
                }
                self.reconnect();
                continue;
            }

            match self.source.0.next_frame() {
                Ok(frame) => {
                    sequence += 1;
                    let frame = Arc::new(frame.stamp(self.camera_id, sequence));
                    let mut shared = lock_shared(&self.shared);
                    shared.frame = Some(frame);
                    shared.frames_captured += 1;
                }
                Err(e) => {
                    lock_shared(&self.shared).connected = false;
                    log::warn!("camera {}: signal lost: {:#}", self.camera_id, e);
                }
            }
        }
        log::debug!("camera {}: acquisition loop exiting", self.camera_id);
    }

    fn reconnect(&mut self) {
        let source = &mut self.source.0;
        source.release();
        match source.connect() {
            Ok(()) => {
                let mut shared = lock_shared(&self.shared);
                shared.connected = true;
                shared.reconnects += 1;
                log::info!(
                    "camera {}: reconnected to {}",
                    self.camera_id,
                    source.describe()
                );
            }
            Err(e) => {
                log::debug!("camera {}: reconnect failed: {:#}", self.camera_id, e);
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep in short slices so `stop()` is observed promptly. Returns false
    /// when stopped.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Source whose availability is flipped from the test.
    struct FlakySource {
        available: Arc<AtomicBool>,
        releases: Arc<AtomicUsize>,
        open: bool,
    }

    impl FrameSource for FlakySource {
        fn describe(&self) -> &str {
            "test://flaky"
        }

        fn connect(&mut self) -> Result<()> {
            if self.available.load(Ordering::SeqCst) {
                self.open = true;
                Ok(())
            } else {
                Err(anyhow!("unavailable"))
            }
        }

        fn next_frame(&mut self) -> Result<Frame> {
            std::thread::sleep(Duration::from_millis(2));
            if self.open && self.available.load(Ordering::SeqCst) {
                Ok(Frame::new(vec![0u8; 3], 1, 1))
            } else {
                self.open = false;
                Err(anyhow!("read failed"))
            }
        }

        fn release(&mut self) {
            self.open = false;
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flaky(available: bool) -> (Box<dyn FrameSource>, Arc<AtomicBool>, Arc<AtomicUsize>) {
        let flag = Arc::new(AtomicBool::new(available));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = FlakySource {
            available: flag.clone(),
            releases: releases.clone(),
            open: false,
        };
        (Box::new(source), flag, releases)
    }

    fn fast_config() -> ReaderConfig {
        ReaderConfig {
            reconnect_backoff: Duration::from_millis(30),
            retry_initial_failure: true,
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn never_connected_reader_returns_no_frame_without_blocking() -> Result<()> {
        let (source, _available, _) = flaky(false);
        let mut reader = SourceReader::new(1, source, fast_config());
        reader.start()?;
        assert!(!reader.is_connected());

        for _ in 0..20 {
            let started = Instant::now();
            assert!(reader.read().is_none());
            assert!(started.elapsed() < Duration::from_millis(50));
            std::thread::sleep(Duration::from_millis(10));
        }
        reader.stop()?;
        Ok(())
    }

    #[test]
    fn keeps_only_latest_frame() -> Result<()> {
        let (source, _available, _) = flaky(true);
        let mut reader = SourceReader::new(4, source, fast_config());
        reader.start()?;

        assert!(wait_until(Duration::from_secs(2), || {
            reader.read().map(|f| f.sequence >= 5).unwrap_or(false)
        }));
        let frame = reader.read().expect("frame after wait");
        assert_eq!(frame.camera_id, 4);
        let stats = reader.stats();
        assert!(stats.frames_captured >= frame.sequence);
        reader.stop()?;
        Ok(())
    }

    #[test]
    fn resumes_after_source_recovers() -> Result<()> {
        let (source, available, _) = flaky(true);
        let mut reader = SourceReader::new(2, source, fast_config());
        reader.start()?;
        assert!(wait_until(Duration::from_secs(2), || reader.read().is_some()));

        available.store(false, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || !reader.is_connected()));
        let stale = reader.read().map(|f| f.sequence).unwrap_or(0);

        available.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || reader.is_connected()));
        assert!(wait_until(Duration::from_secs(2), || {
            reader.read().map(|f| f.sequence > stale).unwrap_or(false)
        }));
        assert!(reader.stats().reconnects >= 1);
        reader.stop()?;
        Ok(())
    }

    #[test]
    fn initially_failed_reader_connects_later_when_retry_enabled() -> Result<()> {
        let (source, available, _) = flaky(false);
        let mut reader = SourceReader::new(3, source, fast_config());
        assert!(reader.start()?);
        std::thread::sleep(Duration::from_millis(60));
        assert!(reader.read().is_none());

        available.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || reader.read().is_some()));
        reader.stop()?;
        Ok(())
    }

    #[test]
    fn default_config_leaves_failed_reader_inert() -> Result<()> {
        let (source, available, releases) = flaky(false);
        let mut reader = SourceReader::new(5, source, ReaderConfig::default());
        assert!(!reader.start()?);
        assert!(!reader.is_running());
        assert!(!reader.is_connected());

        // No loop runs, so a recovered source is never picked up.
        available.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert!(reader.read().is_none());
        assert!(!reader.is_connected());
        assert_eq!(reader.stats().reconnects, 0);
        reader.stop()?;
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn stop_joins_worker_and_releases_source() -> Result<()> {
        let (source, _available, releases) = flaky(true);
        let mut reader = SourceReader::new(6, source, fast_config());
        reader.start()?;
        assert!(wait_until(Duration::from_secs(2), || reader.read().is_some()));

        reader.stop()?;
        assert!(!reader.is_running());
        assert!(!reader.is_connected());
        assert!(releases.load(Ordering::SeqCst) >= 1);

        // Second stop is a no-op.
        reader.stop()?;
        Ok(())
    }

    #[test]
    fn stop_interrupts_backoff() -> Result<()> {
        let (source, _available, _) = flaky(false);
        let config = ReaderConfig {
            reconnect_backoff: Duration::from_secs(30),
            ..fast_config()
        };
        let mut reader = SourceReader::new(7, source, config);
        reader.start()?;
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        reader.stop()?;
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    }
}
