//! counterd - multi-camera line-crossing counter daemon
//!
//! This daemon:
//! 1. Discovers cameras (RTSP_CAMERAS, RTSP_CAM_<n>, or the config file)
//! 2. Starts one background reader per camera
//! 3. Batches fresh frames through the tracking engine
//! 4. Counts tracks crossing each camera's line
//! 5. Posts count events to the remote API (or logs them)
//! 6. On Ctrl-C or a fatal error, stops every reader before exiting

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossing_counter::{
    config::CounterdConfig, CameraNotifier, EventNotifier, FrameScheduler, HttpNotifier,
    LineCounter, LogNotifier, ReplayEngine, SourceRegistry, TrackingEngine,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Count tracked objects crossing per-camera lines"
)]
struct Args {
    /// JSON config file.
    #[arg(long, env = "COUNTER_CONFIG")]
    config: Option<PathBuf>,

    /// Replay script answering tracking engine calls.
    /// Overrides "detections_path" from the config file.
    #[arg(long, env = "COUNTER_DETECTIONS")]
    detections: Option<PathBuf>,

    /// Stop after this many non-empty cycles.
    #[arg(long)]
    max_cycles: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = CounterdConfig::load_from(args.config.as_deref())?;

    let engine = match args.detections.as_ref().or(cfg.detections_path.as_ref()) {
        Some(path) => {
            log::info!("tracking engine: replay script {}", path.display());
            ReplayEngine::from_path(path)?
        }
        None => {
            log::warn!("no detections script configured; no objects will be tracked");
            ReplayEngine::new(Default::default())
        }
    };
    let class_names = engine.class_names().clone();
    if class_names.is_empty() {
        log::warn!("no class names configured; every count is labelled unknown");
    } else {
        log::info!("{} object classes", class_names.len());
    }

    let http = match &cfg.api {
        Some(api) => {
            let notifier = Arc::new(HttpNotifier::spawn(api.clone())?);
            log::info!("count events will be posted to {}", notifier.url());
            Some(notifier)
        }
        None => {
            log::warn!("no counting API configured; count events are logged only");
            None
        }
    };
    let sink: Arc<dyn EventNotifier> = match &http {
        Some(http) => http.clone(),
        None => Arc::new(LogNotifier),
    };

    let mut registry = SourceRegistry::from_locators(&cfg.sources, &cfg.reader)?;
    registry.start_all()?;

    let mut scheduler = FrameScheduler::new(registry, Box::new(engine), cfg.scheduler.clone());
    for camera_id in scheduler.registry().camera_ids() {
        let settings = cfg.camera(camera_id);
        let Some(line) = settings.and_then(|s| s.line) else {
            log::info!("camera {}: no counting line, not counting", camera_id);
            continue;
        };
        let terminal_id = settings.and_then(|s| s.terminal_id.clone());
        let notifier = CameraNotifier::new(camera_id, terminal_id, sink.clone());
        let terminal = notifier.terminal_id().to_string();
        let counter = LineCounter::new(camera_id, line, class_names.clone())
            .with_mode(cfg.crossing)
            .with_notifier(notifier);
        log::info!(
            "camera {}: counting line {:?} -> {:?} (terminal {})",
            camera_id,
            counter.line().start(),
            counter.line().end(),
            terminal
        );
        scheduler.add_counter(counter)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("counterd running with {} cameras", cfg.sources.len());
    let result = scheduler.run(&stop, args.max_cycles);
    if let Err(e) = &result {
        log::error!("fatal: {:#}; shutting down", e);
    } else {
        log::info!("shutdown requested");
    }

    match scheduler.shutdown() {
        Ok(snapshots) => {
            for snapshot in snapshots {
                log::info!(
                    "camera {}: total {} {:?}",
                    snapshot.camera_id,
                    snapshot.total,
                    snapshot.counts
                );
            }
        }
        Err(e) => log::error!("shutdown incomplete: {:#}", e),
    }
    if let Some(http) = &http {
        if let Err(e) = http.shutdown() {
            log::error!("{:#}", e);
        }
        if http.dropped() > 0 {
            log::warn!("{} count events were dropped undelivered", http.dropped());
        }
    }
    result
}
