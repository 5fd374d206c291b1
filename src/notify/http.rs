//! HTTP delivery of count events.
//!
//! Events are queued on a bounded channel and posted by a single background
//! worker, so `notify()` never waits on the network. Each event is tried
//! once; a failure is logged and the event is dropped. A full queue drops
//! the new event. `shutdown()` waits at most `shutdown_timeout` for the
//! queue to drain and abandons whatever is left.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use url::Url;

use super::{CountEvent, EventNotifier};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_QUEUE_CAPACITY: usize = 256;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug)]
pub struct HttpNotifierConfig {
    pub url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Upper bound on how long `shutdown()` waits for queued events.
    pub shutdown_timeout: Duration,
    pub queue_capacity: usize,
}

impl HttpNotifierConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            timeout: DEFAULT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Wire format expected by the counting API.
#[derive(Debug, Serialize)]
struct CountPayload<'a> {
    #[serde(rename = "detectionTime")]
    detection_time: String,
    #[serde(rename = "tipoPaquete")]
    package_type: &'a str,
    terminal: &'a str,
}

impl<'a> CountPayload<'a> {
    fn from_event(event: &'a CountEvent) -> Self {
        Self {
            detection_time: event
                .detected_at
                .naive_local()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
            package_type: &event.label,
            terminal: &event.terminal_id,
        }
    }
}

pub struct HttpNotifier {
    url: String,
    shutdown_timeout: Duration,
    tx: Mutex<Option<SyncSender<CountEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    abandon: Arc<AtomicBool>,
    dropped: AtomicU64,
}

impl HttpNotifier {
    pub fn spawn(config: HttpNotifierConfig) -> Result<Self> {
        let url = Url::parse(&config.url)
            .with_context(|| format!("invalid notifier url '{}'", config.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "notifier url must be http(s), got '{}'",
                url.scheme()
            ));
        }

        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        let (tx, rx) = mpsc::sync_channel::<CountEvent>(config.queue_capacity.max(1));
        let abandon = Arc::new(AtomicBool::new(false));
        let worker_abandon = abandon.clone();
        let target = config.url.clone();
        let worker = std::thread::Builder::new()
            .name("count-notifier".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    if worker_abandon.load(Ordering::SeqCst) {
                        let left = 1 + rx.try_iter().count();
                        log::warn!("abandoning {} undelivered count events", left);
                        break;
                    }
                    match deliver(&agent, &target, &event) {
                        Ok((status, body)) if status == 200 || status == 201 => {
                            log::info!("count event delivered ({}): {}", status, body.trim());
                        }
                        Ok((status, body)) => {
                            log::warn!("count event rejected ({}): {}", status, body.trim());
                        }
                        Err(e) => {
                            log::warn!("count event delivery failed: {:#}", e);
                        }
                    }
                }
            })
            .context("failed to spawn notifier worker")?;

        Ok(Self {
            url: config.url,
            shutdown_timeout: config.shutdown_timeout,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            abandon,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Events dropped because the queue was full or the notifier was shut down.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Stop accepting events and give the worker up to `shutdown_timeout`
    /// to drain the queue. Past the deadline the remaining events are
    /// abandoned and the worker is left to finish its current request.
    pub fn shutdown(&self) -> Result<()> {
        self.tx
            .lock()
            .map_err(|_| anyhow!("notifier sender lock poisoned"))?
            .take();
        let worker = self
            .worker
            .lock()
            .map_err(|_| anyhow!("notifier worker lock poisoned"))?
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                self.abandon.store(true, Ordering::SeqCst);
                return Err(anyhow!(
                    "notifier did not drain within {:?}; pending events abandoned",
                    self.shutdown_timeout
                ));
            }
            std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        worker
            .join()
            .map_err(|_| anyhow!("notifier worker panicked"))?;
        Ok(())
    }
}

impl EventNotifier for HttpNotifier {
    fn notify(&self, event: CountEvent) {
        let Ok(guard) = self.tx.lock() else {
            log::warn!("notifier sender lock poisoned; dropping event");
            return;
        };
        let Some(tx) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            log::warn!("notifier shut down; dropping event");
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                log::warn!(
                    "notifier queue full; dropping {} event for terminal {}",
                    event.label,
                    event.terminal_id
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                log::warn!("notifier worker gone; dropping event");
            }
        }
    }
}

impl Drop for HttpNotifier {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("{:#}", e);
        }
    }
}

fn deliver(agent: &ureq::Agent, url: &str, event: &CountEvent) -> Result<(u16, String)> {
    let payload = CountPayload::from_event(event);
    let body = serde_json::to_string(&payload)?;
    log::debug!("posting count event to {}: {}", url, body);

    let response = match agent
        .post(url)
        .set("Content-Type", "application/json")
        .send_string(&body)
    {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(e) => return Err(anyhow!("POST {}: {}", url, e)),
    };
    let status = response.status();
    let text = response.into_string().unwrap_or_default();
    Ok((status, text))
}
