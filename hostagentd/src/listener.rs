//! Control-channel listener and task workers.
//!
//! The agent connects out to a control socket, reads a framed bootstrap
//! configuration, then consumes task-channel names one at a time in
//! arrival order. Each name maps to a per-task socket in the channel
//! directory; a worker is spawned per name while the control loop goes
//! straight back to reading. Work is tracked by live counters so the
//! shutdown sentinel can drain in-flight tasks before the agent reports
//! itself stopped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hostagent_proto::frame::{read_framed, write_framed};
use hostagent_proto::{
    SENTINEL_DONE, SHORTCUT_HEALTHCHECK, SHORTCUT_STATUSCHECK, SHORTCUT_VERSIONCHECK,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, SharedConfig};
use crate::events::EventLog;
use crate::health::HealthProbe;
use crate::processor::RequestProcessor;
use crate::tasks::ConfigFetcher;
use crate::AGENT_VERSION;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle phase reported by `statuscheck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentStatus {
    /// Started, waiting for the bootstrap configuration.
    Queue = 0,
    /// Bootstrapped and dispatching tasks.
    Running = 1,
    /// Shutting down or waiting to be replaced by a newer agent.
    Stopping = 2,
}

impl AgentStatus {
    /// Variant name as reported by `statuscheck`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Queue => "Queue",
            AgentStatus::Running => "Running",
            AgentStatus::Stopping => "Stopping",
        }
    }
}

/// Lock-free holder for the current lifecycle phase.
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: AgentStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn set(&self, status: AgentStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> AgentStatus {
        match self.0.load(Ordering::SeqCst) {
            0 => AgentStatus::Queue,
            1 => AgentStatus::Running,
            _ => AgentStatus::Stopping,
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(AgentStatus::Queue)
    }
}

/// Live counts of in-flight work, split by origin. Request workers count
/// as synchronous work; background maintenance applying a configuration
/// counts as asynchronous work. Shutdown drains both.
#[derive(Default)]
pub struct WorkCounters {
    sync_running: AtomicUsize,
    async_running: AtomicUsize,
}

impl WorkCounters {
    pub fn begin_sync(self: &Arc<Self>) -> WorkGuard {
        self.sync_running.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            counters: self.clone(),
            asynchronous: false,
        }
    }

    pub fn begin_async(self: &Arc<Self>) -> WorkGuard {
        self.async_running.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            counters: self.clone(),
            asynchronous: true,
        }
    }

    pub fn counts(&self) -> (usize, usize) {
        (
            self.sync_running.load(Ordering::SeqCst),
            self.async_running.load(Ordering::SeqCst),
        )
    }

    pub fn idle(&self) -> bool {
        self.counts() == (0, 0)
    }
}

/// Decrements its counter when dropped, so a panicking or early-returning
/// worker can never leave the drain loop waiting forever.
pub struct WorkGuard {
    counters: Arc<WorkCounters>,
    asynchronous: bool,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let counter = if self.asynchronous {
            &self.counters.async_running
        } else {
            &self.counters.sync_running
        };
        counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Listener {
    pub channel_dir: PathBuf,
    pub control_name: String,
    pub processor: Arc<RequestProcessor>,
    pub config: SharedConfig,
    pub events: Arc<EventLog>,
    pub probe: Arc<HealthProbe>,
    pub fetcher: Arc<dyn ConfigFetcher>,
    pub counters: Arc<WorkCounters>,
    pub status: Arc<StatusCell>,
    pub maintenance_interval: Duration,
}

impl Listener {
    /// Run the control loop to completion: bootstrap, dispatch until the
    /// shutdown sentinel, then drain in-flight work.
    pub async fn run(&self) -> Result<()> {
        let control_path = self.channel_dir.join(&self.control_name);
        info!(path = %control_path.display(), "connecting to control channel");
        let control = UnixStream::connect(&control_path)
            .await
            .with_context(|| format!("cannot connect to control channel {}", control_path.display()))?;
        let (read_half, _write_half) = control.into_split();
        let mut control = BufReader::new(read_half);

        // First frame is the bootstrap configuration document.
        let bootstrap = read_framed(&mut control)
            .await
            .context("control channel closed before bootstrap configuration")?;
        let bootstrap = AgentConfig::new(&bootstrap).context("bad bootstrap configuration")?;
        {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            *config = bootstrap;
        }
        self.status.set(AgentStatus::Running);
        self.events.milestone("agent", "bootstrap configuration received")?;
        info!("agent running");

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let maintenance = tokio::spawn(maintenance_loop(
            self.config.clone(),
            self.processor.clone(),
            self.fetcher.clone(),
            self.events.clone(),
            self.status.clone(),
            self.counters.clone(),
            self.maintenance_interval,
            stop_rx,
        ));

        loop {
            let name = match read_framed(&mut control).await {
                Ok(name) => name,
                Err(e) => {
                    warn!("control channel failed: {e}");
                    break;
                }
            };

            if name == SENTINEL_DONE {
                info!("shutdown sentinel received");
                break;
            }

            debug!(channel = %name, "dispatching task worker");
            // Count the work before the worker is scheduled so a fast
            // shutdown cannot observe an idle gap.
            let guard = self.counters.begin_sync();
            let worker = TaskWorker {
                path: self.channel_dir.join(&name),
                processor: self.processor.clone(),
                probe: self.probe.clone(),
                status: self.status.clone(),
            };
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = worker.run().await {
                    warn!("task worker failed: {e:#}");
                }
            });
        }

        self.status.set(AgentStatus::Stopping);
        // Joining the maintenance task lets a pass already underway run
        // to completion; a configuration apply is never cancelled midway.
        let _ = stop_tx.send(true);
        if let Err(e) = maintenance.await {
            warn!("maintenance task failed: {e}");
        }
        self.drain().await;
        self.events.milestone("agent", "all in-flight work drained")?;
        Ok(())
    }

    async fn drain(&self) {
        loop {
            let (sync_running, async_running) = self.counters.counts();
            if sync_running == 0 && async_running == 0 {
                return;
            }
            debug!(sync_running, async_running, "waiting for in-flight work");
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// Handles one task channel: read a request, produce a response, close.
struct TaskWorker {
    path: PathBuf,
    processor: Arc<RequestProcessor>,
    probe: Arc<HealthProbe>,
    status: Arc<StatusCell>,
}

impl TaskWorker {
    async fn run(self) -> Result<()> {
        let stream = UnixStream::connect(&self.path)
            .await
            .with_context(|| format!("cannot connect to task channel {}", self.path.display()))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = read_framed(&mut reader)
            .await
            .context("task channel closed before request")?;

        let response = match request.as_str() {
            SHORTCUT_HEALTHCHECK => self.probe.check().await,
            SHORTCUT_STATUSCHECK => self.status.get().as_str().to_string(),
            SHORTCUT_VERSIONCHECK => AGENT_VERSION.to_string(),
            raw => {
                let outcome = self.processor.process(raw).await;
                if outcome.clock_drift {
                    synchronize_clock().await;
                }
                outcome.response
            }
        };

        write_framed(&mut write_half, &response)
            .await
            .context("failed to write response")?;
        // Make sure the peer has the full frame before the channel closes.
        write_half
            .shutdown()
            .await
            .context("failed to drain response channel")?;
        Ok(())
    }
}

/// Best-effort step of the host clock after a request was rejected for
/// looking skewed. Failure only logs; the request stays rejected.
async fn synchronize_clock() {
    info!("request timestamp outside window, stepping host clock");
    match tokio::process::Command::new("chronyc")
        .arg("makestep")
        .output()
        .await
    {
        Ok(out) if out.status.success() => info!("host clock stepped"),
        Ok(out) => warn!(code = ?out.status.code(), "clock step command failed"),
        Err(e) => warn!("clock step command unavailable: {e}"),
    }
}

/// Periodic background pass: notice when a newer agent version is
/// available, and re-poll the configured location for a replacement
/// configuration document.
#[allow(clippy::too_many_arguments)]
async fn maintenance_loop(
    config: SharedConfig,
    processor: Arc<RequestProcessor>,
    fetcher: Arc<dyn ConfigFetcher>,
    events: Arc<EventLog>,
    status: Arc<StatusCell>,
    counters: Arc<WorkCounters>,
    interval: Duration,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so maintenance starts
    // one full interval after bootstrap.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                debug!("maintenance loop stopped");
                return;
            }
        }
        if status.get() != AgentStatus::Running {
            continue;
        }

        let snapshot = config.read().unwrap_or_else(|e| e.into_inner()).clone();

        if let Some(available) = snapshot.available_agent_version() {
            if available != AGENT_VERSION {
                info!(%available, current = AGENT_VERSION, "newer agent version available");
                status.set(AgentStatus::Stopping);
                if let Err(e) = events.milestone(
                    "agent",
                    &format!("agent version {available} available, preparing to stop"),
                ) {
                    warn!("failed to record version milestone: {e:#}");
                }
                continue;
            }
        }

        let Some(url) = snapshot.config_url() else {
            continue;
        };
        let fetched = match fetcher.fetch(&url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                debug!("maintenance configuration poll failed: {e:#}");
                continue;
            }
        };
        if fetched == snapshot {
            continue;
        }

        info!("maintenance poll found a changed configuration");
        let _guard = counters.begin_async();
        if let Err(e) = processor.apply_config(fetched).await {
            warn!("maintenance configuration apply failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_round_trips() {
        let cell = StatusCell::default();
        assert_eq!(cell.get(), AgentStatus::Queue);
        cell.set(AgentStatus::Running);
        assert_eq!(cell.get(), AgentStatus::Running);
        cell.set(AgentStatus::Stopping);
        assert_eq!(cell.get().as_str(), "Stopping");
    }

    #[test]
    fn work_guard_decrements_on_drop() {
        let counters = Arc::new(WorkCounters::default());
        assert!(counters.idle());

        let sync_guard = counters.begin_sync();
        let async_guard = counters.begin_async();
        assert_eq!(counters.counts(), (1, 1));

        drop(sync_guard);
        assert_eq!(counters.counts(), (0, 1));
        drop(async_guard);
        assert!(counters.idle());
    }

    #[test]
    fn guard_survives_early_return() {
        let counters = Arc::new(WorkCounters::default());
        fn bail(_guard: WorkGuard) -> Result<()> {
            anyhow::bail!("worker failed")
        }
        let guard = counters.begin_sync();
        assert!(bail(guard).is_err());
        assert!(counters.idle());
    }
}
