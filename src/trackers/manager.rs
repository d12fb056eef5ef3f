use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TrackersConfig;
use crate::events::{BackendMode, TrackerDiff, TrackerHealth};

use super::backend::BackendError;
use super::file::FileTracker;
use super::network::NetworkTracker;
use super::process::ProcessTracker;

/// Pids currently known to the process tracker; scopes the network and
/// file trackers.
pub type KnownPids = Arc<RwLock<HashSet<u32>>>;

/// Per-tracker status surfaced through `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    pub name: String,
    pub enabled: bool,
    pub health: TrackerHealth,
    pub backend: Option<BackendMode>,
    pub cycles_completed: u64,
    pub last_error: Option<String>,
}

// Enum instead of trait objects so each tracker keeps its concrete API.
pub enum TrackerInstance {
    Process(ProcessTracker),
    Network(NetworkTracker),
    File(FileTracker),
}

impl TrackerInstance {
    pub fn start(&self) -> JoinHandle<()> {
        match self {
            TrackerInstance::Process(t) => t.start(),
            TrackerInstance::Network(t) => t.start(),
            TrackerInstance::File(t) => t.start(),
        }
    }

    pub async fn get_status(&self) -> TrackerStatus {
        match self {
            TrackerInstance::Process(t) => t.get_status().await,
            TrackerInstance::Network(t) => t.get_status().await,
            TrackerInstance::File(t) => t.get_status().await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrackerInstance::Process(t) => t.name(),
            TrackerInstance::Network(t) => t.name(),
            TrackerInstance::File(t) => t.name(),
        }
    }
}

/// Shared loop state every tracker carries.
#[derive(Clone)]
pub struct TrackerShared {
    pub health: Arc<RwLock<TrackerHealth>>,
    pub cycles_completed: Arc<RwLock<u64>>,
    pub last_error: Arc<RwLock<Option<String>>>,
    pub cancel: CancellationToken,
    pub diff_sender: mpsc::Sender<TrackerDiff>,
}

impl TrackerShared {
    pub fn new(cancel: CancellationToken, diff_sender: mpsc::Sender<TrackerDiff>) -> Self {
        Self {
            health: Arc::new(RwLock::new(TrackerHealth::Stopped)),
            cycles_completed: Arc::new(RwLock::new(0)),
            last_error: Arc::new(RwLock::new(None)),
            cancel,
            diff_sender,
        }
    }

    pub async fn record_error(&self, err: &BackendError) {
        *self.last_error.write().await = Some(err.to_string());
    }
}

/// Cycle-driven tracker loop.
///
/// Recoverable cycle errors are logged and the loop continues; a fatal
/// backend error ends the loop and marks the tracker degraded while the
/// rest of the daemon keeps running. Cancellation is observed at cycle
/// boundaries only, so a cycle in flight always completes.
#[async_trait::async_trait]
pub trait PeriodicTracker: Send + Sync {
    async fn cycle(&self) -> Result<Vec<TrackerDiff>, BackendError>;
    fn cycle_interval(&self) -> Duration;
    fn shared(&self) -> &TrackerShared;
    fn name(&self) -> &'static str;

    async fn run_periodic(&self) {
        let shared = self.shared();
        *shared.health.write().await = TrackerHealth::Running;

        let mut interval = tokio::time::interval(self.cycle_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.cycle().await {
                Ok(diffs) => {
                    *shared.cycles_completed.write().await += 1;
                    for diff in diffs {
                        if shared.diff_sender.send(diff).await.is_err() {
                            debug!("{}: diff channel closed, stopping", self.name());
                            *shared.health.write().await = TrackerHealth::Stopped;
                            return;
                        }
                    }
                }
                Err(err @ BackendError::Fatal(_))
                | Err(err @ BackendError::CapabilityUnavailable(_)) => {
                    error!("{}: backend permanently unusable: {}", self.name(), err);
                    shared.record_error(&err).await;
                    *shared.health.write().await = TrackerHealth::Degraded;
                    return;
                }
                Err(err) => {
                    warn!("{}: cycle error: {}", self.name(), err);
                    shared.record_error(&err).await;
                }
            }
        }

        debug!("{}: stopped", self.name());
        *shared.health.write().await = TrackerHealth::Stopped;
    }
}

pub struct TrackerManager {
    trackers: Vec<TrackerInstance>,
    cancel: CancellationToken,
    handles: RwLock<Vec<(&'static str, JoinHandle<()>)>>,
}

impl TrackerManager {
    pub async fn new(
        config: TrackersConfig,
        diff_sender: mpsc::Sender<TrackerDiff>,
        known_pids: KnownPids,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let mut trackers: Vec<TrackerInstance> = Vec::new();

        if config.process.enabled {
            info!("Initializing process tracker");
            let shared = TrackerShared::new(cancel.child_token(), diff_sender.clone());
            let tracker =
                ProcessTracker::new(config.process.clone(), shared, known_pids.clone()).await?;
            trackers.push(TrackerInstance::Process(tracker));
        }

        if config.network.enabled {
            info!("Initializing network tracker");
            let shared = TrackerShared::new(cancel.child_token(), diff_sender.clone());
            let tracker = NetworkTracker::new(config.network.clone(), shared, known_pids.clone());
            trackers.push(TrackerInstance::Network(tracker));
        }

        if config.file.enabled {
            info!("Initializing file tracker");
            let shared = TrackerShared::new(cancel.child_token(), diff_sender.clone());
            let tracker = FileTracker::new(config.file.clone(), shared, known_pids.clone())?;
            trackers.push(TrackerInstance::File(tracker));
        }

        Ok(Self {
            trackers,
            cancel,
            handles: RwLock::new(Vec::new()),
        })
    }

    pub async fn start(&self) {
        info!("Starting {} trackers", self.trackers.len());

        let mut handles = self.handles.write().await;
        for tracker in &self.trackers {
            let handle = tracker.start();
            info!("Started tracker: {}", tracker.name());
            handles.push((tracker.name(), handle));
        }
    }

    /// Cancel all tracker loops and join each with a bounded timeout.
    /// Proceeds regardless when a loop fails to finish in time.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Stopping {} trackers", self.trackers.len());
        self.cancel.cancel();

        let mut handles = self.handles.write().await;
        for (name, handle) in handles.drain(..) {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!("Stopped tracker: {}", name),
                Ok(Err(e)) => warn!("Tracker {} task error at shutdown: {}", name, e),
                Err(_) => warn!(
                    "Tracker {} did not stop within {:?}, proceeding",
                    name, timeout
                ),
            }
        }
    }

    pub async fn get_status(&self) -> Vec<TrackerStatus> {
        let mut statuses = Vec::new();
        for tracker in &self.trackers {
            statuses.push(tracker.get_status().await);
        }
        statuses
    }
}
