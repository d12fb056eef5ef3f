use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ProcessTrackerConfig;
use crate::events::{BackendMode, ProcessDiff, ProcessScan, ProcessSnapshot, TrackerDiff};

use super::backend::{select_backend, BackendError, ProcessBackend};
use super::manager::{KnownPids, PeriodicTracker, TrackerShared, TrackerStatus};

/// Started-at drift (seconds) above which a pid observed in consecutive
/// scans is treated as a different process (pid reused within one interval).
const PID_REUSE_START_DRIFT_SECS: i64 = 2;

pub struct ProcessTracker {
    config: ProcessTrackerConfig,
    shared: TrackerShared,
    known_pids: KnownPids,
    backend: Arc<Mutex<Box<dyn ProcessBackend>>>,
    mode: BackendMode,
    previous: Arc<RwLock<HashMap<u32, ProcessSnapshot>>>,
    /// Pids spawned last cycle; their first re-observation always emits an
    /// update so the tree can move them out of `Starting`.
    awaiting_first_update: Arc<RwLock<HashSet<u32>>>,
}

impl ProcessTracker {
    pub async fn new(
        config: ProcessTrackerConfig,
        shared: TrackerShared,
        known_pids: KnownPids,
    ) -> Result<Self> {
        let backend = select_backend(config.prefer_kernel_backend);
        let mode = backend.mode();
        Ok(Self::with_backend(config, shared, known_pids, backend, mode))
    }

    /// Build a tracker over an explicit backend. Test seam and the tail of
    /// backend selection.
    pub(crate) fn with_backend(
        config: ProcessTrackerConfig,
        shared: TrackerShared,
        known_pids: KnownPids,
        backend: Box<dyn ProcessBackend>,
        mode: BackendMode,
    ) -> Self {
        Self {
            config,
            shared,
            known_pids,
            backend: Arc::new(Mutex::new(backend)),
            mode,
            previous: Arc::new(RwLock::new(HashMap::new())),
            awaiting_first_update: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker.run_periodic().await;
            tracker.backend.lock().await.shutdown();
        })
    }

    pub fn backend_mode(&self) -> BackendMode {
        self.mode
    }

    pub async fn get_status(&self) -> TrackerStatus {
        TrackerStatus {
            name: self.name().to_string(),
            enabled: self.config.enabled,
            health: *self.shared.health.read().await,
            backend: Some(self.mode),
            cycles_completed: *self.shared.cycles_completed.read().await,
            last_error: self.shared.last_error.read().await.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        "process_tracker"
    }

    fn significant_change(&self, old: &ProcessSnapshot, new: &ProcessSnapshot) -> bool {
        let cpu_delta = (old.cpu_percent.unwrap_or(0.0) - new.cpu_percent.unwrap_or(0.0)).abs();
        let memory_delta = (old.memory_bytes.unwrap_or(0) as i64
            - new.memory_bytes.unwrap_or(0) as i64)
            .unsigned_abs();

        cpu_delta > self.config.significant_cpu_delta
            || memory_delta > self.config.significant_memory_delta_bytes
    }

    /// Diff the scan against the previous one.
    ///
    /// A pid absent from the previous scan is always spawned, even if the
    /// same pid existed and vanished earlier; a pid whose read failed this
    /// cycle is carried forward untouched and reconciled next cycle.
    async fn diff_scan(&self, scan: ProcessScan) -> ProcessDiff {
        let mut previous = self.previous.write().await;
        let mut awaiting = self.awaiting_first_update.write().await;
        let mut diff = ProcessDiff::default();
        let mut next: HashMap<u32, ProcessSnapshot> = HashMap::with_capacity(scan.processes.len());

        for (pid, snapshot) in scan.processes {
            match previous.remove(&pid) {
                None => {
                    debug!("New process: {} (pid {})", snapshot.name, pid);
                    diff.spawned.push(snapshot.clone());
                    awaiting.insert(pid);
                    next.insert(pid, snapshot);
                }
                Some(old) => {
                    let drift = (snapshot.started_at - old.started_at).num_seconds().abs();
                    if drift > PID_REUSE_START_DRIFT_SECS {
                        // The pid was recycled between scans: close out the
                        // old incarnation, then spawn the new one.
                        debug!("Pid {} reused within one interval", pid);
                        let exit = scan.exits.get(&pid).copied().unwrap_or_default();
                        diff.exited.push((pid, exit));
                        diff.spawned.push(snapshot.clone());
                        awaiting.insert(pid);
                    } else if awaiting.remove(&pid) || self.significant_change(&old, &snapshot) {
                        diff.updated.push(snapshot.clone());
                    }
                    next.insert(pid, snapshot);
                }
            }
        }

        // Everything left in the previous table was not observed this cycle.
        for (pid, old) in previous.drain() {
            if scan.failed_reads.contains(&pid) {
                // Vanished mid-read; not an exit yet.
                next.insert(pid, old);
            } else {
                debug!("Process exited: {} (pid {})", old.name, pid);
                let exit = scan.exits.get(&pid).copied().unwrap_or_default();
                diff.exited.push((pid, exit));
                awaiting.remove(&pid);
            }
        }

        *previous = next;
        diff
    }
}

#[async_trait::async_trait]
impl PeriodicTracker for ProcessTracker {
    async fn cycle(&self) -> Result<Vec<TrackerDiff>, BackendError> {
        let scan = {
            let mut backend = self.backend.lock().await;
            backend.scan()?
        };

        let diff = self.diff_scan(scan).await;

        {
            let previous = self.previous.read().await;
            let mut known = self.known_pids.write().await;
            known.clear();
            known.extend(previous.keys().copied());
        }

        if diff.is_empty() {
            Ok(vec![])
        } else {
            Ok(vec![TrackerDiff::Process(diff)])
        }
    }

    fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.config.scan_interval_ms)
    }

    fn shared(&self) -> &TrackerShared {
        &self.shared
    }

    fn name(&self) -> &'static str {
        "process_tracker"
    }
}

impl Clone for ProcessTracker {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            shared: self.shared.clone(),
            known_pids: self.known_pids.clone(),
            backend: self.backend.clone(),
            mode: self.mode,
            previous: self.previous.clone(),
            awaiting_first_update: self.awaiting_first_update.clone(),
        }
    }
}
