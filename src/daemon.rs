use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use notify::{RecursiveMode, Watcher};

use crate::config::Config;
use crate::hub::{EventHub, HubSubscriber};
use crate::query::{EngineStatus, QueryService};
use crate::signatures::{load_signature_file, SignatureMatcher, SignatureSet};
use crate::storage::StorageWriter;
use crate::trackers::{KnownPids, TrackerManager};
use crate::tree::{TreeManager, TreeState};

/// Capacity of the tracker-diff channel into the tree manager.
const DIFF_CHANNEL_CAPACITY: usize = 8_192;

/// The daemon: owns the trackers, the tree manager, the hub, and the
/// ambient tasks, and coordinates cooperative shutdown.
pub struct Daemon {
    config: Config,
    matcher: Arc<SignatureMatcher>,
    hub: EventHub,
    trackers: Arc<TrackerManager>,
    query: Arc<QueryService>,
    cancel: CancellationToken,
    tasks: RwLock<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Daemon {
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing agentwatch daemon");

        let matcher = Arc::new(build_matcher(&config)?);
        let hub = EventHub::new(config.hub.subscriber_buffer);
        let state = Arc::new(RwLock::new(TreeState::new()));
        let cancel = CancellationToken::new();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let (diff_tx, diff_rx) = mpsc::channel(DIFF_CHANNEL_CAPACITY);
        let known_pids = KnownPids::default();

        let trackers = Arc::new(
            TrackerManager::new(config.trackers.clone(), diff_tx, known_pids)
                .await
                .context("Failed to initialize trackers")?,
        );

        let tree_manager = TreeManager::new(state.clone(), matcher.clone(), hub.clone());
        tasks.push((
            "tree_manager",
            tree_manager.spawn(diff_rx, cancel.child_token()),
        ));

        if config.storage.enabled {
            let writer = StorageWriter::new(config.storage.clone())
                .await
                .context("Failed to initialize storage writer")?;
            tasks.push(("storage_writer", writer.spawn(hub.subscribe(), cancel.child_token())));
        }

        let query = Arc::new(QueryService::new(
            state,
            matcher.clone(),
            Some(trackers.clone()),
            config
                .daemon
                .instance_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            config
                .daemon
                .hostname
                .clone()
                .unwrap_or_else(|| "localhost".to_string()),
        ));

        Ok(Self {
            config,
            matcher,
            hub,
            trackers,
            query,
            cancel,
            tasks: RwLock::new(tasks),
        })
    }

    /// Start trackers and ambient tasks, then block until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!("Starting agentwatch daemon");

        self.trackers.start().await;

        if self.config.storage.enabled {
            let handle = self.spawn_storage_cleanup().await?;
            self.tasks.write().await.push(("storage_cleanup", handle));
        }

        if let Some(handle) = self.spawn_signature_reload() {
            self.tasks.write().await.push(("signature_reload", handle));
        }

        info!("agentwatch running");
        self.cancel.cancelled().await;
        Ok(())
    }

    /// Subscribe to the committed event stream.
    pub fn subscribe(&self) -> HubSubscriber {
        self.hub.subscribe()
    }

    pub fn query(&self) -> Arc<QueryService> {
        self.query.clone()
    }

    pub async fn get_status(&self) -> EngineStatus {
        self.query.get_status().await
    }

    /// Re-read the signature file and publish the new set.
    pub fn reload_signatures(&self) -> Result<()> {
        let Some(ref path) = self.config.signatures.file_path else {
            anyhow::bail!("No signature file configured");
        };
        let raw = load_signature_file(path)?;
        self.matcher.swap(SignatureSet::compile(raw));
        Ok(())
    }

    /// Cooperative shutdown: trackers finish their current cycle, the tree
    /// manager drains queued diffs, the storage writer flushes, and every
    /// task is joined with a bounded timeout.
    pub async fn shutdown(&self) {
        info!("Shutting down agentwatch daemon");
        let timeout = Duration::from_millis(self.config.daemon.shutdown_timeout_ms);

        self.trackers.shutdown(timeout).await;

        self.cancel.cancel();

        let mut tasks = self.tasks.write().await;
        for (name, handle) in tasks.drain(..) {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!("Stopped task: {}", name),
                Ok(Err(e)) => warn!("Task {} failed at shutdown: {}", name, e),
                Err(_) => warn!("Task {} did not stop within {:?}, proceeding", name, timeout),
            }
        }

        info!("agentwatch shutdown complete");
    }

    /// Periodic TTL cleanup of stored batch files.
    async fn spawn_storage_cleanup(&self) -> Result<JoinHandle<()>> {
        let writer = StorageWriter::new(self.config.storage.clone()).await?;
        let cancel = self.cancel.child_token();

        Ok(tokio::spawn(async move {
            let interval = Duration::from_secs(3600);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = writer.cleanup_old_batches().await {
                            error!("Storage cleanup failed: {}", e);
                        }
                    }
                }
            }
        }))
    }

    /// Watch the signature file and hot-swap the compiled set on change.
    /// Trackers are untouched; matches in flight keep the old set.
    fn spawn_signature_reload(&self) -> Option<JoinHandle<()>> {
        if !self.config.signatures.hot_reload {
            return None;
        }
        let path: PathBuf = self.config.signatures.file_path.clone()?;
        let matcher = self.matcher.clone();
        let cancel = self.cancel.child_token();

        Some(tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut watcher = match notify::recommended_watcher(move |res| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            }) {
                Ok(w) => w,
                Err(e) => {
                    error!("Failed to create signature file watcher: {}", e);
                    return;
                }
            };

            if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                error!("Failed to watch signature file {:?}: {}", path, e);
                return;
            }
            info!("Watching signature file {:?} for changes", path);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        if !matches!(
                            event.kind,
                            notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                        ) {
                            continue;
                        }
                        match load_signature_file(&path) {
                            Ok(raw) => matcher.swap(SignatureSet::compile(raw)),
                            Err(e) => warn!("Signature reload failed, keeping current set: {}", e),
                        }
                    }
                }
            }
        }))
    }
}

fn build_matcher(config: &Config) -> Result<SignatureMatcher> {
    match config.signatures.file_path {
        Some(ref path) => {
            let raw = load_signature_file(path)
                .with_context(|| format!("Failed to load signature file {:?}", path))?;
            let set = SignatureSet::compile(raw);
            info!("Loaded {} signatures from {:?}", set.len(), path);
            Ok(SignatureMatcher::new(set))
        }
        None => {
            info!("No signature file configured; using built-in signatures");
            Ok(SignatureMatcher::with_defaults())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_noise_patterns;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.daemon.instance_id = Some("test-instance".to_string());
        config.daemon.hostname = Some("testhost".to_string());
        config.daemon.shutdown_timeout_ms = 1000;
        config.trackers.process.prefer_kernel_backend = false;
        config.trackers.process.scan_interval_ms = 50;
        config.trackers.network.enabled = false;
        config.trackers.file.enabled = false;
        config.trackers.file.noise_patterns = default_noise_patterns();
        config.storage.enabled = false;
        config.storage.data_directory = dir.join("data");
        config
    }

    #[tokio::test]
    async fn daemon_starts_observes_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(Daemon::new(test_config(dir.path())).await.unwrap());

        let mut subscriber = daemon.subscribe();

        let run_daemon = daemon.clone();
        let run_handle = tokio::spawn(async move { run_daemon.run().await });

        // The polling backend must discover this test process and the tree
        // manager must commit it.
        let event = tokio::time::timeout(Duration::from_secs(10), subscriber.recv())
            .await
            .expect("no event before timeout");
        assert!(event.is_some());

        let status = daemon.get_status().await;
        assert_eq!(status.instance_id, "test-instance");
        assert!(!status.trackers.is_empty());
        assert!(status.tree.total_incarnations > 0);

        daemon.shutdown().await;
        run_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reload_without_configured_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(test_config(dir.path())).await.unwrap();
        assert!(daemon.reload_signatures().is_err());
        daemon.shutdown().await;
    }
}
