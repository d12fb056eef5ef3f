use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use notify::{RecursiveMode, Watcher};
use notify::event::{EventKind, ModifyKind, RenameMode};

use crate::config::FileTrackerConfig;
use crate::events::{BackendMode, FileOpRecord, FileOperation, TrackerDiff, UNKNOWN_PID};

use super::backend::BackendError;
use super::manager::{KnownPids, PeriodicTracker, TrackerShared, TrackerStatus};

/// Glob deny-list applied before any file-op record is constructed.
///
/// Invalid patterns are skipped with a warning; the remaining patterns
/// still load.
pub struct NoiseFilter {
    patterns: Vec<glob::Pattern>,
}

impl NoiseFilter {
    pub fn new(patterns: &[String]) -> Self {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            match glob::Pattern::new(raw) {
                Ok(pattern) => compiled.push(pattern),
                Err(e) => warn!("Skipping invalid noise pattern `{}`: {}", raw, e),
            }
        }
        Self { patterns: compiled }
    }

    pub fn is_noise(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }
}

/// Map a filesystem watcher event into records, dropping noise before
/// construction. Watcher events carry no pid, so records land in the
/// unknown-process bucket.
fn records_from_fs_event(
    noise: &NoiseFilter,
    kind: &EventKind,
    paths: &[PathBuf],
) -> Vec<FileOpRecord> {
    let mut records = Vec::new();

    match kind {
        EventKind::Modify(ModifyKind::Name(mode)) => {
            let from = paths.first().map(|p| p.display().to_string());
            let Some(from) = from else {
                return records;
            };
            if noise.is_noise(&from) {
                return records;
            }
            let mut record = FileOpRecord::new(UNKNOWN_PID, FileOperation::Rename, from);
            if matches!(mode, RenameMode::Both) {
                record.new_path = paths.get(1).map(|p| p.display().to_string());
            }
            records.push(record);
        }
        kind => {
            let operation = match kind {
                EventKind::Create(_) => FileOperation::Create,
                EventKind::Remove(_) => FileOperation::Delete,
                EventKind::Access(_) => FileOperation::Read,
                _ => FileOperation::Write,
            };
            for path in paths {
                let path_str = path.display().to_string();
                if noise.is_noise(&path_str) {
                    continue;
                }
                records.push(FileOpRecord::new(UNKNOWN_PID, operation, path_str));
            }
        }
    }

    records
}

/// One open file descriptor, keyed for cycle-to-cycle diffing.
type FdKey = (u32, i32, String);

pub struct FileTracker {
    config: FileTrackerConfig,
    shared: TrackerShared,
    known_pids: KnownPids,
    noise: Arc<NoiseFilter>,
    open_fds: Arc<RwLock<HashSet<FdKey>>>,
    fs_events_tx: mpsc::UnboundedSender<notify::Event>,
    fs_events_rx: Arc<Mutex<mpsc::UnboundedReceiver<notify::Event>>>,
}

impl FileTracker {
    pub fn new(
        config: FileTrackerConfig,
        shared: TrackerShared,
        known_pids: KnownPids,
    ) -> Result<Self> {
        let noise = Arc::new(NoiseFilter::new(&config.noise_patterns));
        let (fs_events_tx, fs_events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            shared,
            known_pids,
            noise,
            open_fds: Arc::new(RwLock::new(HashSet::new())),
            fs_events_tx,
            fs_events_rx: Arc::new(Mutex::new(fs_events_rx)),
        })
    }

    pub fn start(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            // The watcher must outlive the loop; it is dropped on exit.
            let _watcher = tracker.start_watcher();
            tracker.run_periodic().await;
        })
    }

    /// Set up the filesystem watcher over the configured paths. Watcher
    /// failures are per-path warnings, not tracker failures.
    fn start_watcher(&self) -> Option<notify::RecommendedWatcher> {
        if self.config.watched_paths.is_empty() {
            return None;
        }

        let tx = self.fs_events_tx.clone();
        let mut watcher = match notify::recommended_watcher(move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                error!("Failed to create filesystem watcher: {}", e);
                return None;
            }
        };

        for path in &self.config.watched_paths {
            if path.exists() {
                if let Err(e) = watcher.watch(path, RecursiveMode::Recursive) {
                    warn!("Failed to watch path {}: {}", path.display(), e);
                } else {
                    debug!("Watching path: {}", path.display());
                }
            } else {
                warn!("Watched path does not exist: {}", path.display());
            }
        }

        Some(watcher)
    }

    pub async fn get_status(&self) -> TrackerStatus {
        TrackerStatus {
            name: self.name().to_string(),
            enabled: self.config.enabled,
            health: *self.shared.health.read().await,
            backend: Some(BackendMode::Polling),
            cycles_completed: *self.shared.cycles_completed.read().await,
            last_error: self.shared.last_error.read().await.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        "file_tracker"
    }

    /// Drain buffered watcher events into records.
    async fn drain_fs_events(&self) -> Vec<FileOpRecord> {
        let mut records = Vec::new();
        let mut rx = self.fs_events_rx.lock().await;
        while let Ok(event) = rx.try_recv() {
            records.extend(records_from_fs_event(&self.noise, &event.kind, &event.paths));
        }
        records
    }

    /// Scan open file descriptors of the known pids; newly opened fds
    /// become records, per-pid read failures are swallowed for the cycle.
    #[cfg(target_os = "linux")]
    async fn scan_fds(&self) -> Vec<FileOpRecord> {
        let known: Vec<u32> = {
            let known = self.known_pids.read().await;
            known.iter().copied().collect()
        };

        let mut records = Vec::new();
        let mut current: HashSet<FdKey> = HashSet::new();

        for pid in known {
            let process = match procfs::process::Process::new(pid as i32) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let fds = match process.fd() {
                Ok(fds) => fds,
                Err(_) => continue,
            };

            for fd in fds.flatten() {
                let procfs::process::FDTarget::Path(ref path) = fd.target else {
                    continue;
                };
                let path_str = path.display().to_string();
                if self.noise.is_noise(&path_str) {
                    continue;
                }

                current.insert((pid, fd.fd, path_str));
            }
        }

        {
            let mut open_fds = self.open_fds.write().await;
            for key in &current {
                if !open_fds.contains(key) {
                    let (pid, fd, path) = key;
                    let operation = fd_access_mode(*pid, *fd);
                    records.push(FileOpRecord::new(*pid, operation, path.clone()));
                }
            }
            *open_fds = current;
        }

        records
    }

    #[cfg(not(target_os = "linux"))]
    async fn scan_fds(&self) -> Vec<FileOpRecord> {
        Vec::new()
    }
}

/// Determine the open mode from /proc fdinfo flags; falls back to Open
/// when the fd vanished or the flags are unreadable.
#[cfg(target_os = "linux")]
fn fd_access_mode(pid: u32, fd: i32) -> FileOperation {
    let fdinfo_path = format!("/proc/{}/fdinfo/{}", pid, fd);
    if let Ok(content) = std::fs::read_to_string(&fdinfo_path) {
        for line in content.lines() {
            if let Some(flags_str) = line.strip_prefix("flags:") {
                if let Ok(flags) = u32::from_str_radix(flags_str.trim(), 8) {
                    return match flags & 0o3 {
                        0 => FileOperation::Read,
                        _ => FileOperation::Write,
                    };
                }
            }
        }
    }
    FileOperation::Open
}

#[async_trait::async_trait]
impl PeriodicTracker for FileTracker {
    async fn cycle(&self) -> Result<Vec<TrackerDiff>, BackendError> {
        let mut records = self.drain_fs_events().await;
        records.extend(self.scan_fds().await);

        if records.is_empty() {
            Ok(vec![])
        } else {
            Ok(vec![TrackerDiff::FileOps(records)])
        }
    }

    fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.config.scan_interval_ms)
    }

    fn shared(&self) -> &TrackerShared {
        &self.shared
    }

    fn name(&self) -> &'static str {
        "file_tracker"
    }
}

impl Clone for FileTracker {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            shared: self.shared.clone(),
            known_pids: self.known_pids.clone(),
            noise: self.noise.clone(),
            open_fds: self.open_fds.clone(),
            fs_events_tx: self.fs_events_tx.clone(),
            fs_events_rx: self.fs_events_rx.clone(),
        }
    }
}

/// Coarse classification of a touched path, for consumers summarizing what
/// an agent is editing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    SourceCode,
    Config,
    Documentation,
    LockFile,
    BuildArtifact,
    Other,
}

pub fn classify_path(path: &str) -> FileCategory {
    const SOURCE_EXTS: &[&str] = &[
        ".rs", ".py", ".js", ".ts", ".go", ".java", ".c", ".cpp", ".h",
    ];
    const CONFIG_EXTS: &[&str] = &[".json", ".yaml", ".yml", ".toml", ".ini", ".env"];
    const DOC_EXTS: &[&str] = &[".md", ".txt", ".rst"];

    if SOURCE_EXTS.iter().any(|ext| path.ends_with(ext)) {
        FileCategory::SourceCode
    } else if CONFIG_EXTS.iter().any(|ext| path.ends_with(ext)) {
        FileCategory::Config
    } else if DOC_EXTS.iter().any(|ext| path.ends_with(ext)) {
        FileCategory::Documentation
    } else if path.ends_with(".lock")
        || path.contains("package-lock")
        || path.contains("Cargo.lock")
    {
        FileCategory::LockFile
    } else if path.contains("node_modules/")
        || path.contains("target/")
        || path.contains("__pycache__/")
    {
        FileCategory::BuildArtifact
    } else {
        FileCategory::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;

    fn noise(patterns: &[&str]) -> NoiseFilter {
        NoiseFilter::new(&patterns.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn noise_pattern_suppresses_record_entirely() {
        let filter = noise(&["*.tmp"]);
        let records = records_from_fs_event(
            &filter,
            &EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            &[PathBuf::from("/tmp/build-123.tmp")],
        );
        assert!(records.is_empty());
    }

    #[test]
    fn non_noise_paths_become_records() {
        let filter = noise(&["*.tmp"]);
        let records = records_from_fs_event(
            &filter,
            &EventKind::Create(CreateKind::File),
            &[PathBuf::from("/home/user/src/main.rs")],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, FileOperation::Create);
        assert_eq!(records[0].pid, UNKNOWN_PID);
        assert!(records[0].incarnation_id.is_none());
    }

    #[test]
    fn rename_carries_both_paths() {
        let filter = noise(&[]);
        let records = records_from_fs_event(
            &filter,
            &EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[
                PathBuf::from("/work/a.rs"),
                PathBuf::from("/work/b.rs"),
            ],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, FileOperation::Rename);
        assert_eq!(records[0].path, "/work/a.rs");
        assert_eq!(records[0].new_path.as_deref(), Some("/work/b.rs"));
    }

    #[test]
    fn directory_globs_match_nested_paths() {
        let filter = noise(&["**/node_modules/**", "/proc/**"]);
        assert!(filter.is_noise("/home/u/app/node_modules/react/index.js"));
        assert!(filter.is_noise("/proc/123/stat"));
        assert!(!filter.is_noise("/home/u/app/src/index.js"));
    }

    #[test]
    fn invalid_noise_pattern_is_skipped() {
        let filter = noise(&["[invalid", "*.tmp"]);
        // The invalid pattern is dropped; the valid one still applies.
        assert!(filter.is_noise("/x/y.tmp"));
        assert!(!filter.is_noise("/x/y.rs"));
    }

    #[test]
    fn path_classification() {
        assert_eq!(classify_path("/a/b/main.rs"), FileCategory::SourceCode);
        assert_eq!(classify_path("/a/b/config.yaml"), FileCategory::Config);
        assert_eq!(classify_path("/a/b/README.md"), FileCategory::Documentation);
        assert_eq!(classify_path("/a/b/Cargo.lock"), FileCategory::LockFile);
        assert_eq!(
            classify_path("/a/node_modules/x/y.map"),
            FileCategory::BuildArtifact
        );
        assert_eq!(classify_path("/a/b/photo.png"), FileCategory::Other);
    }
}
