use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Opaque identifier for one continuous lifetime of an OS process.
///
/// Two incarnations may share a pid (the OS reuses them) but never an
/// incarnation id.
pub type IncarnationId = Uuid;

/// Pid used for connection/file records whose owning process is not known
/// to the process tracker (the synthetic "unknown process" bucket).
pub const UNKNOWN_PID: u32 = 0;

/// Which backend a tracker is currently running on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    KernelEvents,
    Polling,
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendMode::KernelEvents => write!(f, "kernel-events"),
            BackendMode::Polling => write!(f, "polling"),
        }
    }
}

/// Tracker health as surfaced through status queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackerHealth {
    Running,
    Degraded,
    Stopped,
}

/// One process as observed by a backend during a single cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    /// argv[0], or the executable name when argv is unavailable.
    pub command: String,
    pub args: Vec<String>,
    pub exe_path: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
    pub started_at: DateTime<Utc>,
}

impl ProcessSnapshot {
    pub fn new(pid: u32, name: String) -> Self {
        Self {
            pid,
            parent_pid: None,
            command: name.clone(),
            name,
            args: Vec::new(),
            exe_path: None,
            working_dir: None,
            user: None,
            cpu_percent: None,
            memory_bytes: None,
            started_at: Utc::now(),
        }
    }

    /// Full command line as a single string, for signature matching.
    pub fn cmdline(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Exit information, populated when the backend can observe it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Decode a raw wait status as reported by the kernel exit event.
    pub fn from_wait_status(status: i32) -> Self {
        let sig = status & 0x7f;
        if sig != 0 {
            Self {
                code: None,
                signal: Some(sig),
            }
        } else {
            Self {
                code: Some(status >> 8),
                signal: None,
            }
        }
    }
}

/// Full view of the process table produced by a backend for one cycle.
///
/// Pids whose enrichment read failed mid-cycle land in `failed_reads`
/// instead of being silently dropped; the tracker carries their previous
/// entry forward rather than reporting a premature exit.
#[derive(Debug, Clone, Default)]
pub struct ProcessScan {
    pub processes: HashMap<u32, ProcessSnapshot>,
    pub failed_reads: HashSet<u32>,
    /// Exit info per pid, when the backend observes exits directly.
    pub exits: HashMap<u32, ExitInfo>,
}

/// Diff between two consecutive process scans.
#[derive(Debug, Clone, Default)]
pub struct ProcessDiff {
    pub spawned: Vec<ProcessSnapshot>,
    pub updated: Vec<ProcessSnapshot>,
    pub exited: Vec<(u32, ExitInfo)>,
}

impl ProcessDiff {
    pub fn is_empty(&self) -> bool {
        self.spawned.is_empty() && self.updated.is_empty() && self.exited.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Unix,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Established,
    Closed,
}

impl ConnectionState {
    /// Ordering rank; per-connection transitions only move forward.
    pub fn rank(&self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Established => 1,
            ConnectionState::Closed => 2,
        }
    }
}

/// One observed network connection.
///
/// Produced by the network tracker; the tree manager resolves
/// `incarnation_id` on commit. Unix sockets carry a path in `local_addr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub incarnation_id: Option<IncarnationId>,
    pub pid: u32,
    pub protocol: Protocol,
    pub local_addr: Option<String>,
    pub local_port: Option<u16>,
    pub remote_addr: Option<String>,
    pub remote_port: Option<u16>,
    pub state: ConnectionState,
    pub observed_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(pid: u32, protocol: Protocol, state: ConnectionState) -> Self {
        Self {
            id: Uuid::new_v4(),
            incarnation_id: None,
            pid,
            protocol,
            local_addr: None,
            local_port: None,
            remote_addr: None,
            remote_port: None,
            state,
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Open,
    Read,
    Write,
    Create,
    Delete,
    Rename,
}

/// One observed file operation. Noise-filtered paths never become records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOpRecord {
    pub id: Uuid,
    pub incarnation_id: Option<IncarnationId>,
    pub pid: u32,
    pub operation: FileOperation,
    pub path: String,
    pub new_path: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FileOpRecord {
    pub fn new(pid: u32, operation: FileOperation, path: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            incarnation_id: None,
            pid,
            operation,
            path,
            new_path: None,
            timestamp: Utc::now(),
        }
    }
}

/// Typed diff flowing from a tracker to the tree manager.
#[derive(Debug, Clone)]
pub enum TrackerDiff {
    Process(ProcessDiff),
    Connections(Vec<ConnectionRecord>),
    FileOps(Vec<FileOpRecord>),
}

/// Lifecycle state of a tracked process incarnation.
///
/// `Starting` is set at spawn, `Running` on the first successful metrics
/// read; the three terminal states are final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Terminated
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// A node in the authoritative process tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessNode {
    pub incarnation_id: IncarnationId,
    pub pid: u32,
    pub parent_incarnation_id: Option<IncarnationId>,
    /// Reported parent pid, retained for display even when the parent
    /// incarnation could not be resolved.
    pub parent_pid: Option<u32>,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub exe_path: Option<String>,
    pub agent_type: Option<String>,
    pub is_agent_root: bool,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub working_dir: Option<String>,
    pub user: Option<String>,
}

impl ProcessNode {
    /// Build a fresh incarnation from a spawn observation.
    pub fn from_snapshot(snapshot: &ProcessSnapshot) -> Self {
        Self {
            incarnation_id: Uuid::new_v4(),
            pid: snapshot.pid,
            parent_incarnation_id: None,
            parent_pid: snapshot.parent_pid,
            name: snapshot.name.clone(),
            command: snapshot.command.clone(),
            args: snapshot.args.clone(),
            exe_path: snapshot.exe_path.clone(),
            agent_type: None,
            is_agent_root: false,
            status: ProcessStatus::Starting,
            exit_code: None,
            started_at: snapshot.started_at,
            ended_at: None,
            cpu_percent: snapshot.cpu_percent.unwrap_or(0.0),
            memory_bytes: snapshot.memory_bytes.unwrap_or(0),
            working_dir: snapshot.working_dir.clone(),
            user: snapshot.user.clone(),
        }
    }

    pub fn cmdline(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Committed event fanned out through the hub.
///
/// For any single incarnation, events are published in causal order:
/// spawned, then updates, then exited. No cross-incarnation ordering is
/// guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ProcessSpawned {
        node: ProcessNode,
    },
    ProcessUpdated {
        node: ProcessNode,
    },
    ProcessExited {
        node: ProcessNode,
    },
    AttributionChanged {
        incarnation_id: IncarnationId,
        pid: u32,
        previous: Option<String>,
        current: Option<String>,
    },
    Connection(ConnectionRecord),
    FileOp(FileOpRecord),
}

impl EngineEvent {
    /// Incarnation the event belongs to, when it has one.
    pub fn incarnation_id(&self) -> Option<IncarnationId> {
        match self {
            EngineEvent::ProcessSpawned { node }
            | EngineEvent::ProcessUpdated { node }
            | EngineEvent::ProcessExited { node } => Some(node.incarnation_id),
            EngineEvent::AttributionChanged { incarnation_id, .. } => Some(*incarnation_id),
            EngineEvent::Connection(c) => c.incarnation_id,
            EngineEvent::FileOp(f) => f.incarnation_id,
        }
    }
}
