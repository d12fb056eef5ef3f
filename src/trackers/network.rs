use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::NetworkTrackerConfig;
use crate::events::{
    BackendMode, ConnectionRecord, ConnectionState, Protocol, TrackerDiff, UNKNOWN_PID,
};

use super::backend::BackendError;
use super::manager::{KnownPids, PeriodicTracker, TrackerShared, TrackerStatus};

/// Stable identity of one socket across cycles.
type ConnKey = (Protocol, u32, String, String);

/// Per-connection tracking state; `state` only ever moves forward.
#[derive(Debug, Clone)]
struct ConnTrack {
    id: Uuid,
    state: ConnectionState,
}

/// One socket as observed during a scan, before diffing.
#[derive(Debug, Clone)]
pub(crate) struct ObservedConn {
    pub pid: u32,
    pub protocol: Protocol,
    pub local_addr: Option<String>,
    pub local_port: Option<u16>,
    pub remote_addr: Option<String>,
    pub remote_port: Option<u16>,
    pub state: ConnectionState,
}

impl ObservedConn {
    fn key(&self) -> ConnKey {
        let local = match (&self.local_addr, self.local_port) {
            (Some(addr), Some(port)) => format!("{}:{}", addr, port),
            (Some(addr), None) => addr.clone(),
            _ => String::new(),
        };
        let remote = match (&self.remote_addr, self.remote_port) {
            (Some(addr), Some(port)) => format!("{}:{}", addr, port),
            (Some(addr), None) => addr.clone(),
            _ => String::new(),
        };
        (self.protocol, self.pid, local, remote)
    }

    fn into_record(self, id: Uuid, state: ConnectionState) -> ConnectionRecord {
        let mut record = ConnectionRecord::new(self.pid, self.protocol, state);
        record.id = id;
        record.local_addr = self.local_addr;
        record.local_port = self.local_port;
        record.remote_addr = self.remote_addr;
        record.remote_port = self.remote_port;
        record
    }
}

pub struct NetworkTracker {
    config: NetworkTrackerConfig,
    shared: TrackerShared,
    known_pids: KnownPids,
    tracked: Arc<RwLock<HashMap<ConnKey, ConnTrack>>>,
}

impl NetworkTracker {
    pub fn new(config: NetworkTrackerConfig, shared: TrackerShared, known_pids: KnownPids) -> Self {
        Self {
            config,
            shared,
            known_pids,
            tracked: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker.run_periodic().await;
        })
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
        "network_tracker"
    }

    /// Apply one scan's observations against the tracked set.
    ///
    /// Emits a record per forward state transition and a single Closed for
    /// each tracked connection that disappeared. A connection first seen
    /// already closed is never emitted, so no subscriber can observe a
    /// Closed for an id it never saw open.
    fn diff_observations(
        tracked: &mut HashMap<ConnKey, ConnTrack>,
        observed: Vec<ObservedConn>,
    ) -> Vec<ConnectionRecord> {
        let mut records = Vec::new();
        let mut seen: HashSet<ConnKey> = HashSet::with_capacity(observed.len());

        for conn in observed {
            let key = conn.key();
            if !seen.insert(key.clone()) {
                continue;
            }

            match tracked.get_mut(&key) {
                None => {
                    if conn.state == ConnectionState::Closed {
                        // Never opened from our point of view; skip.
                        continue;
                    }
                    let track = ConnTrack {
                        id: Uuid::new_v4(),
                        state: conn.state,
                    };
                    records.push(conn.clone().into_record(track.id, track.state));
                    tracked.insert(key, track);
                }
                Some(track) => {
                    // State may only progress; regressions are stale reads.
                    if conn.state.rank() > track.state.rank() {
                        track.state = conn.state;
                        records.push(conn.clone().into_record(track.id, track.state));
                    }
                }
            }
        }

        // Anything tracked but no longer observed has closed.
        let gone: Vec<ConnKey> = tracked
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();

        for key in gone {
            if let Some(track) = tracked.remove(&key) {
                if track.state != ConnectionState::Closed {
                    let (protocol, pid, local, remote) = key;
                    let mut record = ConnectionRecord::new(pid, protocol, ConnectionState::Closed);
                    record.id = track.id;
                    let (local_addr, local_port) = split_endpoint(&local);
                    let (remote_addr, remote_port) = split_endpoint(&remote);
                    record.local_addr = local_addr;
                    record.local_port = local_port;
                    record.remote_addr = remote_addr;
                    record.remote_port = remote_port;
                    records.push(record);
                }
            }
        }

        // Fully closed connections do not need tracking anymore.
        tracked.retain(|_, track| track.state != ConnectionState::Closed);

        records
    }
}

fn split_endpoint(endpoint: &str) -> (Option<String>, Option<u16>) {
    if endpoint.is_empty() {
        return (None, None);
    }
    match endpoint.rsplit_once(':') {
        Some((addr, port)) => match port.parse::<u16>() {
            Ok(port) => (Some(addr.to_string()), Some(port)),
            Err(_) => (Some(endpoint.to_string()), None),
        },
        None => (Some(endpoint.to_string()), None),
    }
}

#[async_trait::async_trait]
impl PeriodicTracker for NetworkTracker {
    async fn cycle(&self) -> Result<Vec<TrackerDiff>, BackendError> {
        let known: Vec<u32> = {
            let known = self.known_pids.read().await;
            known.iter().copied().collect()
        };

        let observed = scan_sockets(&known)?;

        let records = {
            let mut tracked = self.tracked.write().await;
            Self::diff_observations(&mut tracked, observed)
        };

        if records.is_empty() {
            Ok(vec![])
        } else {
            Ok(vec![TrackerDiff::Connections(records)])
        }
    }

    fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.config.scan_interval_ms)
    }

    fn shared(&self) -> &TrackerShared {
        &self.shared
    }

    fn name(&self) -> &'static str {
        "network_tracker"
    }
}

impl Clone for NetworkTracker {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            shared: self.shared.clone(),
            known_pids: self.known_pids.clone(),
            tracked: self.tracked.clone(),
        }
    }
}

/// Read the kernel socket tables, scoped to the known pids.
///
/// Sockets whose inode maps to no known pid go to the unknown-process
/// bucket rather than being dropped. Per-pid fd read failures (process
/// vanished, permission) are swallowed for that pid only.
#[cfg(target_os = "linux")]
fn scan_sockets(known_pids: &[u32]) -> Result<Vec<ObservedConn>, BackendError> {
    use procfs::net::TcpState;

    let mut inode_to_pid: HashMap<u64, u32> = HashMap::new();
    for &pid in known_pids {
        let process = match procfs::process::Process::new(pid as i32) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let fds = match process.fd() {
            Ok(fds) => fds,
            Err(_) => continue,
        };
        for fd in fds.flatten() {
            if let procfs::process::FDTarget::Socket(inode) = fd.target {
                inode_to_pid.insert(inode, pid);
            }
        }
    }

    let map_tcp_state = |state: &TcpState| match state {
        TcpState::SynSent | TcpState::SynRecv => Some(ConnectionState::Connecting),
        TcpState::Established => Some(ConnectionState::Established),
        TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::TimeWait
        | TcpState::Close
        | TcpState::CloseWait
        | TcpState::LastAck
        | TcpState::Closing => Some(ConnectionState::Closed),
        // Listening sockets are not connections.
        _ => None,
    };

    let mut observed = Vec::new();

    let tcp_entries = procfs::net::tcp()
        .map_err(|e| BackendError::CapabilityUnavailable(format!("/proc/net/tcp: {}", e)))?;
    let tcp6_entries = procfs::net::tcp6().unwrap_or_default();
    for entry in tcp_entries.into_iter().chain(tcp6_entries) {
        let Some(state) = map_tcp_state(&entry.state) else {
            continue;
        };
        let pid = inode_to_pid.get(&entry.inode).copied().unwrap_or(UNKNOWN_PID);
        observed.push(ObservedConn {
            pid,
            protocol: Protocol::Tcp,
            local_addr: Some(entry.local_address.ip().to_string()),
            local_port: Some(entry.local_address.port()),
            remote_addr: Some(entry.remote_address.ip().to_string()),
            remote_port: Some(entry.remote_address.port()),
            state,
        });
    }

    let udp_entries = procfs::net::udp().unwrap_or_default();
    let udp6_entries = procfs::net::udp6().unwrap_or_default();
    for entry in udp_entries.into_iter().chain(udp6_entries) {
        // Unconnected UDP sockets have a zero remote; skip them.
        if entry.remote_address.ip().is_unspecified() {
            continue;
        }
        let pid = inode_to_pid.get(&entry.inode).copied().unwrap_or(UNKNOWN_PID);
        observed.push(ObservedConn {
            pid,
            protocol: Protocol::Udp,
            local_addr: Some(entry.local_address.ip().to_string()),
            local_port: Some(entry.local_address.port()),
            remote_addr: Some(entry.remote_address.ip().to_string()),
            remote_port: Some(entry.remote_address.port()),
            state: ConnectionState::Established,
        });
    }

    if let Ok(unix_entries) = procfs::net::unix() {
        for entry in unix_entries {
            // Unix sockets are only attributable through the inode map;
            // system-wide ones without a known owner are pure noise.
            let Some(&pid) = inode_to_pid.get(&entry.inode) else {
                continue;
            };
            let path = entry
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| format!("unix:[{}]", entry.inode));
            observed.push(ObservedConn {
                pid,
                protocol: Protocol::Unix,
                local_addr: Some(path),
                local_port: None,
                remote_addr: None,
                remote_port: None,
                state: ConnectionState::Established,
            });
        }
    }

    Ok(observed)
}

#[cfg(not(target_os = "linux"))]
fn scan_sockets(_known_pids: &[u32]) -> Result<Vec<ObservedConn>, BackendError> {
    Err(BackendError::CapabilityUnavailable(
        "socket table scanning requires /proc/net".to_string(),
    ))
}

/// Rough classification of a remote endpoint, for consumers that want to
/// bucket agent traffic without resolving anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    LlmApi,
    PackageRegistry,
    Telemetry,
    Localhost,
    Unknown,
}

pub fn classify_endpoint(remote_addr: &str) -> EndpointClass {
    if remote_addr.contains("api.anthropic.com")
        || remote_addr.contains("api.openai.com")
        || remote_addr.contains("api.cursor.sh")
        || remote_addr.contains("generativelanguage.googleapis.com")
    {
        EndpointClass::LlmApi
    } else if remote_addr.contains("npmjs.org")
        || remote_addr.contains("pypi.org")
        || remote_addr.contains("crates.io")
    {
        EndpointClass::PackageRegistry
    } else if remote_addr.contains("sentry.io") || remote_addr.contains("statsig") {
        EndpointClass::Telemetry
    } else if remote_addr.starts_with("127.")
        || remote_addr.starts_with("localhost")
        || remote_addr == "::1"
    {
        EndpointClass::Localhost
    } else {
        EndpointClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(pid: u32, remote_port: u16, state: ConnectionState) -> ObservedConn {
        ObservedConn {
            pid,
            protocol: Protocol::Tcp,
            local_addr: Some("10.0.0.5".to_string()),
            local_port: Some(50000),
            remote_addr: Some("140.82.1.1".to_string()),
            remote_port: Some(remote_port),
            state,
        }
    }

    #[test]
    fn new_connection_is_emitted_once() {
        let mut tracked = HashMap::new();
        let records = NetworkTracker::diff_observations(
            &mut tracked,
            vec![observed(100, 443, ConnectionState::Established)],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, ConnectionState::Established);

        // Same observation again: no new event.
        let records = NetworkTracker::diff_observations(
            &mut tracked,
            vec![observed(100, 443, ConnectionState::Established)],
        );
        assert!(records.is_empty());
    }

    #[test]
    fn state_progresses_forward_with_stable_id() {
        let mut tracked = HashMap::new();
        let first = NetworkTracker::diff_observations(
            &mut tracked,
            vec![observed(100, 443, ConnectionState::Connecting)],
        );
        let second = NetworkTracker::diff_observations(
            &mut tracked,
            vec![observed(100, 443, ConnectionState::Established)],
        );
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].state, ConnectionState::Established);
    }

    #[test]
    fn state_never_regresses() {
        let mut tracked = HashMap::new();
        NetworkTracker::diff_observations(
            &mut tracked,
            vec![observed(100, 443, ConnectionState::Established)],
        );
        let records = NetworkTracker::diff_observations(
            &mut tracked,
            vec![observed(100, 443, ConnectionState::Connecting)],
        );
        assert!(records.is_empty());
    }

    #[test]
    fn disappearance_emits_closed_exactly_once() {
        let mut tracked = HashMap::new();
        let opened = NetworkTracker::diff_observations(
            &mut tracked,
            vec![observed(100, 443, ConnectionState::Established)],
        );
        let closed = NetworkTracker::diff_observations(&mut tracked, vec![]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].state, ConnectionState::Closed);
        assert_eq!(closed[0].id, opened[0].id);

        // Gone for good; nothing more to report.
        let after = NetworkTracker::diff_observations(&mut tracked, vec![]);
        assert!(after.is_empty());
    }

    #[test]
    fn never_closed_for_an_unseen_connection() {
        let mut tracked = HashMap::new();
        // First observation is already closed: no events at all.
        let records = NetworkTracker::diff_observations(
            &mut tracked,
            vec![observed(100, 443, ConnectionState::Closed)],
        );
        assert!(records.is_empty());
        assert!(tracked.is_empty());
    }

    #[test]
    fn unknown_pid_goes_to_bucket_not_dropped() {
        let mut tracked = HashMap::new();
        let records = NetworkTracker::diff_observations(
            &mut tracked,
            vec![observed(UNKNOWN_PID, 443, ConnectionState::Established)],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, UNKNOWN_PID);
    }

    #[test]
    fn endpoint_classification() {
        assert_eq!(classify_endpoint("api.anthropic.com:443"), EndpointClass::LlmApi);
        assert_eq!(classify_endpoint("registry.npmjs.org"), EndpointClass::PackageRegistry);
        assert_eq!(classify_endpoint("127.0.0.1:8080"), EndpointClass::Localhost);
        assert_eq!(classify_endpoint("203.0.113.9:443"), EndpointClass::Unknown);
    }

    #[test]
    fn split_endpoint_roundtrip() {
        assert_eq!(
            split_endpoint("10.0.0.5:443"),
            (Some("10.0.0.5".to_string()), Some(443))
        );
        assert_eq!(split_endpoint(""), (None, None));
        assert_eq!(
            split_endpoint("/run/agent.sock"),
            (Some("/run/agent.sock".to_string()), None)
        );
    }
}
