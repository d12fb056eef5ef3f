use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{
    ConnectionRecord, ConnectionState, EngineEvent, ExitInfo, FileOpRecord, IncarnationId,
    ProcessDiff, ProcessNode, ProcessSnapshot, ProcessStatus, TrackerDiff, UNKNOWN_PID,
};
use crate::hub::EventHub;
use crate::signatures::SignatureMatcher;

/// Bounded in-memory windows for query reads. Exited process nodes are
/// retained without bound for the daemon's lifetime; pruning them is a
/// storage-retention concern, not ours.
const FILE_OP_HISTORY: usize = 10_000;
const CLOSED_CONNECTION_HISTORY: usize = 4_096;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeStats {
    pub total_incarnations: usize,
    pub live_processes: usize,
    pub agent_processes: usize,
    pub connections: usize,
    pub file_ops_retained: usize,
}

/// The authoritative process/connection/file state.
///
/// All mutation funnels through the tree manager task; readers copy out
/// under the read lock.
#[derive(Default)]
pub struct TreeState {
    nodes: HashMap<IncarnationId, ProcessNode>,
    /// Live incarnation currently holding each pid. A lookup cache only;
    /// `nodes` is the source of truth.
    pid_index: HashMap<u32, IncarnationId>,
    connections: HashMap<Uuid, ConnectionRecord>,
    closed_connection_order: VecDeque<Uuid>,
    file_ops: VecDeque<FileOpRecord>,
}

impl TreeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &IncarnationId) -> Option<&ProcessNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ProcessNode> {
        self.nodes.values()
    }

    /// Live incarnation for a pid, if any.
    pub fn live_by_pid(&self, pid: u32) -> Option<&ProcessNode> {
        self.pid_index.get(&pid).and_then(|id| self.nodes.get(id))
    }

    pub fn connections(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.connections.values()
    }

    pub fn file_ops(&self) -> impl Iterator<Item = &FileOpRecord> {
        self.file_ops.iter()
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats {
            total_incarnations: self.nodes.len(),
            live_processes: self.pid_index.len(),
            agent_processes: self
                .nodes
                .values()
                .filter(|n| n.agent_type.is_some())
                .count(),
            connections: self.connections.len(),
            file_ops_retained: self.file_ops.len(),
        }
    }

    /// Children of an incarnation, exited or not.
    pub fn children_of(&self, id: &IncarnationId) -> Vec<&ProcessNode> {
        self.nodes
            .values()
            .filter(|n| n.parent_incarnation_id.as_ref() == Some(id))
            .collect()
    }

    fn apply_spawn(&mut self, snapshot: &ProcessSnapshot, matcher: &SignatureMatcher) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        // A spawn for a pid that is still indexed means we missed the old
        // incarnation's exit; close it out first so no two live
        // incarnations ever share a pid.
        if let Some(stale_id) = self.pid_index.get(&snapshot.pid).copied() {
            debug!("Missed exit for pid {}, retiring stale incarnation", snapshot.pid);
            if let Some(event) = self.finish_node(stale_id, ExitInfo::default()) {
                events.push(event);
            }
            self.pid_index.remove(&snapshot.pid);
        }

        let mut node = ProcessNode::from_snapshot(snapshot);

        // Lineage: only a currently live incarnation can be the parent.
        let parent_agent = snapshot.parent_pid.and_then(|ppid| {
            let parent_id = self.pid_index.get(&ppid).copied()?;
            node.parent_incarnation_id = Some(parent_id);
            self.nodes.get(&parent_id).and_then(|p| p.agent_type.clone())
        });

        if let Some(attribution) = matcher.resolve(
            &snapshot.name,
            &snapshot.cmdline(),
            snapshot.exe_path.as_deref(),
            parent_agent.as_deref(),
        ) {
            node.is_agent_root = attribution.direct;
            node.agent_type = Some(attribution.agent);
        }

        self.pid_index.insert(node.pid, node.incarnation_id);
        events.push(EngineEvent::ProcessSpawned { node: node.clone() });
        self.nodes.insert(node.incarnation_id, node);

        events
    }

    fn apply_update(&mut self, snapshot: &ProcessSnapshot, matcher: &SignatureMatcher) -> Vec<EngineEvent> {
        let Some(&id) = self.pid_index.get(&snapshot.pid) else {
            // Update for a pid we are not tracking live; stale, ignore.
            return Vec::new();
        };

        let mut events = Vec::new();
        let mut reattributed: Option<(Option<String>, Option<String>)> = None;

        {
            let Some(node) = self.nodes.get_mut(&id) else {
                return Vec::new();
            };
            if node.status.is_terminal() {
                return Vec::new();
            }

            // First successful metrics read moves the node out of Starting.
            if node.status == ProcessStatus::Starting {
                node.status = ProcessStatus::Running;
            }
            if let Some(cpu) = snapshot.cpu_percent {
                node.cpu_percent = cpu;
            }
            if let Some(memory) = snapshot.memory_bytes {
                node.memory_bytes = memory;
            }
            if snapshot.working_dir.is_some() {
                node.working_dir = snapshot.working_dir.clone();
            }

            // An exec replaces the command line; the attribution may change
            // with it.
            let exec_changed =
                node.command != snapshot.command || node.args != snapshot.args;
            if exec_changed {
                node.name = snapshot.name.clone();
                node.command = snapshot.command.clone();
                node.args = snapshot.args.clone();
                node.exe_path = snapshot.exe_path.clone();

                let parent_agent = node
                    .parent_incarnation_id
                    .and_then(|pid| self.nodes.get(&pid))
                    .and_then(|p| p.agent_type.clone());

                // Re-borrow after reading the parent.
                let node = self.nodes.get_mut(&id).expect("node disappeared");
                let resolved = matcher.resolve(
                    &node.name,
                    &node.cmdline(),
                    node.exe_path.as_deref(),
                    parent_agent.as_deref(),
                );
                let new_agent = resolved.as_ref().map(|a| a.agent.clone());
                if new_agent != node.agent_type {
                    let previous = node.agent_type.clone();
                    node.agent_type = new_agent.clone();
                    node.is_agent_root = resolved.map(|a| a.direct).unwrap_or(false);
                    reattributed = Some((previous, new_agent));
                }
            }
        }

        if let Some((previous, current)) = reattributed {
            let node = self.nodes.get(&id).expect("node disappeared");
            events.push(EngineEvent::AttributionChanged {
                incarnation_id: id,
                pid: node.pid,
                previous,
                current,
            });
            events.extend(self.propagate_attribution(id, matcher));
        }

        let node = self.nodes.get(&id).expect("node disappeared");
        events.push(EngineEvent::ProcessUpdated { node: node.clone() });
        events
    }

    /// Re-resolve inherited attribution below a node whose agent changed.
    /// Direct matches are never overridden.
    fn propagate_attribution(
        &mut self,
        root: IncarnationId,
        matcher: &SignatureMatcher,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let mut queue: VecDeque<IncarnationId> = VecDeque::new();
        queue.push_back(root);

        while let Some(parent_id) = queue.pop_front() {
            let parent_agent = self
                .nodes
                .get(&parent_id)
                .and_then(|n| n.agent_type.clone());

            let child_ids: Vec<IncarnationId> = self
                .nodes
                .values()
                .filter(|n| n.parent_incarnation_id == Some(parent_id))
                .map(|n| n.incarnation_id)
                .collect();

            for child_id in child_ids {
                let Some(child) = self.nodes.get(&child_id) else {
                    continue;
                };
                if child.is_agent_root {
                    // Its own match stands regardless of the parent.
                    continue;
                }

                let resolved = matcher.resolve(
                    &child.name,
                    &child.cmdline(),
                    child.exe_path.as_deref(),
                    parent_agent.as_deref(),
                );
                let new_agent = resolved.as_ref().map(|a| a.agent.clone());

                if new_agent != child.agent_type {
                    let child = self.nodes.get_mut(&child_id).expect("child disappeared");
                    let previous = child.agent_type.clone();
                    child.agent_type = new_agent.clone();
                    child.is_agent_root = resolved.map(|a| a.direct).unwrap_or(false);
                    events.push(EngineEvent::AttributionChanged {
                        incarnation_id: child_id,
                        pid: child.pid,
                        previous,
                        current: new_agent,
                    });
                    queue.push_back(child_id);
                }
            }
        }

        events
    }

    /// Transition an incarnation to its terminal state. Idempotent: a
    /// second exit for an already-terminal incarnation changes nothing and
    /// emits nothing.
    fn finish_node(&mut self, id: IncarnationId, info: ExitInfo) -> Option<EngineEvent> {
        let node = self.nodes.get_mut(&id)?;
        if node.status.is_terminal() {
            return None;
        }

        node.status = if info.signal.is_some() {
            ProcessStatus::Terminated
        } else {
            match info.code {
                Some(code) if code != 0 => ProcessStatus::Failed,
                // Exit code 0, or unknown when the backend cannot observe
                // codes: treated as a clean completion.
                _ => ProcessStatus::Completed,
            }
        };
        node.exit_code = info.code;
        node.ended_at = Some(Utc::now());

        Some(EngineEvent::ProcessExited { node: node.clone() })
    }

    fn apply_exit(&mut self, pid: u32, info: ExitInfo) -> Option<EngineEvent> {
        let id = self.pid_index.remove(&pid)?;
        self.finish_node(id, info)
    }

    /// Apply one process diff. Exits for pids that respawn within the same
    /// diff are applied first so a recycled pid never has two live
    /// incarnations; all other exits apply last, keeping the parent link
    /// intact for children spawned in the same cycle.
    pub fn apply_process_diff(
        &mut self,
        diff: &ProcessDiff,
        matcher: &SignatureMatcher,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        let respawned: HashSet<u32> = diff.spawned.iter().map(|s| s.pid).collect();

        for (pid, info) in diff.exited.iter().filter(|(pid, _)| respawned.contains(pid)) {
            events.extend(self.apply_exit(*pid, *info));
        }

        for snapshot in &diff.spawned {
            events.extend(self.apply_spawn(snapshot, matcher));
        }

        for snapshot in &diff.updated {
            events.extend(self.apply_update(snapshot, matcher));
        }

        for (pid, info) in diff.exited.iter().filter(|(pid, _)| !respawned.contains(pid)) {
            events.extend(self.apply_exit(*pid, *info));
        }

        events
    }

    /// Commit connection records, resolving the owning incarnation through
    /// the live-pid index. Unknown pids stay in the unknown bucket.
    pub fn apply_connections(&mut self, records: Vec<ConnectionRecord>) -> Vec<EngineEvent> {
        let mut events = Vec::with_capacity(records.len());

        for mut record in records {
            if record.pid != UNKNOWN_PID {
                record.incarnation_id = self.pid_index.get(&record.pid).copied();
            }

            if record.state == ConnectionState::Closed {
                self.closed_connection_order.push_back(record.id);
                while self.closed_connection_order.len() > CLOSED_CONNECTION_HISTORY {
                    if let Some(old) = self.closed_connection_order.pop_front() {
                        self.connections.remove(&old);
                    }
                }
            }

            self.connections.insert(record.id, record.clone());
            events.push(EngineEvent::Connection(record));
        }

        events
    }

    /// Commit file-op records; noise filtering already happened upstream.
    pub fn apply_file_ops(&mut self, records: Vec<FileOpRecord>) -> Vec<EngineEvent> {
        let mut events = Vec::with_capacity(records.len());

        for mut record in records {
            if record.pid != UNKNOWN_PID {
                record.incarnation_id = self.pid_index.get(&record.pid).copied();
            }

            self.file_ops.push_back(record.clone());
            while self.file_ops.len() > FILE_OP_HISTORY {
                self.file_ops.pop_front();
            }
            events.push(EngineEvent::FileOp(record));
        }

        events
    }
}

/// The single serialized consumer of all tracker diffs.
///
/// Holds the writer role briefly per diff, then publishes the committed
/// events outside the critical section.
pub struct TreeManager {
    state: Arc<RwLock<TreeState>>,
    matcher: Arc<SignatureMatcher>,
    hub: EventHub,
}

impl TreeManager {
    pub fn new(
        state: Arc<RwLock<TreeState>>,
        matcher: Arc<SignatureMatcher>,
        hub: EventHub,
    ) -> Self {
        Self {
            state,
            matcher,
            hub,
        }
    }

    /// Run the manager loop until the diff channel closes or cancellation.
    /// On cancellation, diffs already queued are still drained and
    /// committed so trackers' final cycles are not lost.
    pub fn spawn(
        self,
        mut diffs: mpsc::Receiver<TrackerDiff>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    diff = diffs.recv() => {
                        match diff {
                            Some(diff) => self.apply(diff).await,
                            None => break,
                        }
                    }
                }
            }

            while let Ok(diff) = diffs.try_recv() {
                self.apply(diff).await;
            }
            info!("Tree manager stopped");
        })
    }

    pub async fn apply(&self, diff: TrackerDiff) {
        let events = {
            let mut state = self.state.write().await;
            match diff {
                TrackerDiff::Process(diff) => state.apply_process_diff(&diff, &self.matcher),
                TrackerDiff::Connections(records) => state.apply_connections(records),
                TrackerDiff::FileOps(records) => state.apply_file_ops(records),
            }
        };

        for event in events {
            self.hub.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProcessSnapshot;
    use crate::signatures::SignatureMatcher;

    fn matcher() -> SignatureMatcher {
        SignatureMatcher::with_defaults()
    }

    fn snapshot(pid: u32, name: &str, parent: Option<u32>) -> ProcessSnapshot {
        let mut s = ProcessSnapshot::new(pid, name.to_string());
        s.parent_pid = parent;
        s
    }

    fn snapshot_with_args(pid: u32, name: &str, args: &[&str], parent: Option<u32>) -> ProcessSnapshot {
        let mut s = snapshot(pid, name, parent);
        s.args = args.iter().map(|a| a.to_string()).collect();
        s
    }

    fn spawn_diff(snapshots: Vec<ProcessSnapshot>) -> ProcessDiff {
        ProcessDiff {
            spawned: snapshots,
            ..Default::default()
        }
    }

    fn exit_diff(pid: u32, info: ExitInfo) -> ProcessDiff {
        ProcessDiff {
            exited: vec![(pid, info)],
            ..Default::default()
        }
    }

    #[test]
    fn agent_attribution_flows_to_child() {
        let m = matcher();
        let mut state = TreeState::new();

        // claude --project x spawns node build.js
        state.apply_process_diff(
            &spawn_diff(vec![snapshot_with_args(100, "claude", &["--project", "x"], Some(1))]),
            &m,
        );
        state.apply_process_diff(
            &spawn_diff(vec![snapshot_with_args(101, "node", &["build.js"], Some(100))]),
            &m,
        );

        let parent = state.live_by_pid(100).unwrap();
        let child = state.live_by_pid(101).unwrap();
        assert_eq!(parent.agent_type.as_deref(), Some("claude-code"));
        assert_eq!(child.agent_type.as_deref(), Some("claude-code"));
        assert!(parent.is_agent_root);
        assert!(!child.is_agent_root);
        assert_eq!(
            child.parent_incarnation_id,
            Some(parent.incarnation_id)
        );
    }

    #[test]
    fn own_match_beats_inherited_attribution() {
        let m = matcher();
        let mut state = TreeState::new();

        state.apply_process_diff(
            &spawn_diff(vec![snapshot_with_args(100, "claude", &["--project", "x"], Some(1))]),
            &m,
        );
        state.apply_process_diff(
            &spawn_diff(vec![snapshot_with_args(101, "aider", &["--model", "x"], Some(100))]),
            &m,
        );

        let child = state.live_by_pid(101).unwrap();
        assert_eq!(child.agent_type.as_deref(), Some("aider"));
        assert!(child.is_agent_root);
    }

    #[test]
    fn pid_reuse_mints_distinct_incarnations() {
        let m = matcher();
        let mut state = TreeState::new();

        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "claude", Some(1))]), &m);
        let first_id = state.live_by_pid(100).unwrap().incarnation_id;

        // The agent's child, then the parent exits.
        state.apply_process_diff(&spawn_diff(vec![snapshot(101, "node", Some(100))]), &m);
        state.apply_process_diff(&exit_diff(100, ExitInfo { code: Some(0), signal: None }), &m);

        // The OS hands pid 100 to an unrelated process.
        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "sleep", Some(1))]), &m);
        let second = state.live_by_pid(100).unwrap();

        assert_ne!(second.incarnation_id, first_id);
        assert_eq!(second.pid, 100);
        assert!(second.agent_type.is_none());

        // The old incarnation is retained, terminal, and still the parent
        // of its child.
        let old = state.node(&first_id).unwrap();
        assert_eq!(old.status, ProcessStatus::Completed);
        let child = state.live_by_pid(101).unwrap();
        assert_eq!(child.parent_incarnation_id, Some(first_id));
        // No link from the new incarnation to the old one's children.
        assert!(state.children_of(&second.incarnation_id).is_empty());
    }

    #[test]
    fn duplicate_exit_is_idempotent() {
        let m = matcher();
        let mut state = TreeState::new();

        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "claude", Some(1))]), &m);
        let id = state.live_by_pid(100).unwrap().incarnation_id;

        let first = state.apply_process_diff(
            &exit_diff(100, ExitInfo { code: Some(2), signal: None }),
            &m,
        );
        assert!(first
            .iter()
            .any(|e| matches!(e, EngineEvent::ProcessExited { .. })));

        let node = state.node(&id).unwrap();
        assert_eq!(node.status, ProcessStatus::Failed);
        assert_eq!(node.exit_code, Some(2));
        let ended = node.ended_at;

        // Delivering the same exit again must change nothing and emit
        // nothing.
        let second = state.apply_process_diff(
            &exit_diff(100, ExitInfo { code: Some(0), signal: None }),
            &m,
        );
        assert!(second.is_empty());
        let node = state.node(&id).unwrap();
        assert_eq!(node.status, ProcessStatus::Failed);
        assert_eq!(node.exit_code, Some(2));
        assert_eq!(node.ended_at, ended);
    }

    #[test]
    fn status_walks_the_state_machine() {
        let m = matcher();
        let mut state = TreeState::new();

        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "claude", Some(1))]), &m);
        assert_eq!(state.live_by_pid(100).unwrap().status, ProcessStatus::Starting);

        let update = ProcessDiff {
            updated: vec![{
                let mut s = snapshot(100, "claude", Some(1));
                s.cpu_percent = Some(3.5);
                s.memory_bytes = Some(64 << 20);
                s
            }],
            ..Default::default()
        };
        state.apply_process_diff(&update, &m);
        let node = state.live_by_pid(100).unwrap();
        assert_eq!(node.status, ProcessStatus::Running);
        assert_eq!(node.memory_bytes, 64 << 20);

        state.apply_process_diff(
            &exit_diff(100, ExitInfo { code: None, signal: Some(9) }),
            &m,
        );
        let id = state.nodes().find(|n| n.pid == 100).unwrap().incarnation_id;
        assert_eq!(state.node(&id).unwrap().status, ProcessStatus::Terminated);
    }

    #[test]
    fn orphan_spawn_becomes_root_but_keeps_parent_pid() {
        let m = matcher();
        let mut state = TreeState::new();

        // Parent pid 50 was never tracked.
        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "node", Some(50))]), &m);
        let node = state.live_by_pid(100).unwrap();
        assert!(node.parent_incarnation_id.is_none());
        assert_eq!(node.parent_pid, Some(50));
    }

    #[test]
    fn parent_exit_does_not_cascade() {
        let m = matcher();
        let mut state = TreeState::new();

        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "claude", Some(1))]), &m);
        state.apply_process_diff(&spawn_diff(vec![snapshot(101, "node", Some(100))]), &m);
        let parent_id = state.live_by_pid(100).unwrap().incarnation_id;

        state.apply_process_diff(&exit_diff(100, ExitInfo { code: Some(0), signal: None }), &m);

        let child = state.live_by_pid(101).unwrap();
        assert_eq!(child.status, ProcessStatus::Starting);
        assert_eq!(child.parent_incarnation_id, Some(parent_id));
    }

    #[test]
    fn same_diff_reuse_applies_exit_before_spawn() {
        let m = matcher();
        let mut state = TreeState::new();

        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "claude", Some(1))]), &m);
        let first_id = state.live_by_pid(100).unwrap().incarnation_id;

        // One diff carries both the old incarnation's exit and the reused
        // pid's spawn.
        let diff = ProcessDiff {
            spawned: vec![snapshot(100, "sleep", Some(1))],
            exited: vec![(100, ExitInfo { code: Some(0), signal: None })],
            ..Default::default()
        };
        state.apply_process_diff(&diff, &m);

        let second = state.live_by_pid(100).unwrap();
        assert_ne!(second.incarnation_id, first_id);
        assert_eq!(state.node(&first_id).unwrap().status, ProcessStatus::Completed);
    }

    #[test]
    fn exec_reattribution_propagates_to_inherited_descendants() {
        let m = matcher();
        let mut state = TreeState::new();

        // A plain shell spawns a worker; neither matches anything.
        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "wrapper", Some(1))]), &m);
        state.apply_process_diff(&spawn_diff(vec![snapshot(101, "node", Some(100))]), &m);
        assert!(state.live_by_pid(101).unwrap().agent_type.is_none());

        // The wrapper execs into claude.
        let update = ProcessDiff {
            updated: vec![snapshot_with_args(100, "claude", &["--project", "x"], Some(1))],
            ..Default::default()
        };
        let events = state.apply_process_diff(&update, &m);

        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::AttributionChanged { .. })));
        assert_eq!(
            state.live_by_pid(100).unwrap().agent_type.as_deref(),
            Some("claude-code")
        );
        assert_eq!(
            state.live_by_pid(101).unwrap().agent_type.as_deref(),
            Some("claude-code")
        );
    }

    #[test]
    fn connections_resolve_live_incarnations() {
        let m = matcher();
        let mut state = TreeState::new();

        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "claude", Some(1))]), &m);
        let id = state.live_by_pid(100).unwrap().incarnation_id;

        let known = ConnectionRecord::new(100, crate::events::Protocol::Tcp, ConnectionState::Established);
        let unknown = ConnectionRecord::new(UNKNOWN_PID, crate::events::Protocol::Tcp, ConnectionState::Established);
        let events = state.apply_connections(vec![known, unknown]);

        assert_eq!(events.len(), 2);
        let resolved: Vec<_> = state.connections().collect();
        assert!(resolved
            .iter()
            .any(|c| c.incarnation_id == Some(id) && c.pid == 100));
        assert!(resolved
            .iter()
            .any(|c| c.incarnation_id.is_none() && c.pid == UNKNOWN_PID));
    }

    #[test]
    fn file_op_history_is_bounded() {
        let m = matcher();
        let mut state = TreeState::new();
        state.apply_process_diff(&spawn_diff(vec![snapshot(100, "claude", Some(1))]), &m);

        for i in 0..(FILE_OP_HISTORY + 10) {
            state.apply_file_ops(vec![FileOpRecord::new(
                100,
                crate::events::FileOperation::Write,
                format!("/w/{}", i),
            )]);
        }
        assert_eq!(state.file_ops().count(), FILE_OP_HISTORY);
    }
}
