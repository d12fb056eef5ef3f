use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::events::{
    ConnectionRecord, ConnectionState, FileOpRecord, FileOperation, IncarnationId, ProcessNode,
    ProcessStatus, Protocol,
};
use crate::signatures::{Signature, SignatureMatcher};
use crate::trackers::{TrackerManager, TrackerStatus};
use crate::tree::{TreeState, TreeStats};

#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    pub agent_type: Option<String>,
    pub pid: Option<u32>,
    pub parent_incarnation_id: Option<IncarnationId>,
    pub status: Option<ProcessStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
}

impl ProcessFilter {
    fn matches(&self, node: &ProcessNode) -> bool {
        if let Some(ref agent) = self.agent_type {
            if node.agent_type.as_deref() != Some(agent.as_str()) {
                return false;
            }
        }
        if let Some(pid) = self.pid {
            if node.pid != pid {
                return false;
            }
        }
        if let Some(ref parent) = self.parent_incarnation_id {
            if node.parent_incarnation_id.as_ref() != Some(parent) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if node.status != status {
                return false;
            }
        }
        if let Some(after) = self.started_after {
            if node.started_at < after {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if node.started_at > before {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    pub pid: Option<u32>,
    pub incarnation_id: Option<IncarnationId>,
    pub protocol: Option<Protocol>,
    pub state: Option<ConnectionState>,
    pub observed_after: Option<DateTime<Utc>>,
}

impl ConnectionFilter {
    fn matches(&self, record: &ConnectionRecord) -> bool {
        if let Some(pid) = self.pid {
            if record.pid != pid {
                return false;
            }
        }
        if let Some(ref id) = self.incarnation_id {
            if record.incarnation_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(protocol) = self.protocol {
            if record.protocol != protocol {
                return false;
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        if let Some(after) = self.observed_after {
            if record.observed_at < after {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileOpFilter {
    pub pid: Option<u32>,
    pub incarnation_id: Option<IncarnationId>,
    pub operation: Option<FileOperation>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl FileOpFilter {
    fn matches(&self, record: &FileOpRecord) -> bool {
        if let Some(pid) = self.pid {
            if record.pid != pid {
                return false;
            }
        }
        if let Some(ref id) = self.incarnation_id {
            if record.incarnation_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(operation) = self.operation {
            if record.operation != operation {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub instance_id: String,
    pub hostname: String,
    pub uptime_secs: u64,
    pub trackers: Vec<TrackerStatus>,
    pub tree: TreeStats,
}

/// Synchronous, consistent-as-of-now reads over the committed state.
///
/// Every call copies results out under the read lock, so a result never
/// reflects a partially applied diff and never holds the lock after
/// returning.
pub struct QueryService {
    state: Arc<RwLock<TreeState>>,
    matcher: Arc<SignatureMatcher>,
    trackers: Option<Arc<TrackerManager>>,
    instance_id: String,
    hostname: String,
    started_at: Instant,
}

impl QueryService {
    pub fn new(
        state: Arc<RwLock<TreeState>>,
        matcher: Arc<SignatureMatcher>,
        trackers: Option<Arc<TrackerManager>>,
        instance_id: String,
        hostname: String,
    ) -> Self {
        Self {
            state,
            matcher,
            trackers,
            instance_id,
            hostname,
            started_at: Instant::now(),
        }
    }

    pub async fn query_processes(&self, filter: &ProcessFilter, page: Page) -> Vec<ProcessNode> {
        let state = self.state.read().await;
        let mut nodes: Vec<ProcessNode> = state
            .nodes()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        drop(state);

        nodes.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then(a.incarnation_id.cmp(&b.incarnation_id))
        });
        paginate(nodes, page)
    }

    /// A node plus all its descendants, exited or not.
    pub async fn process_tree(&self, root: IncarnationId) -> Vec<ProcessNode> {
        let state = self.state.read().await;
        let mut result = Vec::new();
        let Some(root_node) = state.node(&root) else {
            return result;
        };
        result.push(root_node.clone());

        let mut frontier = vec![root];
        while let Some(id) = frontier.pop() {
            for child in state.children_of(&id) {
                result.push(child.clone());
                frontier.push(child.incarnation_id);
            }
        }
        result
    }

    pub async fn query_connections(
        &self,
        filter: &ConnectionFilter,
        page: Page,
    ) -> Vec<ConnectionRecord> {
        let state = self.state.read().await;
        let mut records: Vec<ConnectionRecord> = state
            .connections()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        drop(state);

        records.sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then(a.id.cmp(&b.id)));
        paginate(records, page)
    }

    pub async fn query_file_ops(&self, filter: &FileOpFilter, page: Page) -> Vec<FileOpRecord> {
        let state = self.state.read().await;
        let mut records: Vec<FileOpRecord> = state
            .file_ops()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect();
        drop(state);

        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        paginate(records, page)
    }

    pub fn get_signatures(&self) -> Vec<Signature> {
        self.matcher.snapshot().iter().cloned().collect()
    }

    pub async fn get_status(&self) -> EngineStatus {
        let tree = self.state.read().await.stats();
        let trackers = match &self.trackers {
            Some(manager) => manager.get_status().await,
            None => Vec::new(),
        };

        EngineStatus {
            instance_id: self.instance_id.clone(),
            hostname: self.hostname.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            trackers,
            tree,
        }
    }
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items
        .into_iter()
        .skip(page.offset)
        .take(page.limit)
        .collect()
}
