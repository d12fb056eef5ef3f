//! End-to-end ordering test: high process churn through the tree manager
//! and hub, with deliberate pid reuse and duplicate exit delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentwatch::events::{
    EngineEvent, ExitInfo, ProcessDiff, ProcessSnapshot, TrackerDiff,
};
use agentwatch::hub::EventHub;
use agentwatch::signatures::SignatureMatcher;
use agentwatch::tree::{TreeManager, TreeState};

const LINEAGES: u32 = 50;
const PAIRS_PER_LINEAGE: u32 = 20;

fn snapshot(pid: u32, name: &str, parent: Option<u32>) -> ProcessSnapshot {
    let mut s = ProcessSnapshot::new(pid, name.to_string());
    s.parent_pid = parent;
    s
}

fn spawn_diff(s: ProcessSnapshot) -> TrackerDiff {
    TrackerDiff::Process(ProcessDiff {
        spawned: vec![s],
        ..Default::default()
    })
}

fn exit_diff(pid: u32) -> TrackerDiff {
    TrackerDiff::Process(ProcessDiff {
        exited: vec![(pid, ExitInfo { code: Some(0), signal: None })],
        ..Default::default()
    })
}

#[tokio::test]
async fn churn_preserves_causal_order_and_terminal_idempotence() {
    let matcher = Arc::new(SignatureMatcher::with_defaults());
    let state = Arc::new(RwLock::new(TreeState::new()));
    let hub = EventHub::new(16_384);
    let mut subscriber = hub.subscribe();

    let (diff_tx, diff_rx) = mpsc::channel(4_096);
    let cancel = CancellationToken::new();
    let manager = TreeManager::new(state.clone(), matcher, hub.clone());
    let manager_handle = manager.spawn(diff_rx, cancel.clone());

    // 50 lineages, each rooted in an agent process; every lineage burns
    // through 20 spawn/exit pairs on a single reused child pid, and every
    // exit is delivered twice.
    for lineage in 0..LINEAGES {
        let root_pid = 10_000 + lineage;
        let mut root = snapshot(root_pid, "claude", Some(1));
        root.args = vec!["--project".to_string(), format!("p{}", lineage)];
        diff_tx.send(spawn_diff(root)).await.unwrap();

        let child_pid = 20_000 + lineage;
        for _ in 0..PAIRS_PER_LINEAGE {
            diff_tx
                .send(spawn_diff(snapshot(child_pid, "node", Some(root_pid))))
                .await
                .unwrap();
            diff_tx.send(exit_diff(child_pid)).await.unwrap();
            // Duplicate exit: must be a no-op.
            diff_tx.send(exit_diff(child_pid)).await.unwrap();
        }
    }
    drop(diff_tx);

    // The manager drains everything before stopping.
    tokio::time::timeout(Duration::from_secs(30), manager_handle)
        .await
        .expect("tree manager did not finish")
        .unwrap();

    // Collect the full event stream.
    let mut spawn_position: HashMap<Uuid, usize> = HashMap::new();
    let mut exit_seen: HashMap<Uuid, usize> = HashMap::new();
    let mut position = 0usize;

    while let Some(event) = subscriber.try_recv() {
        match event {
            EngineEvent::ProcessSpawned { node } => {
                let prior = spawn_position.insert(node.incarnation_id, position);
                assert!(prior.is_none(), "incarnation spawned twice");
            }
            EngineEvent::ProcessUpdated { node } => {
                let spawned_at = spawn_position
                    .get(&node.incarnation_id)
                    .expect("update before spawn");
                assert!(*spawned_at < position, "update must follow spawn");
                assert!(
                    !exit_seen.contains_key(&node.incarnation_id),
                    "update after exit"
                );
            }
            EngineEvent::ProcessExited { node } => {
                let spawned_at = spawn_position
                    .get(&node.incarnation_id)
                    .expect("exit before spawn");
                assert!(*spawned_at < position, "exit must follow spawn");
                let prior = exit_seen.insert(node.incarnation_id, position);
                assert!(prior.is_none(), "duplicate terminal application");
            }
            _ => {}
        }
        position += 1;
    }

    assert_eq!(subscriber.dropped(), 0, "test hub must not drop events");

    let expected_spawns = (LINEAGES + LINEAGES * PAIRS_PER_LINEAGE) as usize;
    let expected_exits = (LINEAGES * PAIRS_PER_LINEAGE) as usize;
    assert_eq!(spawn_position.len(), expected_spawns);
    assert_eq!(exit_seen.len(), expected_exits);

    // Every reused child pid produced distinct incarnations, all retained.
    let state = state.read().await;
    assert_eq!(state.nodes().count(), expected_spawns);
    for lineage in 0..LINEAGES {
        let child_pid = 20_000 + lineage;
        let incarnations: Vec<_> = state.nodes().filter(|n| n.pid == child_pid).collect();
        assert_eq!(incarnations.len(), PAIRS_PER_LINEAGE as usize);

        let root = state.live_by_pid(10_000 + lineage).expect("root still live");
        assert_eq!(root.agent_type.as_deref(), Some("claude-code"));
        for incarnation in incarnations {
            // Children inherited the lineage attribution and kept their
            // parent link after exiting.
            assert_eq!(incarnation.agent_type.as_deref(), Some("claude-code"));
            assert_eq!(incarnation.parent_incarnation_id, Some(root.incarnation_id));
            assert!(incarnation.status.is_terminal());
        }
    }

    cancel.cancel();
}
