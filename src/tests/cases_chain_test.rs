use std::sync::Arc;
use std::time::Duration;

use super::support::{sleeper, Node};
use crate::chain::{ChainLog, ChainSynchronizer, Desired, FileChainLog};
use crate::config::{new_test_config, ConfigTrait};
use crate::model::InstanceStatus;

/// Two nodes with the same manifest sharing one chain file.
struct Mesh {
    _dir: tempfile::TempDir,
    a: Node,
    b: Node,
    sync_a: Arc<ChainSynchronizer>,
    sync_b: Arc<ChainSynchronizer>,
}

fn mesh() -> Mesh {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.jsonl");

    let make = |node_id: &str| {
        let node = Node::new(vec![sleeper("api"), sleeper("db")]);
        let mut settings = new_test_config().chain();
        settings.enabled = true;
        settings.node_id = node_id.to_string();
        let log = Arc::new(FileChainLog::new(&path).with_lock_wait(Duration::from_secs(5)));
        let sync = Arc::new(ChainSynchronizer::new(settings, log, node.orchestrator.clone()));
        (node, sync)
    };
    let (a, sync_a) = make("node-a");
    let (b, sync_b) = make("node-b");

    Mesh {
        _dir: dir,
        a,
        b,
        sync_a,
        sync_b,
    }
}

impl Mesh {
    async fn shutdown(&self) {
        self.a.orchestrator.shutdown().await;
        self.b.orchestrator.shutdown().await;
    }
}

#[tokio::test]
async fn test_active_intent_is_resurrected_on_peer() {
    let m = mesh();

    m.a.orchestrator.deploy("api").await.unwrap();
    let first = m.sync_a.tick().await.unwrap();
    assert!(first.reset);
    assert_eq!(m.sync_a.view().get("api").map(|(d, _)| d), Some(Desired::Active));

    let report = m.sync_b.tick().await.unwrap();
    assert_eq!(report.resurrected, vec!["api".to_string()]);
    assert!(
        m.b.wait_count("api", InstanceStatus::Running, 1, Duration::from_secs(5))
            .await
    );
    // Resurrection records nothing of its own.
    assert_eq!(report.appended, None);

    // Drift repair is idempotent: nothing new spawns on later ticks.
    for _ in 0..3 {
        let again = m.sync_b.tick().await.unwrap();
        assert!(again.resurrected.is_empty());
    }
    assert_eq!(m.b.orchestrator.registry().find("api").len(), 1);
    assert!(m.b.orchestrator.registry().find("db").is_empty());

    m.shutdown().await;
}

#[tokio::test]
async fn test_inactive_intent_stops_peer_instances() {
    let m = mesh();

    m.a.orchestrator.deploy("api").await.unwrap();
    m.sync_a.tick().await.unwrap();
    m.sync_b.tick().await.unwrap();
    assert_eq!(m.b.orchestrator.registry().find("api").len(), 1);

    m.a.orchestrator.terminate_service("api").await.unwrap();
    let appended = m.sync_a.tick().await.unwrap().appended;
    assert!(appended.is_some());

    let report = m.sync_b.tick().await.unwrap();
    assert_eq!(report.deactivated, vec!["api".to_string()]);
    assert!(m.b.orchestrator.registry().find("api").is_empty());
    assert!(m.b.orchestrator.ports().leases().is_empty());

    // Nobody resurrects an inactive service.
    let later = m.sync_a.tick().await.unwrap();
    assert!(later.resurrected.is_empty());
    assert!(m.a.orchestrator.registry().find("api").is_empty());

    m.shutdown().await;
}

#[tokio::test]
async fn test_local_redeploy_overrides_older_inactive_intent() {
    let m = mesh();

    m.a.orchestrator.deploy("db").await.unwrap();
    m.sync_a.tick().await.unwrap();
    m.a.orchestrator.terminate_service("db").await.unwrap();
    m.sync_a.tick().await.unwrap();

    m.b.orchestrator.deploy("db").await.unwrap();
    let report = m.sync_b.tick().await.unwrap();
    assert!(report.deactivated.is_empty());
    assert!(report.appended.is_some());
    assert_eq!(m.b.orchestrator.registry().find("db").len(), 1);

    let back = m.sync_a.tick().await.unwrap();
    assert_eq!(back.resurrected, vec!["db".to_string()]);

    m.shutdown().await;
}

#[tokio::test]
async fn test_both_nodes_append_to_one_monotonic_record() {
    let m = mesh();

    m.a.orchestrator.deploy("api").await.unwrap();
    m.b.orchestrator.deploy("db").await.unwrap();
    let (ra, rb) = tokio::join!(m.sync_a.tick(), m.sync_b.tick());
    ra.unwrap();
    rb.unwrap();

    // Converge: each tick reads what the other appended.
    for _ in 0..2 {
        m.sync_a.tick().await.unwrap();
        m.sync_b.tick().await.unwrap();
    }

    let blocks = m.sync_a.blocks_from(1).await.unwrap();
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.height, i as u64 + 1);
        assert!(block.verify());
    }
    let head = FileChainLog::new(m._dir.path().join("chain.jsonl")).head().unwrap();
    assert_eq!(head, blocks.len() as u64);

    for node in [&m.a, &m.b] {
        assert_eq!(node.orchestrator.registry().find("api").len(), 1);
        assert_eq!(node.orchestrator.registry().find("db").len(), 1);
    }

    m.shutdown().await;
}
