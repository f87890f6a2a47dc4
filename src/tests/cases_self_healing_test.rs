use std::collections::HashSet;
use std::time::Duration;

use super::support::{crasher, sleeper, Node};
use crate::config::{new_test_config, Ports};
use crate::model::{InstanceStatus, LifecycleEvent};

#[tokio::test]
async fn test_three_probe_timeouts_replace_the_instance() {
    let node = Node::new(vec![sleeper("api").with_health_check("/healthz")]);
    let first = node.orchestrator.deploy("api").await.unwrap();
    assert!(
        node.wait_count("api", InstanceStatus::Running, 1, Duration::from_secs(5))
            .await
    );

    let original = node.orchestrator.registry().get(&first).unwrap();
    node.prober.hang(original.port);

    let replaced = node
        .orchestrator
        .registry()
        .wait_for(Duration::from_secs(5), |r| {
            r.find("api")
                .iter()
                .any(|i| i.id != first && i.status == InstanceStatus::Running)
        })
        .await;
    assert!(replaced);

    let status = node.orchestrator.status_of("api").unwrap();
    assert_eq!(status.len(), 1);
    assert_ne!(status[0].instance_id, first);
    assert_ne!(status[0].port, original.port);
    assert_eq!(status[0].restart_count, 1);

    // The replaced id is gone for good and its samples went with it.
    assert!(node.orchestrator.samples(&first).is_err());

    node.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_refused_probes_replace_the_instance() {
    let node = Node::new(vec![sleeper("api").with_health_check("tcp")]);
    let first = node.orchestrator.deploy("api").await.unwrap();
    assert!(
        node.wait_count("api", InstanceStatus::Running, 1, Duration::from_secs(5))
            .await
    );
    let port = node.orchestrator.registry().get(&first).unwrap().port;
    node.prober.refuse(port);

    let replaced = node
        .orchestrator
        .registry()
        .wait_for(Duration::from_secs(5), |r| {
            r.find("api").iter().any(|i| i.id != first)
        })
        .await;
    assert!(replaced);
    node.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_crash_loop_converges_on_failed_after_budget() {
    let mut cfg = new_test_config();
    if let Some(restart) = cfg.orchestrator.restart.as_mut() {
        restart.max_restarts = Some(2);
    }
    let node = Node::with_config(cfg, vec![crasher("doomed", Duration::from_millis(200), 1)]);
    let mut events = node.orchestrator.subscribe();

    node.orchestrator.deploy("doomed").await.unwrap();
    assert!(
        node.wait_count("doomed", InstanceStatus::Failed, 1, Duration::from_secs(10))
            .await
    );

    // One initial spawn plus exactly two restarts.
    let mut spawned = HashSet::new();
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::Spawned { instance_id, .. } = event {
            spawned.insert(instance_id);
        }
    }
    assert_eq!(spawned.len(), 3);

    let failed = node.orchestrator.registry().find("doomed").remove(0);
    assert_eq!(failed.restart_count, 2);
    assert!(node.orchestrator.has_failures());
    assert!(node.orchestrator.ports().leases().is_empty());

    let failures = node.orchestrator.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].instance_id, failed.id);

    // A fresh deploy clears the failure and starts over.
    node.orchestrator.deploy("doomed").await.unwrap();
    assert!(node.orchestrator.failures().is_empty());
    assert_eq!(node.orchestrator.registry().find("doomed").len(), 1);

    node.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_requested_termination_is_not_healed() {
    let node = Node::new(vec![sleeper("api").with_replicas(2)]);
    node.orchestrator.deploy_all().await.unwrap();
    let victim = node.orchestrator.registry().find("api").remove(0).id;

    node.orchestrator.terminate_instance(&victim).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let left = node.orchestrator.registry().find("api");
    assert_eq!(left.len(), 1);
    assert!(left.iter().all(|i| i.restart_count == 0));

    node.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_single_port_pool_restarts_on_the_freed_port() {
    let mut cfg = new_test_config();
    cfg.orchestrator.ports = Some(Ports {
        from: 42500,
        to: 42500,
        check_bindable: false,
    });
    if let Some(restart) = cfg.orchestrator.restart.as_mut() {
        restart.max_restarts = Some(2);
    }
    let node = Node::with_config(cfg, vec![crasher("solo", Duration::from_millis(300), 1)]);
    let mut events = node.orchestrator.subscribe();

    node.orchestrator.deploy("solo").await.unwrap();
    assert!(
        node.wait_count("solo", InstanceStatus::Failed, 1, Duration::from_secs(10))
            .await
    );

    // Every counted restart is a real process on the only port.
    let mut spawned = HashSet::new();
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::Spawned { instance_id, port, .. } = event {
            assert_eq!(port, 42500);
            spawned.insert(instance_id);
        }
    }
    assert_eq!(spawned.len(), 3);

    let failed = node.orchestrator.registry().find("solo").remove(0);
    assert_eq!(failed.restart_count, 2);
    assert!(node.orchestrator.ports().leases().is_empty());

    node.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_terminating_a_replaced_instance_is_accepted() {
    let node = Node::new(vec![sleeper("api").with_health_check("tcp")]);
    let first = node.orchestrator.deploy("api").await.unwrap();
    assert!(
        node.wait_count("api", InstanceStatus::Running, 1, Duration::from_secs(5))
            .await
    );
    let port = node.orchestrator.registry().get(&first).unwrap().port;
    node.prober.refuse(port);

    let replaced = node
        .orchestrator
        .registry()
        .wait_for(Duration::from_secs(5), |r| {
            r.find("api")
                .iter()
                .any(|i| i.id != first && i.status == InstanceStatus::Running)
        })
        .await;
    assert!(replaced);

    node.orchestrator.terminate_instance(&first).await.unwrap();

    // The replacement keeps running.
    let left = node.orchestrator.registry().find("api");
    assert_eq!(left.len(), 1);
    assert_ne!(left[0].id, first);

    node.orchestrator.shutdown().await;
}
