use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{Orchestrator, OrchestratorError};
use crate::chain::{Desired, Intent, Reconciler};
use crate::config::new_test_config;
use crate::health::{ProbeError, ProbeTarget, Prober};
use crate::manifest::{Manifest, ServiceManifestEntry};
use crate::model::{InstanceId, InstanceStatus};

struct AlwaysUp;

#[async_trait]
impl Prober for AlwaysUp {
    async fn probe(&self, _target: &ProbeTarget, _port: u16) -> Result<(), ProbeError> {
        Ok(())
    }
}

fn sleeper(name: &str) -> ServiceManifestEntry {
    ServiceManifestEntry::new(name, "sleep").with_args(["30"])
}

fn orchestrator(entries: Vec<ServiceManifestEntry>) -> Orchestrator {
    let manifest = Manifest::new(entries).unwrap();
    Orchestrator::new(&new_test_config(), manifest, Arc::new(AlwaysUp))
}

async fn all_running(o: &Orchestrator, service: &str, n: usize) -> bool {
    o.registry()
        .wait_for(Duration::from_secs(5), |r| {
            r.count(service, |s| s == InstanceStatus::Running) == n
        })
        .await
}

#[tokio::test]
async fn test_deploy_all_starts_dependencies_first() {
    let o = orchestrator(vec![
        sleeper("web").with_dependencies(["db"]),
        sleeper("db").with_replicas(2),
    ]);

    let started = o.deploy_all().await.unwrap();
    assert_eq!(started.len(), 3);

    let db: Vec<_> = o.registry().find("db");
    let web = o.registry().find("web").remove(0);
    assert!(db.iter().all(|i| i.started_at <= web.started_at));
    assert!(all_running(&o, "web", 1).await);

    let status = o.status();
    assert_eq!(status.len(), 3);
    assert_eq!(status[0].service_name, "db");
    assert_eq!(status[2].service_name, "web");
    let mut ports: Vec<u16> = status.iter().map(|s| s.port).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 3);

    let intents = o.take_pending_intents();
    assert!(intents.contains(&Intent::active("db")));
    assert!(intents.contains(&Intent::active("web")));

    o.shutdown().await;
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependents() {
    let o = orchestrator(vec![
        ServiceManifestEntry::new("a", "sh").with_args(["-c", "exit 1"]),
        sleeper("b").with_dependencies(["a"]),
    ]);

    match o.deploy_all().await {
        Err(OrchestratorError::SpawnFailed { service, .. }) => assert_eq!(service, "a"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(o.registry().find("b").is_empty());
    assert!(o.ports().leases().is_empty());
}

#[tokio::test]
async fn test_cycle_is_rejected_before_spawning() {
    let o = orchestrator(vec![
        sleeper("x").with_dependencies(["y"]),
        sleeper("y").with_dependencies(["x"]),
    ]);

    assert!(matches!(
        o.deploy_all().await,
        Err(OrchestratorError::CyclicDependency { .. })
    ));
    assert!(o.registry().is_empty());
}

#[tokio::test]
async fn test_deploy_and_scale_converge_on_desired() {
    let o = orchestrator(vec![sleeper("api")]);

    o.deploy("api").await.unwrap();
    assert_eq!(
        o.deploy("api").await,
        Err(OrchestratorError::AlreadyAtDesired {
            service: "api".to_string(),
            desired: 1
        })
    );

    let up = o.scale("api", 3).await.unwrap();
    assert_eq!((up.from, up.to), (1, 3));
    assert_eq!(up.started.len(), 2);
    assert_eq!(o.status_of("api").unwrap().len(), 3);

    let down = o.scale("api", 1).await.unwrap();
    assert_eq!(down.stopped.len(), 2);
    assert_eq!(o.status_of("api").unwrap().len(), 1);
    assert_eq!(o.ports().leases().len(), 1);

    // Stopped ids are recognized on a repeated terminate.
    assert!(o.terminate_instance(&down.stopped[0]).await.is_ok());

    o.shutdown().await;
}

#[tokio::test]
async fn test_terminate_instance_is_idempotent() {
    let o = orchestrator(vec![sleeper("api").with_replicas(2)]);
    o.deploy_all().await.unwrap();

    let id = o.registry().find("api").remove(0).id;
    o.terminate_instance(&id).await.unwrap();
    o.terminate_instance(&id).await.unwrap();
    assert!(o.registry().get(&id).is_none());
    assert_eq!(o.status_of("api").unwrap().len(), 1);

    let unknown = InstanceId::from("api-nope");
    assert_eq!(
        o.terminate_instance(&unknown).await,
        Err(OrchestratorError::UnknownInstance(unknown.clone()))
    );
    assert!(matches!(
        o.samples(&unknown),
        Err(OrchestratorError::UnknownInstance(_))
    ));

    o.shutdown().await;
}

#[tokio::test]
async fn test_terminate_service_then_redeploy() {
    let o = orchestrator(vec![sleeper("api").with_replicas(2)]);
    o.deploy_all().await.unwrap();
    o.take_pending_intents();

    let stopped = o.terminate_service("api").await.unwrap();
    assert_eq!(stopped.len(), 2);
    assert!(o.status_of("api").unwrap().is_empty());
    assert!(o.terminate_service("api").await.unwrap().is_empty());
    assert!(o.ports().leases().is_empty());

    let intents = o.take_pending_intents();
    assert_eq!(intents.last().map(|i| i.desired), Some(Desired::Inactive));

    o.deploy("api").await.unwrap();
    o.deploy("api").await.unwrap();
    assert!(o.deploy("api").await.is_err());
    assert_eq!(o.status_of("api").unwrap().len(), 2);

    o.shutdown().await;
}

#[tokio::test]
async fn test_unknown_service_is_reported() {
    let o = orchestrator(vec![sleeper("api")]);
    let unknown = OrchestratorError::UnknownService("ghost".to_string());
    assert_eq!(o.deploy("ghost").await, Err(unknown.clone()));
    assert_eq!(o.terminate_service("ghost").await, Err(unknown.clone()));
    assert_eq!(o.scale("ghost", 2).await, Err(unknown.clone()));
    assert_eq!(o.status_of("ghost"), Err(unknown));
}

#[tokio::test]
async fn test_shutdown_stops_everything_and_refuses_deploys() {
    let o = orchestrator(vec![sleeper("api").with_replicas(2)]);
    o.deploy_all().await.unwrap();

    o.shutdown().await;
    assert!(o.registry().is_empty());
    assert!(o.ports().leases().is_empty());
    assert!(!o.has_failures());
    assert_eq!(o.deploy("api").await, Err(OrchestratorError::ShuttingDown));
}

#[tokio::test]
async fn test_reconciler_side_records_no_intents() {
    let o = orchestrator(vec![sleeper("api").with_replicas(2)]);

    o.resurrect("api").await.unwrap();
    let view = o.local_view();
    assert_eq!(view["api"].live, 2);
    assert!(o.take_pending_intents().is_empty());

    // Already live: nothing new.
    o.resurrect("api").await.unwrap();
    assert_eq!(o.registry().find("api").len(), 2);

    o.deactivate("api").await.unwrap();
    assert!(o.local_view().is_empty());
    assert!(o.take_pending_intents().is_empty());

    o.restore_pending_intents(vec![Intent::active("api")]);
    assert_eq!(o.take_pending_intents(), vec![Intent::active("api")]);

    o.shutdown().await;
}
