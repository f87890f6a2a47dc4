use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use super::{
    ChainController, DeployController, InstanceController, LivenessProbeController,
    StatusController,
};
use crate::chain::{ChainSynchronizer, Intent, MemoryChainLog, Reconciler};
use crate::config::{new_test_config, ConfigTrait};
use crate::health::{ProbeError, ProbeTarget, Prober};
use crate::http::Controller;
use crate::liveness;
use crate::manifest::{Manifest, ServiceManifestEntry};
use crate::orchestrator::Orchestrator;

struct AlwaysUp;

#[async_trait]
impl Prober for AlwaysUp {
    async fn probe(&self, _target: &ProbeTarget, _port: u16) -> Result<(), ProbeError> {
        Ok(())
    }
}

fn orchestrator() -> Arc<Orchestrator> {
    let manifest = Manifest::new(vec![
        ServiceManifestEntry::new("api", "sleep").with_args(["30"]),
        ServiceManifestEntry::new("broken", "sh").with_args(["-c", "exit 3"]),
    ])
    .unwrap();
    Arc::new(Orchestrator::new(&new_test_config(), manifest, Arc::new(AlwaysUp)))
}

fn router(orchestrator: &Arc<Orchestrator>, chain: Option<Arc<ChainSynchronizer>>) -> Router {
    let controllers: Vec<Box<dyn Controller>> = vec![
        Box::new(StatusController::new(orchestrator.clone())),
        Box::new(DeployController::new(orchestrator.clone())),
        Box::new(InstanceController::new(orchestrator.clone())),
        Box::new(ChainController::new(chain)),
        Box::new(LivenessProbeController::new(Arc::new(liveness::Probe::new(
            Duration::from_millis(100),
        )))),
    ];
    controllers
        .iter()
        .fold(Router::new(), |r, c| c.add_route(r))
}

async fn call(router: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_deploy_status_and_terminate() {
    let o = orchestrator();
    let app = router(&o, None);

    let (status, body) = call(&app, Method::GET, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Array(vec![]));

    let (status, body) = call(&app, Method::POST, "/deploy/api").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["instanceID"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::POST, "/deploy/api").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_at_desired");

    let (status, body) = call(&app, Method::GET, "/status/api").await;
    assert_eq!(status, StatusCode::OK);
    let row = &body[0];
    assert_eq!(row["instanceID"], id.as_str());
    assert_eq!(row["serviceName"], "api");
    assert!(row["port"].as_u64().is_some());
    assert!(row["uptimeSeconds"].as_u64().is_some());
    assert_eq!(row["restartCount"], 0);

    let (status, body) = call(&app, Method::GET, &format!("/instance/{id}/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["samples"].is_array());

    let (status, _) = call(&app, Method::DELETE, &format!("/instance/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::DELETE, &format!("/instance/{id}")).await;
    assert_eq!(status, StatusCode::OK);

    o.shutdown().await;
}

#[tokio::test]
async fn test_error_mapping() {
    let o = orchestrator();
    let app = router(&o, None);

    let (status, body) = call(&app, Method::POST, "/deploy/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_service");

    let (status, _) = call(&app, Method::GET, "/status/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::DELETE, "/instance/api-missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_instance");

    let (status, body) = call(&app, Method::POST, "/deploy/broken").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "spawn_failed");

    let (status, _) = call(&app, Method::POST, "/scale/api?to=many").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app, Method::POST, "/scale/api").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_port_pool_exhaustion_is_unavailable() {
    let mut cfg = new_test_config();
    let mut ports = cfg.ports();
    ports.to = ports.from;
    cfg.orchestrator.ports = Some(ports);

    let manifest = Manifest::new(vec![ServiceManifestEntry::new("api", "sleep")
        .with_args(["30"])
        .with_replicas(2)])
    .unwrap();
    let o = Arc::new(Orchestrator::new(&cfg, manifest, Arc::new(AlwaysUp)));
    let app = router(&o, None);

    assert_eq!(call(&app, Method::POST, "/deploy/api").await.0, StatusCode::ACCEPTED);
    let (status, body) = call(&app, Method::POST, "/deploy/api").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "port_pool_exhausted");

    o.shutdown().await;
}

#[tokio::test]
async fn test_scale_and_stop_service() {
    let o = orchestrator();
    let app = router(&o, None);

    let (status, body) = call(&app, Method::POST, "/scale/api?to=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["from"], 0);
    assert_eq!(body["to"], 2);
    assert_eq!(body["started"].as_array().unwrap().len(), 2);

    let (status, body) = call(&app, Method::DELETE, "/service/api").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"].as_array().unwrap().len(), 2);

    let (_, body) = call(&app, Method::GET, "/failures").await;
    assert_eq!(body, Value::Array(vec![]));

    o.shutdown().await;
}

#[tokio::test]
async fn test_chain_endpoint() {
    let o = orchestrator();

    let (status, body) = call(&router(&o, None), Method::GET, "/chain").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "chain_disabled");

    let mut settings = new_test_config().chain();
    settings.enabled = true;
    let sync = Arc::new(ChainSynchronizer::new(
        settings,
        Arc::new(MemoryChainLog::new()),
        o.clone(),
    ));
    o.restore_pending_intents(vec![Intent::inactive("api")]);
    sync.tick().await.unwrap();

    let app = router(&o, Some(sync));
    let (status, body) = call(&app, Method::GET, "/chain").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodeId"], "test-node");
    assert_eq!(body["height"], 1);
    assert_eq!(body["intents"][0]["service"], "api");
    assert_eq!(body["intents"][0]["desired"], "inactive");
    assert!(body.get("blocks").is_none());

    let (_, body) = call(&app, Method::GET, "/chain?from=1").await;
    assert_eq!(body["blocks"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_liveness_probe() {
    let o = orchestrator();
    let (status, body) = call(&router(&o, None), Method::GET, "/k8s/probe").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 200);
}
