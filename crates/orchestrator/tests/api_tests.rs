//! Integration tests for the driver API endpoints

#[path = "../src/api.rs"]
mod api;

use api::{create_router, AppState};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use orchestrator_lib::{
    stack, ActionInvoker, DeploymentConfig, DeploymentStatus, DryRunActionClient, DryRunEngine,
    EngineError, ExecutionPlan, IdempotencyLedger, InvokerConfig, LifetimeGuard, Orchestrator,
    OrchestratorConfig, ResourceEngine, ResourceNode, StructuredLogger,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Applies everything, but can never remove the cluster
struct StuckClusterEngine;

#[async_trait]
impl ResourceEngine for StuckClusterEngine {
    async fn declare(&self, _node: &ResourceNode) -> Result<(), EngineError> {
        Ok(())
    }

    async fn apply(&self, _node: &ResourceNode) -> Result<Option<Value>, EngineError> {
        Ok(None)
    }

    async fn remove(&self, node: &ResourceNode) -> Result<(), EngineError> {
        if node.id.as_str() == stack::ids::CLUSTER {
            return Err(EngineError::new(&node.id, "remove", "cluster still has services"));
        }
        Ok(())
    }
}

struct TestApp {
    router: Router,
    orchestrator: Orchestrator,
    guard: Arc<LifetimeGuard>,
    status: DeploymentStatus,
    plan: ExecutionPlan,
}

fn setup_test_app(engine: Arc<dyn ResourceEngine>) -> TestApp {
    let logger = StructuredLogger::new("api-test");
    let guard = Arc::new(LifetimeGuard::new(Duration::from_secs(7200), logger.clone()));
    let invoker = Arc::new(ActionInvoker::new(
        Arc::new(DryRunActionClient::new()),
        Arc::new(IdempotencyLedger::new()),
        InvokerConfig::default(),
    ));
    let orchestrator = Orchestrator::new(engine, invoker, OrchestratorConfig::default())
        .with_guard(guard.clone())
        .with_logger(logger);

    let status = DeploymentStatus::new("api-test", guard.clone());
    let router = create_router(Arc::new(AppState::new(status.clone())));
    let plan = stack::build_graph(&DeploymentConfig::default())
        .unwrap()
        .validate()
        .unwrap();

    TestApp {
        router,
        orchestrator,
        guard,
        status,
        plan,
    }
}

async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn provisioned(app: &TestApp) {
    let report = app.orchestrator.provision(&app.plan).await.unwrap();
    app.status.record_report(&report).await;
}

#[tokio::test]
async fn test_healthz_returns_ok_before_provisioning() {
    let app = setup_test_app(Arc::new(DryRunEngine::new()));

    let (status, body) = get(app.router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["guard"], "installing");
}

#[tokio::test]
async fn test_readyz_returns_503_before_provisioning() {
    let app = setup_test_app(Arc::new(DryRunEngine::new()));

    let (status, body) = get(app.router, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_after_provisioning() {
    let app = setup_test_app(Arc::new(DryRunEngine::new()));
    provisioned(&app).await;

    let (status, body) = get(app.router, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    let readiness: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_status_reports_guard_and_stack_output() {
    let app = setup_test_app(Arc::new(DryRunEngine::new()));
    provisioned(&app).await;

    let (status, body) = get(app.router, "/status").await;
    assert_eq!(status, StatusCode::OK);

    let snapshot: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot["guard"], "active");
    assert_eq!(snapshot["ttl_secs"], 7200);
    assert!(snapshot["expires_at"].is_string());
    assert_eq!(
        snapshot["load_balancer_dns"],
        "fargateservice-dry-run.elb.amazonaws.com"
    );
    assert_eq!(
        snapshot["last_provision"]["nodes"].as_array().unwrap().len(),
        app.plan.len()
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_teardown_is_stuck() {
    let app = setup_test_app(Arc::new(StuckClusterEngine));
    provisioned(&app).await;

    assert!(app.guard.teardown(&app.orchestrator, &app.plan).await.is_err());

    let (status, body) = get(app.router, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["guard"], "expiring");
    assert!(health["issues"][0]
        .as_str()
        .unwrap()
        .contains(stack::ids::CLUSTER));
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let app = setup_test_app(Arc::new(DryRunEngine::new()));
    provisioned(&app).await;

    let response = app
        .router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("orchestrator_node_outcomes_total"));
    assert!(metrics_text.contains("orchestrator_node_apply_seconds_bucket"));
    assert!(metrics_text.contains("orchestrator_guard_state"));
}
