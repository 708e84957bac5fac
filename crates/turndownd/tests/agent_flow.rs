//! End-to-end agent flow over the control surface.
//!
//! Wires the same components as `turndownd run` around in-memory cloud
//! and Kubernetes fakes, with an on-disk store so a restart can be
//! simulated by reopening it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;

use turndown_api::{ApiState, build_router};
use turndown_core::{NodePool, ProviderKind};
use turndown_manager::{AgentHost, TurndownManager, strategy_for};
use turndown_provider::PollPolicy;
use turndown_provider::testing::{FakeKube, FakeProvider};
use turndown_scheduler::TurndownScheduler;
use turndown_state::{StateStore, TurndownPhase};

fn cluster() -> Arc<FakeProvider> {
    Arc::new(
        FakeProvider::new(ProviderKind::Gke)
            .with_pool(NodePool::new("default-pool", 3, 3))
            .with_pool(NodePool::new("highmem", 1, 1).with_autoscaling(1, 4)),
    )
}

fn agent(provider: &Arc<FakeProvider>, path: &Path) -> ApiState {
    let store = StateStore::open(path).unwrap();
    let poll = PollPolicy::new(Duration::from_millis(10), Duration::from_secs(2));
    let strategy = strategy_for(provider.clone(), Arc::new(FakeKube::new()), poll);
    let host = AgentHost {
        node_name: "gke-default-pool-1".to_string(),
        namespace: "turndown".to_string(),
        deployment: "cluster-turndown".to_string(),
    };
    let manager = Arc::new(TurndownManager::new(strategy, store.clone(), host).unwrap());
    ApiState {
        scheduler: Arc::new(TurndownScheduler::new(store.clone(), manager)),
        store,
        provider: ProviderKind::Gke,
    }
}

async fn call(state: &ApiState, req: Request<Body>) -> (StatusCode, Value) {
    let resp = build_router(state.clone()).oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_for_phase(state: &ApiState, phase: TurndownPhase) {
    for _ in 0..200 {
        if state.scheduler.manager().phase() == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("phase never reached {phase}");
}

#[tokio::test]
async fn open_window_turns_down_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("turndown.redb");
    let provider = cluster();

    {
        let state = agent(&provider, &path);
        let start = Utc::now() - chrono::Duration::minutes(1);
        let (status, body) = call(&state, post("/schedule", json!({ "start": start, "duration": "1h" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["state"], "active");

        wait_for_phase(&state, TurndownPhase::TurnedDown).await;
        assert_eq!(provider.singleton_creations(), 1);
        assert_eq!(provider.pool("default-pool").unwrap().node_count, 0);
        assert_eq!(provider.pool("highmem").unwrap().node_count, 0);

        // Let the background turndown task release its handles.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Restart inside the window: nothing is resized again.
    let state = agent(&provider, &path);
    let req = Request::get("/status").body(Body::empty()).unwrap();
    let (status, body) = call(&state, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["phase"], "turned_down");
    assert_eq!(body["data"]["schedule"]["state"], "active");

    state.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(provider.set_calls().len(), 1);

    // Cancel restores the recorded sizes.
    let (status, body) = call(&state, post("/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "cancelled");
    assert_eq!(state.scheduler.manager().phase(), TurndownPhase::Normal);
    assert_eq!(provider.pool("default-pool").unwrap().node_count, 3);
    assert_eq!(provider.pool("highmem").unwrap().node_count, 1);
}

#[tokio::test]
async fn future_window_waits_for_its_start() {
    let dir = tempfile::tempdir().unwrap();
    let provider = cluster();
    let state = agent(&provider, &dir.path().join("turndown.redb"));

    let start = Utc::now() + chrono::Duration::hours(2);
    let end = start + chrono::Duration::hours(8);
    let (status, _) = call(&state, post("/schedule", json!({ "start": start, "end": end }))).await;
    assert_eq!(status, StatusCode::CREATED);

    state.scheduler.tick(Utc::now()).await.unwrap();
    assert!(provider.set_calls().is_empty());

    state.scheduler.tick(start).await.unwrap();
    assert_eq!(state.scheduler.manager().phase(), TurndownPhase::TurnedDown);

    state.scheduler.tick(end).await.unwrap();
    assert_eq!(state.scheduler.manager().phase(), TurndownPhase::Normal);
    assert_eq!(provider.reset_calls().len(), 1);

    let (status, _) = call(&state, post("/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
