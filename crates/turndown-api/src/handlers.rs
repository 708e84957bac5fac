//! REST API handlers.
//!
//! Every response uses the `{success, data?, error?}` envelope.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use turndown_core::{ProviderKind, parse_duration};
use turndown_scheduler::{ScheduleRequest, SchedulerError};
use turndown_state::{Repeat, Schedule, TurndownPhase};

use crate::{ApiState, SERVICE_KEY_HEADER};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn scheduler_error(e: &SchedulerError) -> Response {
    let status = match e {
        SchedulerError::InvalidRange(_) => StatusCode::BAD_REQUEST,
        SchedulerError::NoSchedule => StatusCode::NOT_FOUND,
        SchedulerError::State(_) | SchedulerError::Manager(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// Reject the request unless it carries the stored service key.
fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), Response> {
    let expected = match state.store.get_service_key() {
        Ok(Some(key)) => key,
        Ok(None) => return Ok(()),
        Err(e) => return Err(error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)),
    };
    let presented = headers.get(SERVICE_KEY_HEADER).and_then(|v| v.to_str().ok());
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        warn!("rejected request with missing or wrong service key");
        Err(error_response("invalid service key", StatusCode::UNAUTHORIZED))
    }
}

// ── Schedule ───────────────────────────────────────────────────

/// Schedule request body. Exactly one of `end` and `duration` is given.
#[derive(Debug, Deserialize)]
pub struct ScheduleBody {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub duration: Option<String>,
    #[serde(default)]
    pub repeat: Repeat,
}

impl ScheduleBody {
    fn into_request(self) -> Result<ScheduleRequest, SchedulerError> {
        let request = match (self.end, self.duration.as_deref()) {
            (Some(end), None) => ScheduleRequest::new(self.start, end),
            (None, Some(raw)) => {
                let duration = parse_duration(raw)
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .ok_or_else(|| SchedulerError::InvalidRange(format!("invalid duration {raw:?}")))?;
                ScheduleRequest::for_duration(self.start, duration)?
            }
            (Some(_), Some(_)) => {
                return Err(SchedulerError::InvalidRange(
                    "give either end or duration, not both".to_string(),
                ));
            }
            (None, None) => {
                return Err(SchedulerError::InvalidRange("end or duration is required".to_string()));
            }
        };
        Ok(request.repeating(self.repeat))
    }
}

/// POST /schedule
pub async fn start_schedule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<ScheduleBody>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let request = match body.into_request() {
        Ok(request) => request,
        Err(e) => return scheduler_error(&e),
    };
    match state.scheduler.start_schedule(request, Utc::now()).await {
        Ok(schedule) => (StatusCode::CREATED, ApiResponse::ok(schedule)).into_response(),
        Err(e) => scheduler_error(&e),
    }
}

/// POST /cancel
pub async fn cancel_schedule(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.scheduler.cancel_schedule(Utc::now()).await {
        Ok(schedule) => ApiResponse::ok(schedule).into_response(),
        Err(e) => scheduler_error(&e),
    }
}

// ── Service key ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ServiceKeyBody {
    pub key: String,
}

/// POST /serviceKey
pub async fn set_service_key(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<ServiceKeyBody>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    if body.key.trim().is_empty() {
        return error_response("service key must not be empty", StatusCode::BAD_REQUEST);
    }
    match state.store.put_service_key(&body.key) {
        Ok(()) => {
            info!("service key updated");
            ApiResponse::ok("stored").into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub phase: TurndownPhase,
    pub provider: ProviderKind,
    pub strategy: &'static str,
    pub node: String,
    pub schedule: Option<Schedule>,
}

/// GET /status
pub async fn status(State(state): State<ApiState>) -> Response {
    let manager = state.scheduler.manager();
    match state.scheduler.current_schedule() {
        Ok(schedule) => ApiResponse::ok(StatusView {
            phase: manager.phase(),
            provider: state.provider,
            strategy: manager.strategy_name(),
            node: manager.node_name().to_string(),
            schedule,
        })
        .into_response(),
        Err(e) => scheduler_error(&e),
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use turndown_core::NodePool;
    use turndown_manager::{AgentHost, TurndownManager, strategy_for};
    use turndown_provider::PollPolicy;
    use turndown_provider::testing::{FakeKube, FakeProvider};
    use turndown_scheduler::TurndownScheduler;
    use turndown_state::StateStore;

    use crate::build_router;

    fn test_state() -> ApiState {
        let provider = Arc::new(FakeProvider::new(ProviderKind::Gke).with_pool(NodePool::new("workers", 3, 3)));
        let store = StateStore::open_in_memory().unwrap();
        let strategy = strategy_for(
            provider,
            Arc::new(FakeKube::new()),
            PollPolicy::new(Duration::from_secs(1), Duration::from_secs(5)),
        );
        let host = AgentHost {
            node_name: "worker-1".to_string(),
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

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(state: &ApiState, req: Request<Body>) -> (StatusCode, Value) {
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn tomorrow() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::days(1)
    }

    #[tokio::test]
    async fn healthz_ok() {
        let state = test_state();
        let req = Request::get("/healthz").body(Body::empty()).unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn schedule_with_end_is_stored() {
        let state = test_state();
        let start = tomorrow();
        let end = start + chrono::Duration::hours(8);
        let (status, body) = send(
            &state,
            post("/schedule", json!({ "start": start, "end": end, "repeat": "daily" })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["state"], "pending");
        assert_eq!(body["data"]["repeat"], "daily");
        let stored = state.store.get_schedule().unwrap().unwrap();
        assert_eq!(stored.end, end);
    }

    #[tokio::test]
    async fn schedule_with_duration() {
        let state = test_state();
        let start = tomorrow();
        let (status, _) = send(&state, post("/schedule", json!({ "start": start, "duration": "8h" }))).await;

        assert_eq!(status, StatusCode::CREATED);
        let stored = state.store.get_schedule().unwrap().unwrap();
        assert_eq!(stored.end - stored.start, chrono::Duration::hours(8));
    }

    #[tokio::test]
    async fn schedule_rejects_bad_input() {
        let state = test_state();
        let start = tomorrow();

        let (status, body) = send(
            &state,
            post("/schedule", json!({ "start": start, "end": start - chrono::Duration::hours(1) })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send(&state, post("/schedule", json!({ "start": start }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, post("/schedule", json!({ "start": start, "duration": "soon" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(state.store.get_schedule().unwrap().is_none());
    }

    #[tokio::test]
    async fn huge_duration_is_rejected() {
        let state = test_state();
        let start = tomorrow();
        let (status, body) = send(
            &state,
            post("/schedule", json!({ "start": start, "duration": "100000000d" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(state.store.get_schedule().unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_without_schedule_is_not_found() {
        let state = test_state();
        let (status, body) = send(&state, post("/cancel", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn cancel_pending_schedule() {
        let state = test_state();
        let start = tomorrow();
        send(&state, post("/schedule", json!({ "start": start, "duration": "1h" }))).await;

        let (status, body) = send(&state, post("/cancel", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "cancelled");
    }

    #[tokio::test]
    async fn status_reports_phase_and_provider() {
        let state = test_state();
        let req = Request::get("/status").body(Body::empty()).unwrap();
        let (status, body) = send(&state, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["phase"], "normal");
        assert_eq!(body["data"]["provider"], "gke");
        assert_eq!(body["data"]["strategy"], "masterless");
        assert!(body["data"]["schedule"].is_null());
    }

    #[tokio::test]
    async fn service_key_guards_mutations() {
        let state = test_state();
        let (status, _) = send(&state, post("/serviceKey", json!({ "key": "s3cret" }))).await;
        assert_eq!(status, StatusCode::OK);

        let start = tomorrow();
        let (status, _) = send(&state, post("/schedule", json!({ "start": start, "duration": "1h" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::post("/schedule")
            .header("content-type", "application/json")
            .header("X-Service-Key", "s3cret")
            .body(Body::from(json!({ "start": start, "duration": "1h" }).to_string()))
            .unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::CREATED);

        // Status stays readable without the key.
        let req = Request::get("/status").body(Body::empty()).unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_service_key_rejected() {
        let state = test_state();
        let (status, _) = send(&state, post("/serviceKey", json!({ "key": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.store.get_service_key().unwrap().is_none());
    }
}
