//! turndown-api — HTTP control surface for the turndown agent.
//!
//! Thin axum handlers over [`TurndownScheduler`]: requests are parsed and
//! validated here, everything else is delegated.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/schedule` | Start (or replace) the turndown window |
//! | POST | `/cancel` | Cancel the live window |
//! | POST | `/serviceKey` | Set the shared service key |
//! | GET | `/status` | Manager phase, schedule and provider |
//! | GET | `/healthz` | Liveness |
//!
//! Once a service key is stored, the POST routes require a matching
//! `X-Service-Key` header.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use turndown_core::ProviderKind;
use turndown_scheduler::TurndownScheduler;
use turndown_state::StateStore;

/// Header carrying the shared service key.
pub const SERVICE_KEY_HEADER: &str = "x-service-key";

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub scheduler: Arc<TurndownScheduler>,
    pub provider: ProviderKind,
}

/// Build the control-surface router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/schedule", post(handlers::start_schedule))
        .route("/cancel", post(handlers::cancel_schedule))
        .route("/serviceKey", post(handlers::set_service_key))
        .route("/status", get(handlers::status))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
