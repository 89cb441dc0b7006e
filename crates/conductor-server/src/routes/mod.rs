//! REST surface of the gateway.

pub mod git_api;
pub mod internal;
pub mod plan_api;
pub mod projects;
pub mod tasks;
pub mod workers;

use axum::Router;
use axum::routing::{delete, get, patch, post};
use tower_http::cors::CorsLayer;

use crate::context::Ctx;

pub fn build_router(ctx: Ctx) -> Router {
    Router::new()
        .route("/api/projects", get(projects::list).post(projects::create))
        .route("/api/projects/{pid}", delete(projects::remove))
        .route("/api/projects/{pid}/retry", post(projects::retry))
        .route("/api/projects/{pid}/settings", patch(projects::settings))
        .route("/api/projects/{pid}/stats", get(projects::stats))
        .route("/api/local-repos", get(projects::local_repos))
        .route(
            "/api/projects/{pid}/tasks",
            get(tasks::list).post(tasks::create),
        )
        .route("/api/projects/{pid}/tasks/{tid}", delete(tasks::remove))
        .route("/api/projects/{pid}/tasks/{tid}/cancel", post(tasks::cancel))
        .route("/api/projects/{pid}/tasks/{tid}/retry", post(tasks::retry))
        .route("/api/projects/{pid}/tasks/{tid}/merge", post(tasks::merge))
        .route("/api/projects/{pid}/plan/generate", post(plan_api::generate))
        .route("/api/projects/{pid}/plan/approve", post(plan_api::approve))
        .route(
            "/api/projects/{pid}/plan/batch-approve",
            post(plan_api::batch_approve),
        )
        .route("/api/projects/{pid}/plan/chat", post(plan_api::chat))
        .route("/api/projects/{pid}/git/log", get(git_api::log))
        .route("/api/projects/{pid}/git/commit/{sha}", get(git_api::commit))
        .route("/api/projects/{pid}/git/unpushed", get(git_api::unpushed))
        .route("/api/projects/{pid}/git/push", post(git_api::push))
        .route("/api/workers", get(workers::list))
        .route("/api/dispatcher/events", get(workers::events))
        .route(
            "/api/internal/tasks/{pid}/{tid}/status",
            post(internal::status_callback),
        )
        .route("/ws/logs/{wid}", get(crate::ws::logs_ws))
        .route("/ws/plan/{pid}/{tid}", get(crate::ws::plan_ws))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
