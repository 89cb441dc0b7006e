//! Read-only git views plus the manual push action.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use conductor_core::git::{self, CommitInfo, DiffEntry};
use conductor_core::git::graph::{self, GraphRow};

use crate::context::{Ctx, blocking};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogResponse {
    pub commits: Vec<CommitInfo>,
    /// Lane layout for the graph rendering, parallel to `commits`.
    pub graph: Vec<GraphRow>,
}

#[derive(Debug, Serialize)]
pub struct CommitResponse {
    pub body: String,
    pub files: Vec<DiffEntry>,
}

#[derive(Debug, Serialize)]
pub struct UnpushedResponse {
    pub count: u64,
    pub has_remote: bool,
}

pub async fn log(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogResponse>, AppError> {
    let store = Arc::clone(&ctx.store);
    let pid_check = pid.clone();
    blocking(move || store.get_project(&pid_check)).await?;

    let repo = ctx.store.data_dir().repo_dir(&pid);
    let limit = query.limit.unwrap_or(50).min(500);
    let commits = blocking(move || git::log_commits(&repo, limit))
        .await
        .map_err(AppError::internal)?;
    let graph = graph::layout(&commits);
    Ok(Json(LogResponse { commits, graph }))
}

pub async fn commit(
    State(ctx): State<Ctx>,
    Path((pid, sha)): Path<(String, String)>,
) -> Result<Json<CommitResponse>, AppError> {
    let store = Arc::clone(&ctx.store);
    let pid_check = pid.clone();
    blocking(move || store.get_project(&pid_check)).await?;

    if !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::bad_request("sha must be hexadecimal"));
    }
    let repo = ctx.store.data_dir().repo_dir(&pid);
    let (body, files) = blocking(move || git::commit_details(&repo, &sha))
        .await
        .map_err(|e| AppError::not_found(e.excerpt()))?;
    Ok(Json(CommitResponse { body, files }))
}

pub async fn unpushed(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
) -> Result<Json<UnpushedResponse>, AppError> {
    let store = Arc::clone(&ctx.store);
    let pid_check = pid.clone();
    blocking(move || store.get_project(&pid_check)).await?;

    let repo = ctx.store.data_dir().repo_dir(&pid);
    let response = blocking(move || {
        let has_remote = git::has_remote(&repo).unwrap_or(false);
        let count = if has_remote {
            git::unpushed_count(&repo).unwrap_or(0)
        } else {
            0
        };
        UnpushedResponse { count, has_remote }
    })
    .await;
    Ok(Json(response))
}

pub async fn push(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    ctx.scheduler
        .push_base(&pid)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "pushed": true })))
}
