//! Worker-to-engine status callback.
//!
//! Accepted only from loopback or the container bridge network, and only
//! with a valid worker token scoped to the task. Callbacks are idempotent:
//! repeating `merging` for the same commit is a no-op.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use serde::Deserialize;

use conductor_core::token;
use conductor_store::models::{Task, TaskStatus};

use crate::context::{Ctx, blocking};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Loopback, or the RFC 1918 ranges container bridges live in.
fn allowed_source(ip: IpAddr) -> bool {
    match ip {
        ip if ip.is_loopback() => true,
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

pub async fn status_callback(
    State(ctx): State<Ctx>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((pid, tid)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> Result<Json<Task>, AppError> {
    if !allowed_source(addr.ip()) {
        return Err(AppError::forbidden("status callback from disallowed source"));
    }

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::forbidden("missing worker token"))?;
    let token_task = token::validate(&ctx.config.callback_secret, bearer)
        .map_err(|_| AppError::forbidden("invalid worker token"))?;
    if token_task != tid {
        return Err(AppError::forbidden("worker token is scoped to another task"));
    }

    let task = match body.status.as_str() {
        "merging" => {
            let commit = body.commit.clone();
            let store = Arc::clone(&ctx.store);
            blocking(move || {
                store.update_task(&pid, &tid, |task| {
                    // Repeated report of the same commit: nothing to do.
                    if task.status == TaskStatus::Merging && task.commit_id == commit {
                        return Ok(());
                    }
                    task.transition_to(TaskStatus::Merging)?;
                    task.commit_id = commit.clone();
                    Ok(())
                })
            })
            .await?
        }
        "failed" => {
            let error = body.error.clone();
            let store = Arc::clone(&ctx.store);
            blocking(move || {
                store.update_task(&pid, &tid, |task| {
                    if task.status == TaskStatus::Failed {
                        return Ok(());
                    }
                    task.transition_to(TaskStatus::Failed)?;
                    task.error = error.clone().or_else(|| Some("worker reported failure".to_string()));
                    Ok(())
                })
            })
            .await?
        }
        other => {
            return Err(AppError::bad_request(format!(
                "unsupported callback status {other:?} (expected merging or failed)"
            )));
        }
    };

    if let Some(branch) = body.branch {
        if branch != task.branch {
            tracing::warn!(
                task_id = %task.id,
                reported = %branch,
                expected = %task.branch,
                "worker reported an unexpected branch"
            );
        }
    }

    Ok(Json(task))
}
