//! Task endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use conductor_store::models::{NewTask, Task};

use crate::context::{Ctx, blocking};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct CreateTask {
    pub description: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct MergeBody {
    #[serde(default)]
    pub squash: bool,
}

pub async fn list(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
) -> Result<Json<Vec<Task>>, AppError> {
    let store = Arc::clone(&ctx.store);
    Ok(Json(blocking(move || store.list_tasks(&pid)).await?))
}

pub async fn create(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
    Json(body): Json<CreateTask>,
) -> Result<Json<Task>, AppError> {
    if body.description.trim().is_empty() {
        return Err(AppError::bad_request("description must not be empty"));
    }
    let spec = NewTask {
        description: body.description,
        title: body.title,
        priority: body.priority,
        depends_on: body.depends_on,
        plan_mode: body.plan_mode,
    };
    let store = Arc::clone(&ctx.store);
    let pid_clone = pid.clone();
    let task = blocking(move || store.create_task(&pid_clone, spec, "agent")).await?;

    // Plan-gated tasks start their planning conversation immediately; the UI
    // follows it on the plan topic.
    if task.plan_mode {
        let ctx = Arc::clone(&ctx);
        let task_id = task.id.clone();
        tokio::spawn(async move {
            if let Err(e) = ctx.plan.generate(&pid, &task_id).await {
                tracing::warn!(task_id, error = %e, "initial plan generation failed");
            }
        });
    }
    Ok(Json(task))
}

pub async fn remove(
    State(ctx): State<Ctx>,
    Path((pid, tid)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = Arc::clone(&ctx.store);
    let pid_check = pid.clone();
    let tid_check = tid.clone();
    let task = blocking(move || store.get_task(&pid_check, &tid_check)).await?;
    if task.status.is_active() {
        return Err(AppError::from(conductor_store::StoreError::Conflict {
            task_id: tid,
            from: task.status.to_string(),
            to: "deleted".to_string(),
        }));
    }

    let store = Arc::clone(&ctx.store);
    let tid_clone = tid.clone();
    blocking(move || store.delete_task(&pid, &tid_clone)).await?;
    Ok(Json(serde_json::json!({ "deleted": tid })))
}

pub async fn cancel(
    State(ctx): State<Ctx>,
    Path((pid, tid)): Path<(String, String)>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(ctx.scheduler.cancel_task(&pid, &tid).await?))
}

pub async fn retry(
    State(ctx): State<Ctx>,
    Path((pid, tid)): Path<(String, String)>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(ctx.scheduler.retry_task(&pid, &tid).await?))
}

pub async fn merge(
    State(ctx): State<Ctx>,
    Path((pid, tid)): Path<(String, String)>,
    body: Option<Json<MergeBody>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let squash = body.map(|Json(b)| b.squash).unwrap_or(false);
    match ctx.scheduler.merge_task(&pid, &tid, squash).await? {
        conductor_core::scheduler::ManualMergeOutcome::Merged(task) => {
            Ok(Json(serde_json::json!({ "merged": true, "task": task })))
        }
        conductor_core::scheduler::ManualMergeOutcome::Conflict { task, details } => Ok(Json(
            serde_json::json!({ "merged": false, "task": task, "conflict": details }),
        )),
    }
}
