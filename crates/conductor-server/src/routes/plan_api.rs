//! Plan endpoints. Generation and chat run in the background; the UI
//! follows the conversation on the plan WebSocket topic.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};

use conductor_store::models::Task;

use crate::context::{Ctx, blocking};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub task_id: String,
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub answers: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct BatchApproveBody {
    pub task_ids: Vec<String>,
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BatchEntry {
    pub task_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn generate(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<Task>, AppError> {
    // Validate the task exists before acknowledging.
    let store = Arc::clone(&ctx.store);
    let pid_check = pid.clone();
    let tid_check = body.task_id.clone();
    let task = blocking(move || store.get_task(&pid_check, &tid_check)).await?;

    let ctx_bg = Arc::clone(&ctx);
    tokio::spawn(async move {
        if let Err(e) = ctx_bg.plan.generate(&pid, &body.task_id).await {
            tracing::warn!(task_id = body.task_id, error = %e, "plan generation failed");
        }
    });
    Ok(Json(task))
}

pub async fn approve(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<Task>, AppError> {
    let ctx_clone = Arc::clone(&ctx);
    let task = blocking(move || {
        if body.approved {
            ctx_clone.plan.approve(&pid, &body.task_id, body.answers)
        } else {
            ctx_clone
                .plan
                .reject(&pid, &body.task_id, body.feedback.as_deref())
        }
    })
    .await?;
    Ok(Json(task))
}

pub async fn batch_approve(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
    Json(body): Json<BatchApproveBody>,
) -> Result<Json<Vec<BatchEntry>>, AppError> {
    let ctx_clone = Arc::clone(&ctx);
    let results = blocking(move || {
        ctx_clone
            .plan
            .batch(&pid, &body.task_ids, body.approved, body.feedback.as_deref())
    })
    .await;

    Ok(Json(
        results
            .into_iter()
            .map(|r| BatchEntry {
                task_id: r.task_id,
                ok: r.result.is_ok(),
                error: r.result.err().map(|e| e.to_string()),
            })
            .collect(),
    ))
}

pub async fn chat(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
    Json(body): Json<ChatBody>,
) -> Result<Json<Task>, AppError> {
    if body.message.trim().is_empty() {
        return Err(AppError::bad_request("message must not be empty"));
    }
    let store = Arc::clone(&ctx.store);
    let pid_check = pid.clone();
    let tid_check = body.task_id.clone();
    let task = blocking(move || store.get_task(&pid_check, &tid_check)).await?;

    let ctx_bg = Arc::clone(&ctx);
    tokio::spawn(async move {
        if let Err(e) = ctx_bg.plan.chat(&pid, &body.task_id, &body.message).await {
            tracing::warn!(task_id = body.task_id, error = %e, "plan chat failed");
        }
    });
    Ok(Json(task))
}
