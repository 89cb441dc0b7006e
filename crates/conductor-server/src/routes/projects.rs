//! Project endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};

use conductor_store::models::{NewProject, Origin, Project, ProjectStatus, TaskStatus};

use crate::context::{Ctx, blocking};
use crate::error::AppError;
use crate::supervisor;

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub source_type: String,
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(default)]
    pub auto_push: bool,
}

#[derive(Debug, Deserialize)]
pub struct SettingsPatch {
    pub auto_merge: Option<bool>,
    pub auto_push: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct LocalRepo {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ProjectStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub success_rate: f64,
    pub avg_duration_seconds: f64,
    pub failure_reasons: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn list(State(ctx): State<Ctx>) -> Result<Json<Vec<Project>>, AppError> {
    let store = Arc::clone(&ctx.store);
    Ok(Json(blocking(move || store.list_projects()).await?))
}

pub async fn create(
    State(ctx): State<Ctx>,
    Json(body): Json<CreateProject>,
) -> Result<Json<Project>, AppError> {
    let origin = match body.source_type.as_str() {
        "git" => Origin::Git {
            url: body
                .repo_url
                .clone()
                .ok_or_else(|| AppError::bad_request("repo_url is required for source_type=git"))?,
            branch: body.branch.clone().unwrap_or_else(|| "main".to_string()),
        },
        "local" => Origin::Local {
            path: body.repo_url.clone().ok_or_else(|| {
                AppError::bad_request("repo_url must carry the path for source_type=local")
            })?,
        },
        "new" => Origin::New,
        other => {
            return Err(AppError::bad_request(format!(
                "unknown source_type {other:?} (expected git, local or new)"
            )));
        }
    };

    let spec = NewProject {
        name: body.name,
        origin,
        auto_merge: body.auto_merge,
        auto_push: body.auto_push,
    };
    let store = Arc::clone(&ctx.store);
    let project = blocking(move || store.create_project(spec)).await?;

    // Clone/init runs asynchronously; the project flips to ready or error.
    supervisor::spawn_provision(Arc::clone(&ctx), project.clone());
    Ok(Json(project))
}

pub async fn remove(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    // Stop anything still running against this project first.
    let store = Arc::clone(&ctx.store);
    let pid_for_tasks = pid.clone();
    let tasks = blocking(move || store.list_tasks(&pid_for_tasks)).await?;
    for task in tasks.iter().filter(|t| t.status.is_active()) {
        let _ = ctx.scheduler.cancel_task(&pid, &task.id).await;
    }

    let store = Arc::clone(&ctx.store);
    let pid_for_delete = pid.clone();
    blocking(move || store.delete_project(&pid_for_delete)).await?;
    Ok(Json(serde_json::json!({ "deleted": pid })))
}

pub async fn retry(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
) -> Result<Json<Project>, AppError> {
    let store = Arc::clone(&ctx.store);
    let pid_clone = pid.clone();
    let project = blocking(move || {
        store.update_project(&pid_clone, |p| {
            p.status = ProjectStatus::Cloning;
            p.last_error = None;
        })
    })
    .await?;
    supervisor::spawn_provision(Arc::clone(&ctx), project.clone());
    Ok(Json(project))
}

pub async fn settings(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<Project>, AppError> {
    let store = Arc::clone(&ctx.store);
    let project = blocking(move || {
        store.update_project(&pid, |p| {
            if let Some(auto_merge) = patch.auto_merge {
                p.auto_merge = auto_merge;
            }
            if let Some(auto_push) = patch.auto_push {
                p.auto_push = auto_push;
            }
        })
    })
    .await?;
    Ok(Json(project))
}

/// Discover candidate local clones one level under the configured root.
pub async fn local_repos(State(ctx): State<Ctx>) -> Result<Json<Vec<LocalRepo>>, AppError> {
    let root = ctx.config.local_repo_root.clone();
    let repos = blocking(move || {
        let mut repos = Vec::new();
        let Ok(entries) = std::fs::read_dir(&root) else {
            return repos;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && path.join(".git").exists() {
                repos.push(LocalRepo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: path.to_string_lossy().into_owned(),
                });
            }
        }
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        repos
    })
    .await;
    Ok(Json(repos))
}

pub async fn stats(
    State(ctx): State<Ctx>,
    Path(pid): Path<String>,
) -> Result<Json<ProjectStats>, AppError> {
    let store = Arc::clone(&ctx.store);
    let tasks = blocking(move || store.list_tasks(&pid)).await?;

    let mut stats = ProjectStats {
        total: tasks.len(),
        completed: 0,
        failed: 0,
        cancelled: 0,
        in_progress: 0,
        pending: 0,
        success_rate: 0.0,
        avg_duration_seconds: 0.0,
        failure_reasons: HashMap::new(),
    };

    let mut durations = Vec::new();
    for task in &tasks {
        match task.status {
            TaskStatus::Completed => {
                stats.completed += 1;
                if let (Some(started), Some(completed)) = (task.started_at, task.completed_at) {
                    durations.push((completed - started).num_seconds().max(0) as f64);
                }
            }
            TaskStatus::Failed => {
                stats.failed += 1;
                let reason = task.error.clone().unwrap_or_else(|| "unknown".to_string());
                *stats.failure_reasons.entry(reason).or_insert(0) += 1;
            }
            TaskStatus::Cancelled => stats.cancelled += 1,
            status if status.is_active() => stats.in_progress += 1,
            _ => stats.pending += 1,
        }
    }

    let finished = stats.completed + stats.failed;
    if finished > 0 {
        stats.success_rate = stats.completed as f64 / finished as f64;
    }
    if !durations.is_empty() {
        stats.avg_duration_seconds = durations.iter().sum::<f64>() / durations.len() as f64;
    }
    Ok(Json(stats))
}
