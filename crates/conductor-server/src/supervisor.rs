//! Process lifecycle: startup, migration, repair, recovery, shutdown.
//!
//! Startup order matters: the store is opened and repaired first, the
//! gateway starts listening, stale tasks are recovered once the callback
//! endpoint is reachable, and only then does the scheduler start claiming.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use conductor_core::agent::{AgentInvoker, CliAgent};
use conductor_core::bus::{self, EventBus};
use conductor_core::git;
use conductor_core::plan::PlanService;
use conductor_core::runtime::{ContainerRuntime, DockerRuntime, HOST_GATEWAY_ALIAS};
use conductor_core::scheduler::{Scheduler, SchedulerConfig};
use conductor_store::Store;
use conductor_store::models::{DispatcherEvent, NewProject, Origin, Project, ProjectStatus};

use crate::config::ServerConfig;
use crate::context::{AppContext, Ctx, blocking};
use crate::routes;

/// Repo-local instructions file for agents; kept out of commits via the
/// repository's git exclude.
pub const AGENT_INSTRUCTIONS_FILE: &str = "AGENT_INSTRUCTIONS.md";

/// Run the engine until a shutdown signal arrives.
pub async fn run(config: ServerConfig) -> Result<()> {
    let store = Arc::new(
        Store::open(&config.data_dir)
            .with_context(|| format!("failed to open data dir {}", config.data_dir.display()))?,
    );
    let bus = Arc::new(EventBus::new());

    if let Some(quarantine) = store.quarantined_registry() {
        system_event(
            &bus,
            format!("quarantined projects.json (saved as {quarantine})"),
        );
    }

    migrate_legacy_layout(&store, &bus)?;
    repair_projects(&store);

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new());
    let agent: Arc<dyn AgentInvoker> = Arc::new(CliAgent::new(
        config.agent_binary.clone(),
        config.agent_env.clone(),
    ));

    let scheduler_config = SchedulerConfig {
        worker_count: config.worker_count,
        worker_image: config.worker_image.clone(),
        callback_base: format!("http://{HOST_GATEWAY_ALIAS}:{}", config.web_port),
        task_timeout: std::time::Duration::from_secs(config.task_timeout_minutes * 60),
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&runtime),
        Arc::clone(&agent),
        config.callback_secret.clone(),
        scheduler_config,
    );
    let plan = Arc::new(PlanService::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&agent),
    ));

    let ctx: Ctx = Arc::new(AppContext {
        store: Arc::clone(&store),
        bus: Arc::clone(&bus),
        scheduler: Arc::clone(&scheduler),
        plan,
        config: Arc::new(config.clone()),
    });

    // Projects interrupted mid-clone by a previous crash get another go.
    for project in store.list_projects()? {
        if project.status == ProjectStatus::Cloning {
            spawn_provision(Arc::clone(&ctx), project);
        }
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.web_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("gateway listening on http://{addr}");

    // Recover only once the callback endpoint is reachable again.
    let alive = runtime.list_alive().await.unwrap_or_default();
    let live_workers: HashSet<String> = alive
        .iter()
        .filter_map(|handle| worker_id_from_container(&handle.name))
        .collect();
    let recover_store = Arc::clone(&store);
    let recovered = blocking(move || recover_store.recover_stale(&live_workers)).await?;
    for task in &recovered {
        system_event(&bus, format!("recovered stale task {} to pending", task.id));
    }

    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run());

    let app = routes::build_router(Arc::clone(&ctx));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("gateway failed")?;

    tracing::info!("shutting down");
    scheduler.cancel_token().cancel();
    let _ = scheduler_task.await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn system_event(bus: &EventBus, message: impl Into<String>) {
    let event = DispatcherEvent::now("system", message);
    tracing::info!("{}", event.message);
    bus.publish(
        bus::TOPIC_SYSTEM,
        serde_json::to_value(&event).expect("dispatcher event serializes"),
    );
}

// ---------------------------------------------------------------------------
// Legacy migration
// ---------------------------------------------------------------------------

/// Move a pre-multi-project layout (a bare `tasks.json` and `repo/` at the
/// data root) under a freshly registered `default` project.
fn migrate_legacy_layout(store: &Store, bus: &EventBus) -> Result<()> {
    let data = store.data_dir();
    let legacy_tasks = data.legacy_tasks_file();
    if !legacy_tasks.exists() || !store.list_projects()?.is_empty() {
        return Ok(());
    }

    let raw = std::fs::read_to_string(&legacy_tasks)?;
    let Ok(mut tasks) = serde_json::from_str::<Vec<serde_json::Value>>(&raw) else {
        tracing::warn!("legacy tasks.json does not parse; leaving it in place");
        return Ok(());
    };

    let project = store.create_project(NewProject {
        name: "default".to_string(),
        origin: Origin::New,
        auto_merge: false,
        auto_push: false,
    })?;

    for task in tasks.iter_mut() {
        if let Some(obj) = task.as_object_mut() {
            obj.insert("project_id".to_string(), json!(project.id));
            if !obj.contains_key("branch") {
                let id = obj.get("id").and_then(|v| v.as_str()).unwrap_or("t-000000");
                obj.insert("branch".to_string(), json!(format!("agent/{id}")));
            }
            if !obj.contains_key("title") {
                let description = obj
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("migrated task");
                obj.insert(
                    "title".to_string(),
                    json!(description.lines().next().unwrap_or("migrated task")),
                );
            }
        }
    }
    std::fs::write(
        data.tasks_file(&project.id),
        serde_json::to_vec_pretty(&tasks)?,
    )?;

    // A legacy repo moves wholesale under the new project.
    let legacy_repo = data.root().join("repo");
    if legacy_repo.exists() {
        let target = data.repo_dir(&project.id);
        let _ = std::fs::remove_dir_all(&target);
        std::fs::rename(&legacy_repo, &target)?;
        let _ = store.update_project(&project.id, |p| p.status = ProjectStatus::Ready);
    }

    std::fs::rename(&legacy_tasks, legacy_tasks.with_extension("json.migrated"))?;
    system_event(
        bus,
        format!("migrated legacy single-project layout into {}", project.id),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Repair
// ---------------------------------------------------------------------------

/// Idempotent per-project repair at startup.
fn repair_projects(store: &Store) {
    let projects = match store.list_projects() {
        Ok(projects) => projects,
        Err(e) => {
            tracing::error!(error = %e, "cannot list projects for repair");
            return;
        }
    };

    for project in projects {
        let data = store.data_dir();
        for dir in [data.logs_dir(&project.id), data.worktrees_dir(&project.id)] {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                tracing::warn!(path = %dir.display(), error = %e, "repair: mkdir failed");
            }
        }
        let tasks_file = data.tasks_file(&project.id);
        if !tasks_file.exists() {
            let _ = std::fs::write(&tasks_file, "[]");
        }

        let repo = data.repo_dir(&project.id);
        if repo.join(".git").exists() {
            if git::has_remote(&repo).unwrap_or(false) {
                if let Err(e) = git::fetch(&repo, "origin") {
                    tracing::warn!(project_id = %project.id, error = %e, "repair: fetch failed");
                }
            }
            if let Err(e) = git::ensure_excluded(&repo, AGENT_INSTRUCTIONS_FILE) {
                tracing::warn!(project_id = %project.id, error = %e, "repair: exclude failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stale-task recovery
// ---------------------------------------------------------------------------

/// Container names look like `conductor-worker-3-t-000042`; recover tasks
/// whose worker has no such live container.
fn worker_id_from_container(name: &str) -> Option<String> {
    let rest = name.strip_prefix("conductor-")?;
    let mut parts = rest.split('-');
    let worker = parts.next()?;
    let index = parts.next()?;
    if worker != "worker" || index.parse::<u32>().is_err() {
        return None;
    }
    Some(format!("worker-{index}"))
}

// ---------------------------------------------------------------------------
// Project provisioning
// ---------------------------------------------------------------------------

/// Run the async clone/init for a new or retried project.
pub fn spawn_provision(ctx: Ctx, project: Project) {
    tokio::spawn(async move {
        let store = Arc::clone(&ctx.store);
        let repo = store.data_dir().repo_dir(&project.id);
        let origin = project.origin.clone();

        let result = blocking(move || provision_repo(&repo, &origin)).await;

        let project_id = project.id.clone();
        let update = match &result {
            Ok(()) => {
                let store = Arc::clone(&ctx.store);
                blocking(move || {
                    store.update_project(&project_id, |p| {
                        p.status = ProjectStatus::Ready;
                        p.last_error = None;
                    })
                })
                .await
            }
            Err(reason) => {
                let reason = reason.clone();
                let store = Arc::clone(&ctx.store);
                blocking(move || {
                    store.update_project(&project_id, |p| {
                        p.status = ProjectStatus::Error;
                        p.last_error = Some(reason.clone());
                    })
                })
                .await
            }
        };
        if let Err(e) = update {
            tracing::error!(error = %e, "failed to record provisioning outcome");
        }

        match result {
            Ok(()) => system_event(&ctx.bus, format!("project {} ready", project.name)),
            Err(reason) => system_event(
                &ctx.bus,
                format!("project {} failed to provision: {reason}", project.name),
            ),
        }
    });
}

/// Blocking clone/init plus first repair.
fn provision_repo(repo: &std::path::Path, origin: &Origin) -> Result<(), String> {
    if repo.join(".git").exists() {
        // Already materialized (engine restart); nothing to clone.
    } else {
        // Clear partial state from an interrupted clone.
        if repo.exists() {
            std::fs::remove_dir_all(repo).map_err(|e| e.to_string())?;
        }
        match origin {
            Origin::Git { url, branch } => {
                git::clone_repo(url, Some(branch), repo).map_err(|e| e.excerpt())?;
            }
            Origin::Local { path } => {
                git::clone_repo(path, None, repo).map_err(|e| e.excerpt())?;
            }
            Origin::New => {
                git::init_repo(repo, "main").map_err(|e| e.excerpt())?;
            }
        }
    }
    git::ensure_identity(repo).map_err(|e| e.excerpt())?;
    git::ensure_excluded(repo, AGENT_INSTRUCTIONS_FILE).map_err(|e| e.excerpt())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn container_name_parsing() {
        assert_eq!(
            worker_id_from_container("conductor-worker-3-t-000042"),
            Some("worker-3".to_string())
        );
        assert_eq!(
            worker_id_from_container("conductor-worker-0-t-000001"),
            Some("worker-0".to_string())
        );
        assert_eq!(worker_id_from_container("conductor-other-3"), None);
        assert_eq!(worker_id_from_container("unrelated"), None);
        assert_eq!(worker_id_from_container("conductor-worker-x-t"), None);
    }

    #[test]
    fn provision_new_repo_initializes_git() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        provision_repo(&repo, &Origin::New).unwrap();
        assert!(repo.join(".git").exists());
        // Idempotent on restart.
        provision_repo(&repo, &Origin::New).unwrap();

        let exclude = std::fs::read_to_string(repo.join(".git/info/exclude")).unwrap();
        assert!(exclude.contains(AGENT_INSTRUCTIONS_FILE));
    }

    #[test]
    fn provision_clones_local_origin() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        git::init_repo(&source, "main").unwrap();
        std::fs::write(source.join("file.txt"), "data\n").unwrap();
        git::commit_all(&source, "seed").unwrap();

        let repo = dir.path().join("repo");
        provision_repo(
            &repo,
            &Origin::Local {
                path: source.to_string_lossy().into_owned(),
            },
        )
        .unwrap();
        assert!(repo.join("file.txt").exists());
    }

    #[test]
    fn provision_reports_clone_failure() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        let err = provision_repo(
            &repo,
            &Origin::Git {
                url: "/nonexistent/upstream.git".to_string(),
                branch: "main".to_string(),
            },
        )
        .unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn migrate_legacy_creates_default_project() {
        let dir = TempDir::new().unwrap();
        let legacy = serde_json::json!([
            {
                "id": "t-000001",
                "description": "legacy work item",
                "status": "pending",
                "created_at": "2025-01-01T00:00:00Z"
            }
        ]);
        std::fs::write(
            dir.path().join("tasks.json"),
            serde_json::to_vec_pretty(&legacy).unwrap(),
        )
        .unwrap();

        let store = Store::open(dir.path()).unwrap();
        let bus = EventBus::new();
        migrate_legacy_layout(&store, &bus).unwrap();

        let projects = store.list_projects().unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "default");

        let tasks = store.list_tasks(&projects[0].id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "t-000001");
        assert_eq!(tasks[0].project_id, projects[0].id);
        assert_eq!(tasks[0].branch, "agent/t-000001");
        assert_eq!(tasks[0].title, "legacy work item");

        // Original file is parked, not deleted.
        assert!(!dir.path().join("tasks.json").exists());
        assert!(dir.path().join("tasks.json.migrated").exists());

        // Second startup is a no-op.
        migrate_legacy_layout(&store, &bus).unwrap();
        assert_eq!(store.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn repair_recreates_missing_dirs() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let project = store
            .create_project(NewProject {
                name: "p".to_string(),
                origin: Origin::New,
                auto_merge: false,
                auto_push: false,
            })
            .unwrap();

        std::fs::remove_dir_all(store.data_dir().logs_dir(&project.id)).unwrap();
        std::fs::remove_file(store.data_dir().tasks_file(&project.id)).unwrap();

        repair_projects(&store);
        assert!(store.data_dir().logs_dir(&project.id).exists());
        assert!(store.data_dir().tasks_file(&project.id).exists());
        assert!(store.list_tasks(&project.id).unwrap().is_empty());
    }
}
