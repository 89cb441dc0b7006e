//! The control loop: binds eligible tasks to worker slots and drives each
//! task's state machine to a terminal state.
//!
//! One ticking loop reconciles the worker pool and claims tasks; every
//! claimed task gets its own async task that prepares the worktree, launches
//! the container, forwards logs, supervises exit and callback, runs the
//! merge-test pipeline, and cleans up. Store access is blocking file I/O and
//! always goes through `spawn_blocking`; repository-root git operations are
//! serialized per project.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use conductor_store::models::{
    DispatcherEvent, Project, Task, TaskStatus, Worker, WorkerStatus,
};
use conductor_store::{Store, StoreError};

use crate::agent::AgentInvoker;
use crate::bus::{self, EventBus};
use crate::git::{self, MergeMode, MergeOutcome};
use crate::merge::{MergePhase, MergeTestEngine, MergeTestOutcome, MergeTestRequest};
use crate::progress::{self, CompletionEntry};
use crate::prompt::{self, PromptInputs};
use crate::runtime::{ContainerHandle, ContainerRuntime, Mount, WorkerSpec};
use crate::stream;
use crate::token;

/// Scheduler tuning knobs; defaults follow the engine conventions.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub tick_interval: Duration,
    /// Branch prefix for task branches (`agent/t-000001`).
    pub branch_prefix: String,
    pub worker_image: String,
    /// Base URL the container uses for the status callback.
    pub callback_base: String,
    /// Soft per-task timeout; projects may override in minutes.
    pub task_timeout: Duration,
    /// How long after container exit a status callback is still honored.
    pub callback_grace: Duration,
    /// SIGTERM-to-SIGKILL grace when stopping containers.
    pub stop_grace: Duration,
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            tick_interval: Duration::from_secs(1),
            branch_prefix: "agent".to_string(),
            worker_image: "conductor-worker:latest".to_string(),
            callback_base: "http://host.conductor.internal:8420".to_string(),
            task_timeout: Duration::from_secs(30 * 60),
            callback_grace: Duration::from_secs(30),
            stop_grace: Duration::from_secs(15),
            cpu_limit: None,
            memory_limit: None,
        }
    }
}

/// Result of a manual merge of a `merge_pending` task.
#[derive(Debug)]
pub enum ManualMergeOutcome {
    Merged(Task),
    /// The merge conflicted; the task stays `merge_pending`.
    Conflict { task: Task, details: String },
}

struct Inflight {
    project_id: String,
    task_id: String,
    handle: ContainerHandle,
}

/// The scheduler. Constructed once; shared via `Arc`.
pub struct Scheduler {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    runtime: Arc<dyn ContainerRuntime>,
    agent: Arc<dyn AgentInvoker>,
    token_secret: Vec<u8>,
    config: SchedulerConfig,
    workers: Mutex<Vec<Worker>>,
    inflight: Mutex<HashMap<String, Inflight>>,
    /// Serializes merge/fetch/push against each project's repo root.
    repo_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        runtime: Arc<dyn ContainerRuntime>,
        agent: Arc<dyn AgentInvoker>,
        token_secret: Vec<u8>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            runtime,
            agent,
            token_secret,
            config,
            workers: Mutex::new(Vec::new()),
            inflight: Mutex::new(HashMap::new()),
            repo_locks: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the loop and triggers container shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read-only snapshot of the worker pool for the gateway.
    pub fn workers_snapshot(&self) -> Vec<Worker> {
        self.workers.lock().expect("worker pool lock poisoned").clone()
    }

    /// Emit a dispatcher event to the system topic and the log.
    pub fn emit(&self, source: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(source, "{message}");
        let event = DispatcherEvent::now(source, message);
        self.bus.publish(
            bus::TOPIC_SYSTEM,
            serde_json::to_value(&event).expect("dispatcher event serializes"),
        );
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    pub async fn run(self: Arc<Self>) {
        self.emit("scheduler", format!("started with {} worker slots", self.config.worker_count));
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = Arc::clone(&self).tick().await {
                        tracing::error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        self.shutdown().await;
    }

    async fn tick(self: Arc<Self>) -> Result<(), StoreError> {
        self.reconcile_pool();

        let idle: Vec<String> = {
            let workers = self.workers.lock().expect("worker pool lock poisoned");
            workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Idle)
                .map(|w| w.id.clone())
                .collect()
        };

        for worker_id in idle {
            let store = Arc::clone(&self.store);
            let claim_worker = worker_id.clone();
            let claimed = tokio::task::spawn_blocking(move || store.claim_next_task(&claim_worker))
                .await
                .expect("claim task panicked")?;

            let Some((project, task)) = claimed else {
                continue;
            };

            self.emit("scheduler", format!("claimed {} by {}", task.id, worker_id));
            self.set_worker(&worker_id, |w| {
                w.status = WorkerStatus::Busy;
                w.task_id = Some(task.id.clone());
                w.task_title = Some(task.title.clone());
                w.last_activity = chrono::Utc::now();
            });

            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                scheduler.run_task(worker_id, project, task).await;
            });
        }
        Ok(())
    }

    /// Grow or shrink the slot list toward `worker_count`. Busy slots are
    /// never stopped; they drain first.
    fn reconcile_pool(&self) {
        let target = self.config.worker_count;
        let mut workers = self.workers.lock().expect("worker pool lock poisoned");
        while workers.len() < target {
            let index = workers.len();
            workers.push(Worker::idle(index));
        }
        for (index, worker) in workers.iter_mut().enumerate() {
            if index < target {
                if worker.status == WorkerStatus::Stopped {
                    worker.status = WorkerStatus::Idle;
                }
            } else if worker.status == WorkerStatus::Idle {
                worker.status = WorkerStatus::Stopped;
            }
        }
    }

    fn set_worker<F: FnOnce(&mut Worker)>(&self, worker_id: &str, mutate: F) {
        let mut workers = self.workers.lock().expect("worker pool lock poisoned");
        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
            mutate(worker);
        }
    }

    async fn shutdown(&self) {
        let handles: Vec<ContainerHandle> = {
            let inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.values().map(|i| i.handle.clone()).collect()
        };
        for handle in handles {
            if let Err(e) = self.runtime.stop(&handle, self.config.stop_grace).await {
                tracing::warn!(container = %handle.id, error = %e, "failed to stop container at shutdown");
            }
        }
        self.emit("scheduler", "stopped");
    }

    // -----------------------------------------------------------------------
    // One task, claim to terminal state
    // -----------------------------------------------------------------------

    async fn run_task(self: Arc<Self>, worker_id: String, project: Project, task: Task) {
        let outcome = self
            .execute_task(&worker_id, &project, &task)
            .await;

        if let Err(reason) = outcome {
            self.emit(&worker_id, format!("{} failed: {reason}", task.id));
            self.finalize_failure(&project.id, &task.id, &reason).await;
            self.cleanup_workspace(&project, &task, true).await;
        }

        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.remove(&worker_id);
        }
        self.set_worker(&worker_id, |w| {
            w.status = if w.status == WorkerStatus::Error {
                WorkerStatus::Error
            } else {
                WorkerStatus::Idle
            };
            w.completed += 1;
            w.task_id = None;
            w.task_title = None;
            w.container_id = None;
            w.last_activity = chrono::Utc::now();
        });
    }

    /// The full happy path; any error string becomes a task failure.
    async fn execute_task(
        &self,
        worker_id: &str,
        project: &Project,
        task: &Task,
    ) -> Result<(), String> {
        let data = self.store.data_dir();
        let repo = data.repo_dir(&project.id);
        let worktree = data.worktree_dir(&project.id, worker_id);

        // Worktree setup: clear any stale state, branch from the freshest base.
        let gitfile = {
            let repo = repo.clone();
            let worktree = worktree.clone();
            let branch = task.branch.clone();
            let base = project.base_branch().to_string();
            blocking(move || -> Result<String, String> {
                git::worktree_remove(&repo, &worktree).map_err(|e| e.excerpt())?;
                git::worktree_prune(&repo).map_err(|e| e.excerpt())?;
                git::delete_branch(&repo, &branch).map_err(|e| e.excerpt())?;
                let base_ref = choose_base_ref(&repo, &base);
                git::worktree_add(&repo, &branch, &worktree, &base_ref)
                    .map_err(|e| e.excerpt())?;
                git::ensure_identity(&worktree).map_err(|e| e.excerpt())?;
                git::gitfile_snapshot(&worktree).map_err(|e| e.excerpt())
            })
            .await?
        };

        // Prompt assembly, including experience context.
        let agent_prompt = {
            let repo = repo.clone();
            let store = Arc::clone(&self.store);
            let task = task.clone();
            let project_id = project.id.clone();
            blocking(move || {
                let experience = progress::recent_entries(&repo, progress::DEFAULT_ENTRIES);
                let others: Vec<(String, PathBuf)> = store
                    .list_projects()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|p| p.id != project_id)
                    .map(|p| {
                        let repo = store.data_dir().repo_dir(&p.id);
                        (p.name, repo)
                    })
                    .collect();
                let query = format!("{} {}", task.title, task.description);
                let cross_project = progress::cross_project_snippets(&others, &query);
                prompt::compose_worker_prompt(&PromptInputs {
                    task_id: task.id.clone(),
                    task_title: task.title.clone(),
                    description: task.description.clone(),
                    plan: task.plan_approved.then(|| task.plan.clone()).flatten(),
                    experience,
                    cross_project,
                    working_dir: "/workspace".to_string(),
                })
            })
            .await
        };

        // Launch the container.
        let spec = self.worker_spec(worker_id, project, task, &agent_prompt);
        let handle = self
            .start_container(&spec)
            .await
            .map_err(|e| format!("container start failed twice: {e}"))?;

        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.insert(
                worker_id.to_string(),
                Inflight {
                    project_id: project.id.clone(),
                    task_id: task.id.clone(),
                    handle: handle.clone(),
                },
            );
        }
        self.set_worker(worker_id, |w| w.container_id = Some(handle.id.clone()));

        self.update_task_status(&project.id, &task.id, TaskStatus::Running)
            .await
            .map_err(|e| e.to_string())?;
        self.emit(worker_id, format!("{} running in {}", task.id, handle.name));

        // Log forwarding: container stdout -> parser -> bus + jsonl sink.
        self.spawn_log_forwarder(worker_id, &project.id, &task.id, &handle)
            .await;

        // Supervise until exit, timeout or cancellation.
        let timeout = project
            .task_timeout_minutes
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(self.config.task_timeout);

        let exit_code = tokio::select! {
            code = self.runtime.wait(&handle) => match code {
                Ok(code) => code,
                Err(e) => return Err(format!("container wait failed: {e}")),
            },
            _ = tokio::time::sleep(timeout) => {
                let _ = self.runtime.stop(&handle, self.config.stop_grace).await;
                let minutes = timeout.as_secs() / 60;
                return Err(format!("exceeded {minutes} minutes"));
            }
            _ = self.cancel.cancelled() => {
                // Engine shutting down; leave the task for stale recovery.
                return Ok(());
            }
        };

        // Worktree-link integrity: the container must not have touched the
        // `.git` pointer.
        let intact = {
            let worktree = worktree.clone();
            blocking(move || git::gitfile_intact(&worktree, &gitfile)).await
        };
        if !intact {
            return Err("worktree corruption".to_string());
        }

        // Wait out the callback grace for the worker's status report.
        let status = self
            .await_callback(&project.id, &task.id, exit_code, &worktree)
            .await?;

        match status {
            TaskStatus::Merging => {
                self.emit(worker_id, format!("{} merging", task.id));
                self.merge_and_finish(worker_id, project, task, &repo, &worktree)
                    .await
            }
            TaskStatus::Cancelled => {
                self.cleanup_workspace(project, task, true).await;
                Ok(())
            }
            TaskStatus::Failed => {
                self.cleanup_workspace(project, task, true).await;
                self.emit(worker_id, format!("{} failed (worker report)", task.id));
                Ok(())
            }
            other => Err(format!("unexpected post-exit status {other}")),
        }
    }

    /// Start the container, retrying once on failure.
    async fn start_container(
        &self,
        spec: &WorkerSpec,
    ) -> Result<ContainerHandle, crate::runtime::RuntimeError> {
        match self.runtime.start(spec).await {
            Ok(handle) => Ok(handle),
            Err(first) => {
                tracing::warn!(error = %first, "container start failed, retrying once");
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.runtime.start(spec).await
            }
        }
    }

    fn worker_spec(
        &self,
        worker_id: &str,
        project: &Project,
        task: &Task,
        agent_prompt: &str,
    ) -> WorkerSpec {
        let data = self.store.data_dir();
        let repo = data.repo_dir(&project.id);
        let worktree = data.worktree_dir(&project.id, worker_id);
        let logs = data.logs_dir(&project.id);
        let callback_url = format!(
            "{}/api/internal/tasks/{}/{}/status",
            self.config.callback_base, project.id, task.id
        );

        let mut env = vec![
            ("TASK_ID".to_string(), task.id.clone()),
            ("TASK_TITLE".to_string(), task.title.clone()),
            ("TASK_DESCRIPTION".to_string(), task.description.clone()),
            ("PROJECT_ID".to_string(), project.id.clone()),
            ("PROJECT_NAME".to_string(), project.name.clone()),
            ("WORKER_ID".to_string(), worker_id.to_string()),
            ("BRANCH_NAME".to_string(), task.branch.clone()),
            ("CALLBACK_URL".to_string(), callback_url),
            (
                "WORKER_TOKEN".to_string(),
                token::generate(&self.token_secret, &task.id),
            ),
            ("CONDUCTOR_PROMPT".to_string(), agent_prompt.to_string()),
        ];
        if let Some(plan) = task.plan_approved.then(|| task.plan.clone()).flatten() {
            env.push(("TASK_PLAN".to_string(), plan));
        }

        WorkerSpec {
            name: format!("{worker_id}-{}", task.id),
            image: self.config.worker_image.clone(),
            workdir: "/workspace".to_string(),
            env,
            mounts: vec![
                Mount::read_only(&repo, "/repo"),
                Mount::read_write(&worktree, "/workspace"),
                Mount::read_write(&logs, "/logs"),
                // The pointer file is bound read-only over the rw worktree so
                // the agent cannot unlink or rewrite it.
                Mount::read_only(worktree.join(".git"), "/workspace/.git"),
            ],
            host_gateway: true,
            cpu_limit: self.config.cpu_limit,
            memory_limit: self.config.memory_limit.clone(),
            auto_remove: true,
            command: Vec::new(),
        }
    }

    async fn spawn_log_forwarder(
        &self,
        worker_id: &str,
        project_id: &str,
        task_id: &str,
        handle: &ContainerHandle,
    ) {
        let stream = match self.runtime.logs_stream(handle).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "could not attach to container logs");
                return;
            }
        };
        let bus = Arc::clone(&self.bus);
        let topic = bus::topic_log(worker_id);
        let log_path = self.store.data_dir().worker_log(project_id, worker_id);
        let worker_id = worker_id.to_string();
        let project_id = project_id.to_string();
        let task_id = task_id.to_string();

        tokio::spawn(async move {
            use futures::StreamExt;
            use tokio::io::AsyncWriteExt;

            let mut sink = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
                .ok();

            let mut stream = stream;
            while let Some(line) = stream.next().await {
                // The jsonl file is the post-mortem sink; the live path is
                // the parsed event on the bus.
                if let Some(ref mut sink) = sink {
                    let _ = sink.write_all(line.as_bytes()).await;
                    let _ = sink.write_all(b"\n").await;
                }
                for event in stream::parse_line(&line) {
                    let mut frame = event.to_value();
                    if let Some(obj) = frame.as_object_mut() {
                        obj.insert("worker_id".to_string(), worker_id.clone().into());
                        obj.insert("project_id".to_string(), project_id.clone().into());
                        obj.insert("task_id".to_string(), task_id.clone().into());
                    }
                    bus.publish(&topic, frame);
                }
            }
        });
    }

    /// Poll for the worker's status callback after container exit.
    ///
    /// Exit code 0 with no callback is healed by reading the worktree head
    /// (exit 0 means "commit made, ready to merge"); any other exit without
    /// a callback inside the grace window fails the task.
    async fn await_callback(
        &self,
        project_id: &str,
        task_id: &str,
        exit_code: i64,
        worktree: &std::path::Path,
    ) -> Result<TaskStatus, String> {
        let deadline = tokio::time::Instant::now() + self.config.callback_grace;
        loop {
            let current = {
                let store = Arc::clone(&self.store);
                let project_id = project_id.to_string();
                let task_id = task_id.to_string();
                blocking(move || store.get_task(&project_id, &task_id)).await
            }
            .map_err(|e| e.to_string())?;

            match current.status {
                TaskStatus::Merging | TaskStatus::Failed | TaskStatus::Cancelled => {
                    return Ok(current.status);
                }
                _ if tokio::time::Instant::now() >= deadline => {
                    if exit_code == 0 {
                        let head = {
                            let worktree = worktree.to_path_buf();
                            blocking(move || git::head_sha(&worktree)).await
                        }
                        .map_err(|e| e.excerpt())?;
                        let task = self
                            .store_update(project_id, task_id, move |task| {
                                task.transition_to(TaskStatus::Merging)?;
                                task.commit_id = Some(head.clone());
                                Ok(())
                            })
                            .await
                            .map_err(|e| e.to_string())?;
                        return Ok(task.status);
                    }
                    return Err("worker exited without status".to_string());
                }
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
    }

    /// Merge-test, then honor the project flags.
    async fn merge_and_finish(
        &self,
        worker_id: &str,
        project: &Project,
        task: &Task,
        repo: &std::path::Path,
        worktree: &std::path::Path,
    ) -> Result<(), String> {
        let engine = MergeTestEngine::new(Arc::clone(&self.agent));
        let (phase_tx, mut phase_rx) = mpsc::unbounded_channel();

        // Flip merging -> testing when the engine reaches its test stage.
        let phase_store = Arc::clone(&self.store);
        let phase_pid = project.id.clone();
        let phase_tid = task.id.clone();
        let phase_task = tokio::spawn(async move {
            while let Some(phase) = phase_rx.recv().await {
                if phase == MergePhase::Testing {
                    let store = Arc::clone(&phase_store);
                    let pid = phase_pid.clone();
                    let tid = phase_tid.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        store.update_task(&pid, &tid, |task| {
                            if task.status == TaskStatus::Merging {
                                task.transition_to(TaskStatus::Testing)?;
                            }
                            Ok(())
                        })
                    })
                    .await;
                }
            }
        });

        let outcome = engine
            .run(
                &MergeTestRequest {
                    worktree: worktree.to_path_buf(),
                    repo: repo.to_path_buf(),
                    base_branch: project.base_branch().to_string(),
                    agent_timeout: self.config.task_timeout,
                },
                Some(phase_tx),
            )
            .await;
        phase_task.abort();

        match outcome {
            MergeTestOutcome::Ok { final_sha } => {
                if project.auto_merge {
                    match self
                        .merge_into_base(project, task, MergeMode::NoFastForward, &final_sha)
                        .await?
                    {
                        MergeOutcome::Merged => {
                            self.emit(worker_id, format!("{} completed", task.id));
                            Ok(())
                        }
                        MergeOutcome::Conflict { details } => {
                            self.park_merge_pending(project, task, &final_sha, Some(&details))
                                .await?;
                            self.emit(worker_id, format!("{} merge_pending (conflict)", task.id));
                            Ok(())
                        }
                    }
                } else {
                    self.park_merge_pending(project, task, &final_sha, None).await?;
                    self.emit(worker_id, format!("{} merge_pending", task.id));
                    Ok(())
                }
            }
            MergeTestOutcome::Failed { reason } => Err(reason),
        }
    }

    /// Merge the task branch into the base branch in the repo root,
    /// push when configured, finish the task, clean up.
    async fn merge_into_base(
        &self,
        project: &Project,
        task: &Task,
        mode: MergeMode,
        final_sha: &str,
    ) -> Result<MergeOutcome, String> {
        let repo_lock = self.repo_lock(&project.id);
        let _guard = repo_lock.lock().await;

        let repo = self.store.data_dir().repo_dir(&project.id);
        let base = project.base_branch().to_string();
        let branch = task.branch.clone();
        let auto_push = project.auto_push;

        let outcome = {
            let repo = repo.clone();
            blocking(move || -> Result<MergeOutcome, String> {
                git::checkout(&repo, &base).map_err(|e| e.excerpt())?;
                let outcome = git::merge(&repo, &branch, mode).map_err(|e| e.excerpt())?;
                if outcome == MergeOutcome::Merged && auto_push {
                    match git::has_remote(&repo) {
                        Ok(true) => {
                            if let Err(e) = git::push(&repo, "origin", &base) {
                                tracing::warn!(error = %e, "push after merge failed");
                            }
                        }
                        _ => {}
                    }
                }
                Ok(outcome)
            })
            .await?
        };

        if outcome == MergeOutcome::Merged {
            let sha = final_sha.to_string();
            self.store_update(&project.id, &task.id, move |t| {
                if t.status == TaskStatus::Merging {
                    t.transition_to(TaskStatus::Testing)?;
                }
                t.transition_to(TaskStatus::Completed)?;
                t.commit_id = Some(sha.clone());
                Ok(())
            })
            .await
            .map_err(|e| e.to_string())?;

            self.record_completion(project, task).await;
            self.cleanup_workspace(project, task, true).await;
        }
        Ok(outcome)
    }

    /// Park a task as `merge_pending`, keeping its branch for a manual merge.
    async fn park_merge_pending(
        &self,
        project: &Project,
        task: &Task,
        final_sha: &str,
        conflict: Option<&str>,
    ) -> Result<(), String> {
        let sha = final_sha.to_string();
        let conflict = conflict.map(|c| c.to_string());
        self.store_update(&project.id, &task.id, move |t| {
            if t.status == TaskStatus::Merging {
                t.transition_to(TaskStatus::Testing)?;
            }
            t.transition_to(TaskStatus::MergePending)?;
            t.commit_id = Some(sha.clone());
            t.error = conflict.clone();
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?;
        self.cleanup_workspace(project, task, false).await;
        Ok(())
    }

    /// Append an experience-log entry for a completed task and commit it.
    async fn record_completion(&self, project: &Project, task: &Task) {
        let repo = self.store.data_dir().repo_dir(&project.id);
        let worker_id = task.worker_id.clone().unwrap_or_default();
        let replay = self.bus.replay(&bus::topic_log(&worker_id), bus::LOG_RING);
        let entry = derive_completion_entry(task, &replay);

        let result = blocking(move || -> Result<(), String> {
            progress::append_entry(&repo, &entry).map_err(|e| e.to_string())?;
            git::commit_all(&repo, &format!("progress: {}", entry.title))
                .map_err(|e| e.excerpt())?;
            Ok(())
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to record completion entry");
        }
    }

    /// Remove the worktree and optionally the branch.
    async fn cleanup_workspace(&self, project: &Project, task: &Task, delete_branch: bool) {
        let repo = self.store.data_dir().repo_dir(&project.id);
        let worker_id = task.worker_id.clone();
        let worktree = worker_id
            .as_deref()
            .map(|w| self.store.data_dir().worktree_dir(&project.id, w));
        let branch = task.branch.clone();
        let has_remote_branch = project.auto_push;

        let _ = blocking(move || {
            if let Some(worktree) = worktree {
                let _ = git::worktree_remove(&repo, &worktree);
            }
            let _ = git::worktree_prune(&repo);
            if delete_branch {
                let _ = git::delete_branch(&repo, &branch);
                if has_remote_branch && git::has_remote(&repo).unwrap_or(false) {
                    let _ = git::delete_remote_branch(&repo, "origin", &branch);
                }
            }
        })
        .await;
    }

    // -----------------------------------------------------------------------
    // External operations (gateway entry points)
    // -----------------------------------------------------------------------

    /// Cancel a task: mark it, stop its container, clean up.
    pub async fn cancel_task(&self, project_id: &str, task_id: &str) -> Result<Task, StoreError> {
        let task = self
            .store_update(project_id, task_id, |task| {
                task.transition_to(TaskStatus::Cancelled)
            })
            .await?;

        let handle = {
            let inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight
                .values()
                .find(|i| i.task_id == task_id && i.project_id == project_id)
                .map(|i| i.handle.clone())
        };
        if let Some(handle) = handle {
            if let Err(e) = self.runtime.stop(&handle, self.config.stop_grace).await {
                tracing::warn!(error = %e, "failed to stop cancelled container");
            }
        }

        let project = {
            let store = Arc::clone(&self.store);
            let pid = project_id.to_string();
            blocking(move || store.get_project(&pid)).await?
        };
        self.cleanup_workspace(&project, &task, true).await;
        self.emit("scheduler", format!("{task_id} cancelled"));
        Ok(task)
    }

    /// Retry a parked task: reset to `pending`, dropping the branch.
    pub async fn retry_task(&self, project_id: &str, task_id: &str) -> Result<Task, StoreError> {
        let task = self
            .store_update(project_id, task_id, |task| {
                if !task.status.is_retryable() {
                    return Err(StoreError::Conflict {
                        task_id: task.id.clone(),
                        from: task.status.to_string(),
                        to: TaskStatus::Pending.to_string(),
                    });
                }
                task.transition_to(TaskStatus::Pending)
            })
            .await?;

        let repo = self.store.data_dir().repo_dir(project_id);
        let branch = task.branch.clone();
        let _ = blocking(move || git::delete_branch(&repo, &branch)).await;
        self.emit("scheduler", format!("{task_id} queued for retry"));
        Ok(task)
    }

    /// Manual merge of a `merge_pending` task, optionally squashed.
    pub async fn merge_task(
        &self,
        project_id: &str,
        task_id: &str,
        squash: bool,
    ) -> Result<ManualMergeOutcome, StoreError> {
        let (project, task) = {
            let store = Arc::clone(&self.store);
            let pid = project_id.to_string();
            let tid = task_id.to_string();
            blocking(move || -> Result<(Project, Task), StoreError> {
                Ok((store.get_project(&pid)?, store.get_task(&pid, &tid)?))
            })
            .await?
        };
        if task.status != TaskStatus::MergePending {
            return Err(StoreError::Conflict {
                task_id: task.id.clone(),
                from: task.status.to_string(),
                to: "merge".to_string(),
            });
        }

        let mode = if squash {
            MergeMode::Squash
        } else {
            MergeMode::NoFastForward
        };
        let final_sha = task.commit_id.clone().unwrap_or_default();
        match self.merge_into_base(&project, &task, mode, &final_sha).await {
            Ok(MergeOutcome::Merged) => {
                let updated = {
                    let store = Arc::clone(&self.store);
                    let pid = project_id.to_string();
                    let tid = task_id.to_string();
                    blocking(move || store.get_task(&pid, &tid)).await?
                };
                self.emit("scheduler", format!("{task_id} merged manually"));
                Ok(ManualMergeOutcome::Merged(updated))
            }
            Ok(MergeOutcome::Conflict { details }) => {
                let updated = self
                    .store_update(project_id, task_id, |t| {
                        t.error = Some("manual merge conflict".to_string());
                        Ok(())
                    })
                    .await?;
                Ok(ManualMergeOutcome::Conflict {
                    task: updated,
                    details,
                })
            }
            Err(reason) => {
                let updated = self
                    .store_update(project_id, task_id, move |t| {
                        t.error = Some(reason.clone());
                        Ok(())
                    })
                    .await?;
                Ok(ManualMergeOutcome::Conflict {
                    task: updated,
                    details: "merge failed; see task error".to_string(),
                })
            }
        }
    }

    /// Push the project's base branch to origin, serialized with merges.
    pub async fn push_base(&self, project_id: &str) -> Result<(), String> {
        let project = {
            let store = Arc::clone(&self.store);
            let pid = project_id.to_string();
            blocking(move || store.get_project(&pid))
                .await
                .map_err(|e| e.to_string())?
        };
        let repo_lock = self.repo_lock(project_id);
        let _guard = repo_lock.lock().await;

        let repo = self.store.data_dir().repo_dir(project_id);
        let base = project.base_branch().to_string();
        blocking(move || -> Result<(), String> {
            if !git::has_remote(&repo).map_err(|e| e.excerpt())? {
                return Err("project has no remote".to_string());
            }
            git::push(&repo, "origin", &base).map_err(|e| e.excerpt())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn repo_lock(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.repo_locks.lock().expect("repo locks poisoned");
        Arc::clone(
            locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn update_task_status(
        &self,
        project_id: &str,
        task_id: &str,
        to: TaskStatus,
    ) -> Result<Task, StoreError> {
        self.store_update(project_id, task_id, move |task| task.transition_to(to))
            .await
    }

    async fn store_update<F>(
        &self,
        project_id: &str,
        task_id: &str,
        mutate: F,
    ) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task) -> Result<(), StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let project_id = project_id.to_string();
        let task_id = task_id.to_string();
        blocking(move || store.update_task(&project_id, &task_id, mutate)).await
    }

    /// Mark a task failed unless it already reached a terminal state.
    async fn finalize_failure(&self, project_id: &str, task_id: &str, reason: &str) {
        let reason = reason.to_string();
        let result = self
            .store_update(project_id, task_id, move |task| {
                if task.status.is_terminal() {
                    return Ok(());
                }
                // Walk forward to a state that can fail if needed.
                if task.status == TaskStatus::Claimed {
                    task.transition_to(TaskStatus::Running)?;
                }
                if task.status == TaskStatus::MergePending {
                    return Ok(());
                }
                task.transition_to(TaskStatus::Failed)?;
                task.error = Some(reason.clone());
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(task_id, error = %e, "failed to record task failure");
        }
    }
}

/// Resolve the freshest base ref: remote-tracking first, local branch next,
/// the current head as a last resort.
pub fn choose_base_ref(repo: &std::path::Path, base: &str) -> String {
    let remote_ref = format!("origin/{base}");
    if git::ref_sha(repo, &remote_ref).ok().flatten().is_some() {
        return remote_ref;
    }
    if git::ref_sha(repo, base).ok().flatten().is_some() {
        return base.to_string();
    }
    "HEAD".to_string()
}

/// Build a completion entry from the task record and its log replay.
fn derive_completion_entry(task: &Task, replay: &[serde_json::Value]) -> CompletionEntry {
    let mut problems: Vec<String> = Vec::new();
    let mut last_assistant = String::new();
    for frame in replay {
        match frame.get("type").and_then(|t| t.as_str()) {
            Some("error") => {
                if let Some(message) = frame.get("message").and_then(|m| m.as_str()) {
                    problems.push(message.to_string());
                }
            }
            Some("assistant") => {
                if let Some(text) = frame.get("text").and_then(|t| t.as_str()) {
                    last_assistant = text.to_string();
                }
            }
            _ => {}
        }
    }

    let problem = if problems.is_empty() {
        "nothing notable; the task went through cleanly".to_string()
    } else {
        problems.join("; ")
    };
    let solution = if last_assistant.is_empty() {
        format!("committed on branch {}", task.branch)
    } else {
        last_assistant.clone()
    };
    let prevention = if problems.is_empty() {
        format!("task \"{}\" is a clean reference for similar changes", task.title)
    } else {
        last_assistant
    };

    CompletionEntry {
        title: task.title.clone(),
        problem,
        solution,
        prevention: if prevention.is_empty() {
            "review the errors above before similar work".to_string()
        } else {
            prevention
        },
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f)
        .await
        .expect("blocking task panicked")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_entry_without_log_frames() {
        let task = sample_task();
        let entry = derive_completion_entry(&task, &[]);
        assert_eq!(entry.title, "sample task");
        assert!(entry.problem.contains("nothing notable"));
        assert!(entry.solution.contains("agent/t-000001"));
        assert!(!entry.prevention.is_empty());
    }

    #[test]
    fn derive_entry_collects_errors_and_last_assistant() {
        let task = sample_task();
        let replay = vec![
            serde_json::json!({"type":"error","message":"npm install flaked"}),
            serde_json::json!({"type":"assistant","text":"first note"}),
            serde_json::json!({"type":"assistant","text":"retried install with cache disabled"}),
        ];
        let entry = derive_completion_entry(&task, &replay);
        assert!(entry.problem.contains("npm install flaked"));
        assert_eq!(entry.solution, "retried install with cache disabled");
        assert_eq!(entry.prevention, "retried install with cache disabled");
    }

    #[test]
    fn default_config_matches_conventions() {
        let config = SchedulerConfig::default();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.task_timeout, Duration::from_secs(1800));
        assert_eq!(config.callback_grace, Duration::from_secs(30));
        assert_eq!(config.stop_grace, Duration::from_secs(15));
        assert_eq!(config.branch_prefix, "agent");
    }

    fn sample_task() -> Task {
        Task {
            id: "t-000001".to_string(),
            project_id: "ab12cd34".to_string(),
            title: "sample task".to_string(),
            description: "do a thing".to_string(),
            priority: 0,
            depends_on: None,
            plan_mode: false,
            plan: None,
            plan_approved: false,
            plan_answers: None,
            plan_messages: Vec::new(),
            status: TaskStatus::Completed,
            worker_id: Some("worker-0".to_string()),
            branch: "agent/t-000001".to_string(),
            commit_id: Some("abc1234".to_string()),
            error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}
