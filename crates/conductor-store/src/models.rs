use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Cloning,
    Ready,
    Error,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cloning => "cloning",
            Self::Ready => "ready",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for ProjectStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloning" => Ok(Self::Cloning),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(StatusParseError("project status", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    PlanPending,
    PlanApproved,
    Claimed,
    Running,
    Merging,
    Testing,
    Completed,
    Failed,
    Cancelled,
    MergePending,
}

impl TaskStatus {
    /// Check whether `from -> to` is an edge in the task state graph.
    ///
    /// ```text
    /// pending       -> claimed | plan_pending
    /// plan_pending  -> plan_approved | pending   (rejection folds feedback in)
    /// plan_approved -> claimed
    /// claimed       -> running
    /// running       -> merging | failed
    /// merging       -> testing | completed | merge_pending | failed
    /// testing       -> completed | merge_pending | failed
    /// merge_pending -> completed | pending       (manual merge / retry)
    /// failed        -> pending                   (retry)
    /// cancelled     -> pending                   (retry)
    /// any non-terminal -> cancelled
    /// ```
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if to == Cancelled {
            return !matches!(from, Completed | Failed | Cancelled);
        }
        matches!(
            (from, to),
            (Pending, Claimed)
                | (Pending, PlanPending)
                | (PlanPending, PlanApproved)
                | (PlanPending, Pending)
                | (PlanApproved, Claimed)
                | (Claimed, Running)
                | (Running, Merging)
                | (Running, Failed)
                | (Merging, Testing)
                | (Merging, Completed)
                | (Merging, MergePending)
                | (Merging, Failed)
                | (Testing, Completed)
                | (Testing, MergePending)
                | (Testing, Failed)
                | (MergePending, Completed)
                | (MergePending, Pending)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }

    /// Statuses in which a task is bound to a worker slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Claimed | Self::Running | Self::Merging | Self::Testing
        )
    }

    /// Statuses from which no worker will ever touch the task again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses a task may be retried from.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::MergePending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::PlanPending => "plan_pending",
            Self::PlanApproved => "plan_approved",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Merging => "merging",
            Self::Testing => "testing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::MergePending => "merge_pending",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "plan_pending" => Ok(Self::PlanPending),
            "plan_approved" => Ok(Self::PlanApproved),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "merging" => Ok(Self::Merging),
            "testing" => Ok(Self::Testing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "merge_pending" => Ok(Self::MergePending),
            other => Err(StatusParseError("task status", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopped,
    Error,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(StatusParseError("worker status", other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid status string.
#[derive(Debug, Clone)]
pub struct StatusParseError(pub &'static str, pub String);

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.0, self.1)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// Where a project's repository comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    /// Cloned from a remote URL on the given branch.
    Git { url: String, branch: String },
    /// Copied from a directory already on this machine.
    Local { path: String },
    /// Freshly `git init`-ed empty repository.
    New,
}

impl Origin {
    /// Remote clone URL, present only for git origins.
    pub fn repo_url(&self) -> Option<&str> {
        match self {
            Self::Git { url, .. } => Some(url),
            Self::Local { .. } | Self::New => None,
        }
    }

    /// Base branch for the project. Local and new repos default to `main`.
    pub fn base_branch(&self) -> &str {
        match self {
            Self::Git { branch, .. } => branch,
            Self::Local { .. } | Self::New => "main",
        }
    }
}

/// A managed code repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Opaque 8-hex-char id assigned on creation.
    pub id: String,
    pub name: String,
    pub origin: Origin,
    /// Merge task branches into the base branch automatically.
    pub auto_merge: bool,
    /// Push the base branch after a successful auto-merge.
    pub auto_push: bool,
    pub status: ProjectStatus,
    /// Last clone or repair error, shown in the UI with a retry action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Per-project soft timeout override for running tasks, in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout_minutes: Option<u64>,
}

impl Project {
    pub fn base_branch(&self) -> &str {
        self.origin.base_branch()
    }
}

/// Creation spec for a project.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub origin: Origin,
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(default)]
    pub auto_push: bool,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One turn of a plan-refinement conversation, stored on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMessage {
    pub role: PlanRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRole {
    Assistant,
    User,
}

/// One unit of work scoped to a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Monotonic short id, unique across the whole store (`t-000123`).
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    /// Higher wins when claiming.
    #[serde(default)]
    pub priority: i64,
    /// Task id that must complete before this one becomes eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    /// Whether the task is gated on a human-approved plan.
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default)]
    pub plan_approved: bool,
    /// Recorded clarification answers from plan approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_answers: Option<serde_json::Value>,
    /// Full plan conversation transcript, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan_messages: Vec<PlanMessage>,
    pub status: TaskStatus,
    /// Worker slot executing the task; non-null iff the status is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Task branch, `<agent-prefix>/<task-id>`.
    pub branch: String,
    /// Result commit, set when the worker reports success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Apply a validated status transition, or fail with `Conflict` leaving
    /// the task untouched. Timestamps are maintained here so every caller
    /// gets the same bookkeeping.
    pub fn transition_to(&mut self, to: TaskStatus) -> Result<(), crate::StoreError> {
        if !TaskStatus::can_transition(self.status, to) {
            return Err(crate::StoreError::Conflict {
                task_id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        if to == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        if to == TaskStatus::Pending {
            // Retry or plan rejection: clear per-attempt state.
            self.worker_id = None;
            self.error = None;
            self.commit_id = None;
            self.started_at = None;
            self.completed_at = None;
        }
        if !to.is_active() {
            self.worker_id = None;
        }
        self.status = to;
        Ok(())
    }

    /// Derive a short title from the first line of a description.
    pub fn derive_title(description: &str) -> String {
        let first = description.lines().next().unwrap_or("").trim();
        let mut title: String = first.chars().take(72).collect();
        if first.chars().count() > 72 {
            title.push('…');
        }
        if title.is_empty() {
            title = "untitled task".to_string();
        }
        title
    }
}

/// Creation spec for a task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A container slot that executes one task at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Stable slot id, `worker-N`.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    /// Number of tasks this slot has finished since startup.
    #[serde(default)]
    pub completed: u64,
    pub last_activity: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl Worker {
    pub fn idle(index: usize) -> Self {
        let now = Utc::now();
        Self {
            id: format!("worker-{index}"),
            container_id: None,
            status: WorkerStatus::Idle,
            task_id: None,
            task_title: None,
            completed: 0,
            last_activity: now,
            started_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher event
// ---------------------------------------------------------------------------

/// Engine-level audit record, kept in a bounded in-memory ring only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherEvent {
    pub timestamp: DateTime<Utc>,
    /// `scheduler`, `worker-N` or `system`.
    pub source: String,
    pub message: String,
}

impl DispatcherEvent {
    pub fn now(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
