//! File-backed registry of projects and tasks.
//!
//! One `projects.json` registry plus one `tasks.json` per project. Every
//! public operation acquires the exclusive sidecar lock for each file it
//! touches, reads, mutates, and writes back atomically (tempfile + rename
//! with an fsync before the rename). Cross-file operations acquire the
//! registry lock first and then per-project task locks in project-id order,
//! which is what makes `claim_next_task` linearizable across the store.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::StoreError;
use crate::lock::FileLock;
use crate::models::{
    NewProject, NewTask, Project, ProjectStatus, Task, TaskStatus,
};
use crate::paths::DataDir;

/// Priority ceiling applied when stale-task recovery boosts priority.
pub const RECOVERY_PRIORITY_CAP: i64 = 100;

/// The shape of `projects.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    projects: Vec<Project>,
    /// Monotonic counter backing task id allocation across all projects.
    #[serde(default)]
    next_task_seq: u64,
}

/// Durable project/task storage rooted at a data directory.
#[derive(Debug)]
pub struct Store {
    dir: DataDir,
    /// Set when `open` had to quarantine a malformed registry.
    quarantined: Option<String>,
}

impl Store {
    /// Open (or initialize) a store at `data_dir`.
    ///
    /// A malformed registry file is quarantined by renaming it to
    /// `projects.json.corrupt-<unix-ts>` and replaced with an empty registry;
    /// [`Store::quarantined_registry`] reports the quarantine file name so
    /// the supervisor can emit a dispatcher event.
    pub fn open(data_dir: impl Into<std::path::PathBuf>) -> Result<Self, StoreError> {
        let dir = DataDir::new(data_dir);
        std::fs::create_dir_all(dir.projects_dir())
            .map_err(|e| StoreError::io(dir.projects_dir(), e))?;

        let registry_path = dir.registry();
        let _lock = FileLock::acquire(&registry_path)?;

        let mut quarantined = None;
        if registry_path.exists() {
            let raw = std::fs::read_to_string(&registry_path)
                .map_err(|e| StoreError::io(&registry_path, e))?;
            if serde_json::from_str::<Registry>(&raw).is_err() {
                let name = format!("projects.json.corrupt-{}", Utc::now().timestamp());
                let quarantine_path = registry_path.with_file_name(&name);
                std::fs::rename(&registry_path, &quarantine_path)
                    .map_err(|e| StoreError::io(&registry_path, e))?;
                tracing::warn!(
                    quarantine = %quarantine_path.display(),
                    "quarantined malformed project registry"
                );
                quarantined = Some(name);
            }
        }
        if !registry_path.exists() {
            write_json_atomic(&registry_path, &Registry::default())?;
        }

        Ok(Self { dir, quarantined })
    }

    /// Name of the quarantine file created at open time, if any.
    pub fn quarantined_registry(&self) -> Option<&str> {
        self.quarantined.as_deref()
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.dir
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let _lock = FileLock::acquire(&self.dir.registry())?;
        Ok(self.load_registry()?.projects)
    }

    pub fn get_project(&self, project_id: &str) -> Result<Project, StoreError> {
        let _lock = FileLock::acquire(&self.dir.registry())?;
        let registry = self.load_registry()?;
        registry
            .projects
            .into_iter()
            .find(|p| p.id == project_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "project",
                id: project_id.to_string(),
            })
    }

    /// Create a project in `cloning` state and its on-disk skeleton.
    pub fn create_project(&self, spec: NewProject) -> Result<Project, StoreError> {
        let _lock = FileLock::acquire(&self.dir.registry())?;
        let mut registry = self.load_registry()?;

        let mut id = new_project_id();
        while registry.projects.iter().any(|p| p.id == id) {
            id = new_project_id();
        }

        let project = Project {
            id: id.clone(),
            name: spec.name,
            origin: spec.origin,
            auto_merge: spec.auto_merge,
            auto_push: spec.auto_push,
            status: ProjectStatus::Cloning,
            last_error: None,
            created_at: Utc::now(),
            task_timeout_minutes: None,
        };

        for dir in [
            self.dir.project_dir(&id),
            self.dir.worktrees_dir(&id),
            self.dir.logs_dir(&id),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        write_json_atomic(&self.dir.tasks_file(&id), &Vec::<Task>::new())?;

        registry.projects.push(project.clone());
        write_json_atomic(&self.dir.registry(), &registry)?;

        tracing::info!(project_id = %project.id, name = %project.name, "created project");
        Ok(project)
    }

    /// Apply a mutation to one project under the registry lock.
    pub fn update_project<F>(&self, project_id: &str, mutate: F) -> Result<Project, StoreError>
    where
        F: FnOnce(&mut Project),
    {
        let _lock = FileLock::acquire(&self.dir.registry())?;
        let mut registry = self.load_registry()?;
        let project = registry
            .projects
            .iter_mut()
            .find(|p| p.id == project_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "project",
                id: project_id.to_string(),
            })?;
        mutate(project);
        let updated = project.clone();
        write_json_atomic(&self.dir.registry(), &registry)?;
        Ok(updated)
    }

    /// Remove a project from the registry and delete its directory tree,
    /// cascading task deletion.
    pub fn delete_project(&self, project_id: &str) -> Result<(), StoreError> {
        let _lock = FileLock::acquire(&self.dir.registry())?;
        let mut registry = self.load_registry()?;
        let before = registry.projects.len();
        registry.projects.retain(|p| p.id != project_id);
        if registry.projects.len() == before {
            return Err(StoreError::NotFound {
                kind: "project",
                id: project_id.to_string(),
            });
        }
        write_json_atomic(&self.dir.registry(), &registry)?;

        let project_dir = self.dir.project_dir(project_id);
        if project_dir.exists() {
            std::fs::remove_dir_all(&project_dir).map_err(|e| StoreError::io(&project_dir, e))?;
        }
        tracing::info!(project_id, "deleted project");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>, StoreError> {
        // Registry lookup validates the project id and keeps lock ordering
        // (registry before task file) uniform across operations.
        self.get_project(project_id)?;
        let tasks_path = self.dir.tasks_file(project_id);
        let _lock = FileLock::acquire(&tasks_path)?;
        load_json(&tasks_path)
    }

    pub fn get_task(&self, project_id: &str, task_id: &str) -> Result<Task, StoreError> {
        self.list_tasks(project_id)?
            .into_iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            })
    }

    /// Create a task in `pending` state with a store-wide monotonic id.
    pub fn create_task(
        &self,
        project_id: &str,
        spec: NewTask,
        branch_prefix: &str,
    ) -> Result<Task, StoreError> {
        let registry_lock = FileLock::acquire(&self.dir.registry())?;
        let mut registry = self.load_registry()?;
        if !registry.projects.iter().any(|p| p.id == project_id) {
            return Err(StoreError::NotFound {
                kind: "project",
                id: project_id.to_string(),
            });
        }

        registry.next_task_seq += 1;
        let task_id = format!("t-{:06}", registry.next_task_seq);
        write_json_atomic(&self.dir.registry(), &registry)?;

        let title = spec
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| Task::derive_title(&spec.description));

        let task = Task {
            id: task_id.clone(),
            project_id: project_id.to_string(),
            title,
            description: spec.description,
            priority: spec.priority,
            depends_on: spec.depends_on,
            plan_mode: spec.plan_mode,
            plan: None,
            plan_approved: false,
            plan_answers: None,
            plan_messages: Vec::new(),
            status: TaskStatus::Pending,
            worker_id: None,
            branch: format!("{branch_prefix}/{task_id}"),
            commit_id: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let tasks_path = self.dir.tasks_file(project_id);
        let _tasks_lock = FileLock::acquire(&tasks_path)?;
        drop(registry_lock);
        let mut tasks: Vec<Task> = load_json(&tasks_path)?;
        tasks.push(task.clone());
        write_json_atomic(&tasks_path, &tasks)?;

        tracing::info!(project_id, task_id = %task.id, "created task");
        Ok(task)
    }

    /// Apply a mutation to one task under its file lock.
    ///
    /// The closure may fail (an invalid status transition returns
    /// `Conflict`), in which case nothing is written.
    pub fn update_task<F>(
        &self,
        project_id: &str,
        task_id: &str,
        mutate: F,
    ) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task) -> Result<(), StoreError>,
    {
        let tasks_path = self.dir.tasks_file(project_id);
        if !tasks_path.exists() {
            return Err(StoreError::NotFound {
                kind: "project",
                id: project_id.to_string(),
            });
        }
        let _lock = FileLock::acquire(&tasks_path)?;
        let mut tasks: Vec<Task> = load_json(&tasks_path)?;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            })?;
        mutate(task)?;
        let updated = task.clone();
        write_json_atomic(&tasks_path, &tasks)?;
        Ok(updated)
    }

    pub fn delete_task(&self, project_id: &str, task_id: &str) -> Result<(), StoreError> {
        let tasks_path = self.dir.tasks_file(project_id);
        if !tasks_path.exists() {
            return Err(StoreError::NotFound {
                kind: "project",
                id: project_id.to_string(),
            });
        }
        let _lock = FileLock::acquire(&tasks_path)?;
        let mut tasks: Vec<Task> = load_json(&tasks_path)?;
        let before = tasks.len();
        tasks.retain(|t| t.id != task_id);
        if tasks.len() == before {
            return Err(StoreError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            });
        }
        write_json_atomic(&tasks_path, &tasks)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// Atomically select the best eligible task across every project and
    /// transition it to `claimed` bound to `worker_id`.
    ///
    /// Eligible: `pending` (non-plan-mode) or `plan_approved`, dependency
    /// satisfied, project `ready`. Tie-break: higher priority, then earlier
    /// `created_at`, then lexicographic task id. The registry lock is held
    /// for the whole call, which serializes claimers; per-project task locks
    /// are taken in project-id order.
    pub fn claim_next_task(
        &self,
        worker_id: &str,
    ) -> Result<Option<(Project, Task)>, StoreError> {
        let _registry_lock = FileLock::acquire(&self.dir.registry())?;
        let registry = self.load_registry()?;

        let mut ready: Vec<&Project> = registry
            .projects
            .iter()
            .filter(|p| p.status == ProjectStatus::Ready)
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));

        let mut candidates: Vec<(Project, Task)> = Vec::new();
        for project in ready {
            let tasks_path = self.dir.tasks_file(&project.id);
            let _tasks_lock = FileLock::acquire(&tasks_path)?;
            let tasks: Vec<Task> = load_json(&tasks_path)?;
            for task in &tasks {
                if is_eligible(task, &tasks) {
                    candidates.push((project.clone(), task.clone()));
                }
            }
        }

        candidates.sort_by(|(_, a), (_, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        for (project, candidate) in candidates {
            let tasks_path = self.dir.tasks_file(&project.id);
            let _tasks_lock = FileLock::acquire(&tasks_path)?;
            let mut tasks: Vec<Task> = load_json(&tasks_path)?;
            // Revalidate: a cancel or delete may have slipped in between the
            // scan and this write (those paths do not take the registry lock).
            let snapshot = tasks.clone();
            let Some(task) = tasks.iter_mut().find(|t| t.id == candidate.id) else {
                continue;
            };
            if !is_eligible(task, &snapshot) {
                continue;
            }
            task.transition_to(TaskStatus::Claimed)?;
            task.worker_id = Some(worker_id.to_string());
            let claimed = task.clone();
            write_json_atomic(&tasks_path, &tasks)?;
            tracing::info!(
                project_id = %project.id,
                task_id = %claimed.id,
                worker_id,
                "claimed task"
            );
            return Ok(Some((project, claimed)));
        }

        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Return every task stuck in an active status whose worker has no live
    /// container to `pending`, boosting priority by one (capped).
    ///
    /// Runs at startup before the scheduler exists, so the transition
    /// bypasses the state graph deliberately: these rows describe work that
    /// was in flight when a previous process died.
    pub fn recover_stale(
        &self,
        live_workers: &HashSet<String>,
    ) -> Result<Vec<Task>, StoreError> {
        let _registry_lock = FileLock::acquire(&self.dir.registry())?;
        let registry = self.load_registry()?;

        let mut recovered = Vec::new();
        let mut projects: Vec<&Project> = registry.projects.iter().collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));

        for project in projects {
            let tasks_path = self.dir.tasks_file(&project.id);
            if !tasks_path.exists() {
                continue;
            }
            let _tasks_lock = FileLock::acquire(&tasks_path)?;
            let mut tasks: Vec<Task> = load_json(&tasks_path)?;
            let mut dirty = false;
            for task in tasks.iter_mut() {
                if !task.status.is_active() {
                    continue;
                }
                let alive = task
                    .worker_id
                    .as_deref()
                    .is_some_and(|w| live_workers.contains(w));
                if alive {
                    continue;
                }
                tracing::warn!(
                    project_id = %project.id,
                    task_id = %task.id,
                    status = %task.status,
                    "recovering stale task to pending"
                );
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.error = None;
                task.commit_id = None;
                task.started_at = None;
                task.completed_at = None;
                task.priority = (task.priority + 1).min(RECOVERY_PRIORITY_CAP);
                recovered.push(task.clone());
                dirty = true;
            }
            if dirty {
                write_json_atomic(&tasks_path, &tasks)?;
            }
        }

        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn load_registry(&self) -> Result<Registry, StoreError> {
        load_json(&self.dir.registry())
    }
}

/// A task is claimable when it is pending (and not awaiting a plan) or has
/// an approved plan, its dependency (if any and still present) completed.
fn is_eligible(task: &Task, all: &[Task]) -> bool {
    let claimable = match task.status {
        TaskStatus::Pending => !task.plan_mode || task.plan_approved,
        TaskStatus::PlanApproved => true,
        _ => false,
    };
    if !claimable {
        return false;
    }
    match &task.depends_on {
        None => true,
        Some(dep_id) => match all.iter().find(|t| &t.id == dep_id) {
            // A deleted dependency no longer gates anything.
            None => true,
            Some(dep) => dep.status == TaskStatus::Completed,
        },
    }
}

fn new_project_id() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Write JSON durably: serialize, write a sibling tempfile, fsync, rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&json).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Origin;
    use tempfile::TempDir;

    fn new_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    fn new_project_spec(name: &str) -> NewProject {
        NewProject {
            name: name.to_string(),
            origin: Origin::New,
            auto_merge: false,
            auto_push: false,
        }
    }

    fn new_task_spec(description: &str, priority: i64) -> NewTask {
        NewTask {
            description: description.to_string(),
            title: None,
            priority,
            depends_on: None,
            plan_mode: false,
        }
    }

    fn make_ready(store: &Store, project_id: &str) {
        store
            .update_project(project_id, |p| p.status = ProjectStatus::Ready)
            .unwrap();
    }

    #[test]
    fn create_project_round_trip() {
        let (_dir, store) = new_store();
        let project = store.create_project(new_project_spec("web-app")).unwrap();

        assert_eq!(project.id.len(), 8);
        assert_eq!(project.status, ProjectStatus::Cloning);

        let listed = store.list_projects().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, project.id);

        assert!(store.data_dir().tasks_file(&project.id).exists());
        assert!(store.data_dir().logs_dir(&project.id).exists());
        assert!(store.data_dir().worktrees_dir(&project.id).exists());
    }

    #[test]
    fn delete_project_removes_directory_and_registry_entry() {
        let (_dir, store) = new_store();
        let project = store.create_project(new_project_spec("doomed")).unwrap();
        let project_dir = store.data_dir().project_dir(&project.id);
        assert!(project_dir.exists());

        store.delete_project(&project.id).unwrap();
        assert!(!project_dir.exists());
        assert!(store.list_projects().unwrap().is_empty());
        assert!(store.get_project(&project.id).unwrap_err().is_not_found());
    }

    #[test]
    fn task_ids_are_monotonic_across_projects() {
        let (_dir, store) = new_store();
        let p1 = store.create_project(new_project_spec("one")).unwrap();
        let p2 = store.create_project(new_project_spec("two")).unwrap();

        let t1 = store.create_task(&p1.id, new_task_spec("first", 0), "agent").unwrap();
        let t2 = store.create_task(&p2.id, new_task_spec("second", 0), "agent").unwrap();
        let t3 = store.create_task(&p1.id, new_task_spec("third", 0), "agent").unwrap();

        assert_eq!(t1.id, "t-000001");
        assert_eq!(t2.id, "t-000002");
        assert_eq!(t3.id, "t-000003");
        assert_eq!(t1.branch, "agent/t-000001");
    }

    #[test]
    fn title_is_derived_from_description() {
        let (_dir, store) = new_store();
        let p = store.create_project(new_project_spec("p")).unwrap();
        let t = store
            .create_task(&p.id, new_task_spec("add README section\nmore detail", 0), "agent")
            .unwrap();
        assert_eq!(t.title, "add README section");
    }

    #[test]
    fn update_task_conflict_leaves_task_untouched() {
        let (_dir, store) = new_store();
        let p = store.create_project(new_project_spec("p")).unwrap();
        let t = store.create_task(&p.id, new_task_spec("task", 0), "agent").unwrap();

        let err = store
            .update_task(&p.id, &t.id, |task| task.transition_to(TaskStatus::Completed))
            .unwrap_err();
        assert!(err.is_conflict());

        let reloaded = store.get_task(&p.id, &t.id).unwrap();
        assert_eq!(reloaded.status, TaskStatus::Pending);
    }

    #[test]
    fn claim_prefers_higher_priority() {
        let (_dir, store) = new_store();
        let p = store.create_project(new_project_spec("p")).unwrap();
        make_ready(&store, &p.id);

        store.create_task(&p.id, new_task_spec("low", 0), "agent").unwrap();
        let high = store.create_task(&p.id, new_task_spec("high", 5), "agent").unwrap();

        let (_, claimed) = store.claim_next_task("worker-0").unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-0"));
    }

    #[test]
    fn claim_breaks_priority_tie_by_created_at() {
        let (_dir, store) = new_store();
        let p1 = store.create_project(new_project_spec("p1")).unwrap();
        let p2 = store.create_project(new_project_spec("p2")).unwrap();
        make_ready(&store, &p1.id);
        make_ready(&store, &p2.id);

        let older = store.create_task(&p1.id, new_task_spec("older", 0), "agent").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = store.create_task(&p2.id, new_task_spec("newer", 0), "agent").unwrap();

        let (_, first) = store.claim_next_task("worker-0").unwrap().unwrap();
        assert_eq!(first.id, older.id);

        // Finish the first so the worker invariant is not violated, then the
        // other project's task is claimed.
        store
            .update_task(&p1.id, &older.id, |t| {
                t.transition_to(TaskStatus::Running)?;
                t.transition_to(TaskStatus::Merging)?;
                t.transition_to(TaskStatus::Completed)
            })
            .unwrap();
        let (_, second) = store.claim_next_task("worker-0").unwrap().unwrap();
        assert_eq!(second.id, newer.id);
    }

    #[test]
    fn claim_skips_projects_not_ready() {
        let (_dir, store) = new_store();
        let p = store.create_project(new_project_spec("cloning")).unwrap();
        store.create_task(&p.id, new_task_spec("task", 0), "agent").unwrap();

        assert!(store.claim_next_task("worker-0").unwrap().is_none());
        make_ready(&store, &p.id);
        assert!(store.claim_next_task("worker-0").unwrap().is_some());
    }

    #[test]
    fn claim_respects_unsatisfied_dependency() {
        let (_dir, store) = new_store();
        let p = store.create_project(new_project_spec("p")).unwrap();
        make_ready(&store, &p.id);

        let dep = store.create_task(&p.id, new_task_spec("dep", 0), "agent").unwrap();
        let mut spec = new_task_spec("blocked", 10);
        spec.depends_on = Some(dep.id.clone());
        store.create_task(&p.id, spec, "agent").unwrap();

        // Higher priority but blocked; the dependency is claimed instead.
        let (_, claimed) = store.claim_next_task("worker-0").unwrap().unwrap();
        assert_eq!(claimed.id, dep.id);

        store
            .update_task(&p.id, &dep.id, |t| {
                t.transition_to(TaskStatus::Running)?;
                t.transition_to(TaskStatus::Merging)?;
                t.transition_to(TaskStatus::Completed)
            })
            .unwrap();

        let (_, unblocked) = store.claim_next_task("worker-1").unwrap().unwrap();
        assert_eq!(unblocked.title, "blocked");
    }

    #[test]
    fn claim_skips_plan_mode_until_approved() {
        let (_dir, store) = new_store();
        let p = store.create_project(new_project_spec("p")).unwrap();
        make_ready(&store, &p.id);

        let mut spec = new_task_spec("needs plan", 0);
        spec.plan_mode = true;
        let t = store.create_task(&p.id, spec, "agent").unwrap();

        assert!(store.claim_next_task("worker-0").unwrap().is_none());

        store
            .update_task(&p.id, &t.id, |task| {
                task.transition_to(TaskStatus::PlanPending)?;
                task.plan = Some("1. do it".to_string());
                task.plan_approved = true;
                task.transition_to(TaskStatus::PlanApproved)
            })
            .unwrap();

        let (_, claimed) = store.claim_next_task("worker-0").unwrap().unwrap();
        assert_eq!(claimed.id, t.id);
        assert_eq!(claimed.plan.as_deref(), Some("1. do it"));
    }

    #[test]
    fn concurrent_claims_never_return_the_same_task() {
        let (_dir, store) = new_store();
        let store = std::sync::Arc::new(store);
        let p = store.create_project(new_project_spec("p")).unwrap();
        make_ready(&store, &p.id);
        for i in 0..4 {
            store
                .create_task(&p.id, new_task_spec(&format!("task {i}"), 0), "agent")
                .unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store
                    .claim_next_task(&format!("worker-{w}"))
                    .unwrap()
                    .map(|(_, t)| t.id)
            }));
        }
        let mut claimed: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        claimed.sort();
        let mut deduped = claimed.clone();
        deduped.dedup();
        assert_eq!(claimed.len(), 4);
        assert_eq!(claimed, deduped, "a task was claimed twice: {claimed:?}");
    }

    #[test]
    fn recover_stale_returns_orphans_to_pending_with_boost() {
        let (_dir, store) = new_store();
        let p = store.create_project(new_project_spec("p")).unwrap();
        make_ready(&store, &p.id);
        let t = store.create_task(&p.id, new_task_spec("task", 0), "agent").unwrap();
        store.claim_next_task("worker-0").unwrap().unwrap();
        store
            .update_task(&p.id, &t.id, |task| task.transition_to(TaskStatus::Running))
            .unwrap();

        let recovered = store.recover_stale(&HashSet::new()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, TaskStatus::Pending);
        assert_eq!(recovered[0].priority, 1);
        assert!(recovered[0].worker_id.is_none());
    }

    #[test]
    fn recover_stale_leaves_live_workers_alone() {
        let (_dir, store) = new_store();
        let p = store.create_project(new_project_spec("p")).unwrap();
        make_ready(&store, &p.id);
        store.create_task(&p.id, new_task_spec("task", 0), "agent").unwrap();
        store.claim_next_task("worker-0").unwrap().unwrap();

        let live: HashSet<String> = ["worker-0".to_string()].into();
        let recovered = store.recover_stale(&live).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn recovery_priority_is_capped() {
        let (_dir, store) = new_store();
        let p = store.create_project(new_project_spec("p")).unwrap();
        make_ready(&store, &p.id);
        let t = store
            .create_task(&p.id, new_task_spec("task", RECOVERY_PRIORITY_CAP), "agent")
            .unwrap();
        store.claim_next_task("worker-0").unwrap().unwrap();
        let _ = t;

        let recovered = store.recover_stale(&HashSet::new()).unwrap();
        assert_eq!(recovered[0].priority, RECOVERY_PRIORITY_CAP);
    }

    #[test]
    fn malformed_registry_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let registry = dir.path().join("projects.json");
        std::fs::write(&registry, "this is { not json").unwrap();

        let store = Store::open(dir.path()).unwrap();
        let quarantine = store.quarantined_registry().expect("should quarantine");
        assert!(quarantine.starts_with("projects.json.corrupt-"));
        assert!(dir.path().join(quarantine).exists());
        assert!(store.list_projects().unwrap().is_empty());
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        let project_id = {
            let store = Store::open(dir.path()).unwrap();
            let p = store.create_project(new_project_spec("persists")).unwrap();
            store.create_task(&p.id, new_task_spec("task", 0), "agent").unwrap();
            p.id
        };

        let store = Store::open(dir.path()).unwrap();
        assert!(store.quarantined_registry().is_none());
        let tasks = store.list_tasks(&project_id).unwrap();
        assert_eq!(tasks.len(), 1);
        // Counter continues rather than restarting.
        let t2 = store.create_task(&project_id, new_task_spec("next", 0), "agent").unwrap();
        assert_eq!(t2.id, "t-000002");
    }

    #[test]
    fn unknown_ids_surface_not_found() {
        let (_dir, store) = new_store();
        assert!(store.get_project("deadbeef").unwrap_err().is_not_found());
        let p = store.create_project(new_project_spec("p")).unwrap();
        assert!(store.get_task(&p.id, "t-999999").unwrap_err().is_not_found());
        assert!(store.delete_task(&p.id, "t-999999").unwrap_err().is_not_found());
    }
}
