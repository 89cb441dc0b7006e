//! Data directory layout.
//!
//! ```text
//! data/projects.json                      # project registry
//! data/projects/<pid>/tasks.json          # task list
//! data/projects/<pid>/repo/               # git repo
//! data/projects/<pid>/worktrees/<wid>/    # task worktrees
//! data/projects/<pid>/logs/<wid>.jsonl    # per-worker agent log
//! ```

use std::path::{Path, PathBuf};

/// Resolves every path inside a data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The project registry file.
    pub fn registry(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    /// Directory holding all per-project state.
    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_dir().join(project_id)
    }

    pub fn tasks_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("tasks.json")
    }

    pub fn repo_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("repo")
    }

    pub fn worktrees_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("worktrees")
    }

    pub fn worktree_dir(&self, project_id: &str, worker_id: &str) -> PathBuf {
        self.worktrees_dir(project_id).join(worker_id)
    }

    pub fn logs_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("logs")
    }

    pub fn worker_log(&self, project_id: &str, worker_id: &str) -> PathBuf {
        self.logs_dir(project_id).join(format!("{worker_id}.jsonl"))
    }

    /// Sidecar lock file guarding `path`.
    pub fn lock_for(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        name.push_str(".lock");
        path.with_file_name(name)
    }

    /// Legacy pre-multi-project task file at the data root.
    pub fn legacy_tasks_file(&self) -> PathBuf {
        self.root.join("tasks.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_convention() {
        let d = DataDir::new("/srv/conductor");
        assert_eq!(d.registry(), PathBuf::from("/srv/conductor/projects.json"));
        assert_eq!(
            d.tasks_file("ab12cd34"),
            PathBuf::from("/srv/conductor/projects/ab12cd34/tasks.json")
        );
        assert_eq!(
            d.worktree_dir("ab12cd34", "worker-2"),
            PathBuf::from("/srv/conductor/projects/ab12cd34/worktrees/worker-2")
        );
        assert_eq!(
            d.worker_log("ab12cd34", "worker-2"),
            PathBuf::from("/srv/conductor/projects/ab12cd34/logs/worker-2.jsonl")
        );
    }

    #[test]
    fn lock_path_is_sidecar() {
        let lock = DataDir::lock_for(Path::new("/data/projects.json"));
        assert_eq!(lock, PathBuf::from("/data/projects.json.lock"));
    }
}
