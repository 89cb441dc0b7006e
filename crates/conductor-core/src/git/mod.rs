//! Thin semantic wrapper over the `git` binary.
//!
//! Every operation is a pure function over explicit paths: run a git
//! subprocess, capture stderr, translate the outcome. Nothing here owns
//! state; per-repository serialization is the scheduler's job. Functions are
//! synchronous (callers in async code go through `spawn_blocking`).

pub mod graph;

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

/// Errors from git subprocess invocations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    /// A short excerpt of stderr suitable for a task failure reason.
    pub fn excerpt(&self) -> String {
        let text = self.to_string();
        if text.len() > 400 {
            let mut end = 400;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &text[..end])
        } else {
            text
        }
    }
}

/// Outcome of `rebase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    /// Rebase applied cleanly.
    Clean,
    /// Rebase stopped on conflicts in the named files.
    Conflict(Vec<String>),
    /// Rebase failed for a reason other than content conflicts.
    AbortedOther { stderr: String },
}

/// Outcome of `merge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// Merge hit conflicts and was aborted, leaving the repo clean.
    Conflict { details: String },
}

/// How a task branch is folded into the base branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// `git merge --no-ff`, preserving the branch topology.
    NoFastForward,
    /// `git merge --squash` followed by a single commit.
    Squash,
}

/// One commit in the log view.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CommitInfo {
    pub sha: String,
    pub short: String,
    pub parents: Vec<String>,
    pub message: String,
    pub author: String,
    pub time_ago: String,
    pub refs: Vec<String>,
}

/// One changed file in a commit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DiffEntry {
    pub path: String,
    /// `A`, `M`, `D` or `R`.
    pub status: String,
    pub additions: u64,
    pub deletions: u64,
}

/// A registered worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: String,
}

// ---------------------------------------------------------------------------
// Subprocess plumbing
// ---------------------------------------------------------------------------

struct GitOutput {
    success: bool,
    code: i32,
    stdout: String,
    stderr: String,
}

fn run_raw(dir: Option<&Path>, args: &[&str]) -> Result<GitOutput, GitError> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    // Rebase/merge continuations must never open an editor.
    cmd.env("GIT_EDITOR", "true");
    let output = cmd.output().map_err(|e| GitError::Spawn {
        command: args.join(" "),
        source: e,
    })?;
    Ok(GitOutput {
        success: output.status.success(),
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run git and require success; returns trimmed stdout.
fn run(dir: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
    let out = run_raw(dir, args)?;
    if !out.success {
        return Err(GitError::Exit {
            command: args.join(" "),
            code: out.code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(out.stdout.trim().to_string())
}

// ---------------------------------------------------------------------------
// Repository setup
// ---------------------------------------------------------------------------

/// Clone `url` (which may be a local path) into `dest`.
pub fn clone_repo(url: &str, branch: Option<&str>, dest: &Path) -> Result<(), GitError> {
    let dest_str = dest.to_string_lossy();
    let mut args = vec!["clone"];
    if let Some(branch) = branch {
        args.extend(["--branch", branch]);
    }
    args.push(url);
    args.push(&dest_str);
    run(None, &args)?;
    Ok(())
}

/// Initialize an empty repository on `base_branch` with one empty commit so
/// HEAD resolves and worktrees can be created immediately.
pub fn init_repo(dest: &Path, base_branch: &str) -> Result<(), GitError> {
    std::fs::create_dir_all(dest).map_err(|e| GitError::Io {
        path: dest.to_path_buf(),
        source: e,
    })?;
    run(Some(dest), &["init", "-b", base_branch])?;
    ensure_identity(dest)?;
    run(Some(dest), &["commit", "--allow-empty", "-m", "initial commit"])?;
    Ok(())
}

/// Set a repo-local committer identity when none is configured.
pub fn ensure_identity(dir: &Path) -> Result<(), GitError> {
    if run(Some(dir), &["config", "--local", "user.email"]).is_err() {
        run(Some(dir), &["config", "user.email", "conductor@localhost"])?;
        run(Some(dir), &["config", "user.name", "conductor"])?;
    }
    Ok(())
}

/// Verify `dir` is inside a git repository.
pub fn assert_repo(dir: &Path) -> Result<(), GitError> {
    let out = run_raw(Some(dir), &["rev-parse", "--git-dir"])?;
    if out.success {
        Ok(())
    } else {
        Err(GitError::NotARepo(dir.to_path_buf()))
    }
}

// ---------------------------------------------------------------------------
// Refs and remotes
// ---------------------------------------------------------------------------

pub fn fetch(dir: &Path, remote: &str) -> Result<(), GitError> {
    run(Some(dir), &["fetch", remote, "--prune"])?;
    Ok(())
}

pub fn has_remote(dir: &Path) -> Result<bool, GitError> {
    Ok(!run(Some(dir), &["remote"])?.is_empty())
}

pub fn head_sha(dir: &Path) -> Result<String, GitError> {
    run(Some(dir), &["rev-parse", "HEAD"])
}

/// Resolve a ref to a commit sha, or `None` if it does not exist.
pub fn ref_sha(dir: &Path, refname: &str) -> Result<Option<String>, GitError> {
    let spec = format!("{refname}^{{commit}}");
    let out = run_raw(Some(dir), &["rev-parse", "--verify", "--quiet", &spec])?;
    if out.success {
        Ok(Some(out.stdout.trim().to_string()))
    } else {
        Ok(None)
    }
}

pub fn current_branch(dir: &Path) -> Result<String, GitError> {
    run(Some(dir), &["branch", "--show-current"])
}

pub fn branch_exists(dir: &Path, branch: &str) -> Result<bool, GitError> {
    let refname = format!("refs/heads/{branch}");
    let out = run_raw(Some(dir), &["rev-parse", "--verify", "--quiet", &refname])?;
    Ok(out.success)
}

pub fn checkout(dir: &Path, branch: &str) -> Result<(), GitError> {
    run(Some(dir), &["checkout", branch])?;
    Ok(())
}

/// Force-delete a local branch. Missing branches are not an error.
pub fn delete_branch(dir: &Path, branch: &str) -> Result<(), GitError> {
    let out = run_raw(Some(dir), &["branch", "-D", branch])?;
    if out.success || out.stderr.contains("not found") {
        Ok(())
    } else {
        Err(GitError::Exit {
            command: format!("branch -D {branch}"),
            code: out.code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

/// Delete a branch on the remote (`git push <remote> :<branch>`), best-effort
/// for branches that were never pushed.
pub fn delete_remote_branch(dir: &Path, remote: &str, branch: &str) -> Result<(), GitError> {
    let refspec = format!(":{branch}");
    let out = run_raw(Some(dir), &["push", remote, &refspec])?;
    if out.success || out.stderr.contains("remote ref does not exist") {
        Ok(())
    } else {
        Err(GitError::Exit {
            command: format!("push {remote} {refspec}"),
            code: out.code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

pub fn push(dir: &Path, remote: &str, refspec: &str) -> Result<(), GitError> {
    run(Some(dir), &["push", remote, refspec])?;
    Ok(())
}

/// Commits on HEAD not present on its upstream. Zero when no upstream is
/// configured.
pub fn unpushed_count(dir: &Path) -> Result<u64, GitError> {
    let out = run_raw(Some(dir), &["rev-list", "--count", "@{upstream}..HEAD"])?;
    if !out.success {
        return Ok(0);
    }
    Ok(out.stdout.trim().parse().unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Worktrees
// ---------------------------------------------------------------------------

/// Create a new branch at `base_ref` checked out in a new worktree at `dir`.
///
/// Fails if the branch is checked out in another worktree; the caller is
/// expected to prune first.
pub fn worktree_add(
    repo: &Path,
    branch: &str,
    dir: &Path,
    base_ref: &str,
) -> Result<(), GitError> {
    let dir_str = dir.to_string_lossy();
    run(
        Some(repo),
        &["worktree", "add", "-b", branch, &dir_str, base_ref],
    )?;
    Ok(())
}

/// Remove a worktree and its directory. Idempotent: unknown paths and
/// already-deleted directories are fine.
pub fn worktree_remove(repo: &Path, dir: &Path) -> Result<(), GitError> {
    let dir_str = dir.to_string_lossy();
    let out = run_raw(Some(repo), &["worktree", "remove", "--force", &dir_str])?;
    if out.success || out.stderr.contains("is not a working tree") {
        if dir.exists() {
            let _ = std::fs::remove_dir_all(dir);
        }
        return Ok(());
    }
    // A worktree whose directory vanished needs a prune, then the dir wipe.
    worktree_prune(repo)?;
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|e| GitError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

pub fn worktree_prune(repo: &Path) -> Result<(), GitError> {
    run(Some(repo), &["worktree", "prune"])?;
    Ok(())
}

pub fn worktree_list(repo: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
    let stdout = run(Some(repo), &["worktree", "list", "--porcelain"])?;
    Ok(parse_worktree_porcelain(&stdout))
}

/// Parse `git worktree list --porcelain`: blank-line separated blocks of
/// `worktree <path>` / `HEAD <sha>` / `branch refs/heads/<name>` lines
/// (`bare` and `detached` blocks carry no branch).
fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    for block in output.split("\n\n") {
        let mut path = None;
        let mut head = None;
        let mut branch = None;
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(rest));
            } else if let Some(rest) = line.strip_prefix("HEAD ") {
                head = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("branch ") {
                branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
            }
        }
        if let (Some(path), Some(head)) = (path, head) {
            entries.push(WorktreeEntry { path, branch, head });
        }
    }
    entries
}

// ---------------------------------------------------------------------------
// Commit / rebase / merge
// ---------------------------------------------------------------------------

/// Stage everything and commit if and only if the tree is dirty.
///
/// Returns the new commit sha, or `None` when there was nothing to commit.
pub fn commit_all(dir: &Path, message: &str) -> Result<Option<String>, GitError> {
    ensure_identity(dir)?;
    run(Some(dir), &["add", "-A"])?;
    let status = run(Some(dir), &["status", "--porcelain"])?;
    if status.is_empty() {
        return Ok(None);
    }
    run(Some(dir), &["commit", "-m", message])?;
    head_sha(dir).map(Some)
}

pub fn add_all(dir: &Path) -> Result<(), GitError> {
    run(Some(dir), &["add", "-A"])?;
    Ok(())
}

/// Rebase the current branch onto `target`.
pub fn rebase(dir: &Path, target: &str) -> Result<RebaseOutcome, GitError> {
    let out = run_raw(Some(dir), &["rebase", target])?;
    if out.success {
        return Ok(RebaseOutcome::Clean);
    }
    let files = conflicted_files(dir)?;
    if !files.is_empty() {
        return Ok(RebaseOutcome::Conflict(files));
    }
    Ok(RebaseOutcome::AbortedOther {
        stderr: out.stderr.trim().to_string(),
    })
}

/// Paths with unresolved conflict markers in the index.
pub fn conflicted_files(dir: &Path) -> Result<Vec<String>, GitError> {
    let stdout = run(Some(dir), &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(stdout.lines().map(|l| l.to_string()).collect())
}

pub fn rebase_continue(dir: &Path) -> Result<(), GitError> {
    run(Some(dir), &["rebase", "--continue"])?;
    Ok(())
}

pub fn rebase_abort(dir: &Path) -> Result<(), GitError> {
    run(Some(dir), &["rebase", "--abort"])?;
    Ok(())
}

/// Merge `branch` into the currently checked-out branch of `repo`.
///
/// On conflict the merge is aborted, leaving the repository clean, and
/// [`MergeOutcome::Conflict`] carries the combined git output.
pub fn merge(repo: &Path, branch: &str, mode: MergeMode) -> Result<MergeOutcome, GitError> {
    ensure_identity(repo)?;
    let out = match mode {
        MergeMode::NoFastForward => run_raw(Some(repo), &["merge", "--no-ff", branch])?,
        MergeMode::Squash => run_raw(Some(repo), &["merge", "--squash", branch])?,
    };

    if out.success {
        if mode == MergeMode::Squash {
            // `--squash` stages but does not commit. An empty stage (branch
            // already contained) still counts as merged.
            let staged = run(Some(repo), &["diff", "--cached", "--name-only"])?;
            if !staged.is_empty() {
                let message = format!("merge {branch} (squash)");
                run(Some(repo), &["commit", "-m", &message])?;
            }
        }
        return Ok(MergeOutcome::Merged);
    }

    let combined = format!("{}\n{}", out.stdout.trim(), out.stderr.trim());
    if combined.contains("CONFLICT") || combined.contains("Automatic merge failed") {
        match mode {
            MergeMode::NoFastForward => {
                let _ = run_raw(Some(repo), &["merge", "--abort"]);
            }
            MergeMode::Squash => {
                let _ = run_raw(Some(repo), &["reset", "--merge"]);
            }
        }
        return Ok(MergeOutcome::Conflict {
            details: combined.trim().to_string(),
        });
    }

    Err(GitError::Exit {
        command: format!("merge {branch}"),
        code: out.code,
        stderr: out.stderr.trim().to_string(),
    })
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

/// Recent commits of the current branch, newest first.
pub fn log_commits(repo: &Path, limit: usize) -> Result<Vec<CommitInfo>, GitError> {
    let format = format!(
        "%H{FIELD_SEP}%h{FIELD_SEP}%P{FIELD_SEP}%s{FIELD_SEP}%an{FIELD_SEP}%ct{FIELD_SEP}%D{RECORD_SEP}"
    );
    let pretty = format!("--pretty=format:{format}");
    let max = format!("--max-count={limit}");
    let stdout = run(Some(repo), &["log", &max, &pretty])?;

    let now = chrono::Utc::now().timestamp();
    let mut commits = Vec::new();
    for record in stdout.split(RECORD_SEP) {
        let record = record.trim_matches(['\n', '\r']);
        if record.is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.split(FIELD_SEP).collect();
        if fields.len() < 7 {
            continue;
        }
        let timestamp: i64 = fields[5].trim().parse().unwrap_or(now);
        commits.push(CommitInfo {
            sha: fields[0].to_string(),
            short: fields[1].to_string(),
            parents: fields[2].split_whitespace().map(str::to_string).collect(),
            message: fields[3].to_string(),
            author: fields[4].to_string(),
            time_ago: time_ago(now - timestamp),
            refs: fields[6]
                .split(", ")
                .filter(|r| !r.trim().is_empty())
                .map(|r| r.trim().to_string())
                .collect(),
        });
    }
    Ok(commits)
}

/// Human-readable age of a commit.
fn time_ago(seconds: i64) -> String {
    let seconds = seconds.max(0);
    match seconds {
        0..60 => "just now".to_string(),
        60..3600 => format!("{} min ago", seconds / 60),
        3600..86_400 => format!("{} h ago", seconds / 3600),
        86_400..2_592_000 => format!("{} d ago", seconds / 86_400),
        2_592_000..31_536_000 => format!("{} mo ago", seconds / 2_592_000),
        _ => format!("{} y ago", seconds / 31_536_000),
    }
}

/// Full message body plus the changed-file list for one commit.
pub fn commit_details(repo: &Path, sha: &str) -> Result<(String, Vec<DiffEntry>), GitError> {
    let body = run(Some(repo), &["show", "-s", "--format=%B", sha])?;

    // name-status gives the change kind, numstat the line counts.
    let name_status = run(Some(repo), &["show", "--name-status", "--format=", sha])?;
    let numstat = run(Some(repo), &["show", "--numstat", "--format=", sha])?;

    let mut counts: std::collections::HashMap<String, (u64, u64)> = std::collections::HashMap::new();
    for line in numstat.lines() {
        let mut parts = line.split('\t');
        let (Some(adds), Some(dels), Some(path)) = (parts.next(), parts.next(), parts.last())
        else {
            continue;
        };
        counts.insert(
            path.to_string(),
            (adds.parse().unwrap_or(0), dels.parse().unwrap_or(0)),
        );
    }

    let mut files = Vec::new();
    for line in name_status.lines() {
        let mut parts = line.split('\t');
        let Some(raw_status) = parts.next() else {
            continue;
        };
        // Renames are `R<score>\told\tnew`; report the new path.
        let path = match parts.last() {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => continue,
        };
        let status = match raw_status.chars().next() {
            Some('A') => "A",
            Some('D') => "D",
            Some('R') => "R",
            _ => "M",
        };
        let (additions, deletions) = counts.get(&path).copied().unwrap_or((0, 0));
        files.push(DiffEntry {
            path,
            status: status.to_string(),
            additions,
            deletions,
        });
    }

    Ok((body, files))
}

// ---------------------------------------------------------------------------
// Worktree-link integrity
// ---------------------------------------------------------------------------

/// Snapshot the `.git` pointer file of a worktree before handing it to a
/// container.
pub fn gitfile_snapshot(worktree: &Path) -> Result<String, GitError> {
    let pointer = worktree.join(".git");
    if !pointer.is_file() {
        return Err(GitError::Io {
            path: pointer,
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "worktree .git pointer is not a regular file",
            ),
        });
    }
    std::fs::read_to_string(&pointer).map_err(|e| GitError::Io {
        path: pointer,
        source: e,
    })
}

/// Check the pointer after the container exits: it must still be a regular
/// file with unchanged content.
pub fn gitfile_intact(worktree: &Path, expected: &str) -> bool {
    let pointer = worktree.join(".git");
    if !pointer.is_file() {
        return false;
    }
    match std::fs::read_to_string(&pointer) {
        Ok(content) => content == expected,
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Exclusions
// ---------------------------------------------------------------------------

/// Add an entry to the repository's `.git/info/exclude` if not present,
/// keeping it out of commits without touching `.gitignore`.
pub fn ensure_excluded(repo: &Path, entry: &str) -> Result<(), GitError> {
    let git_dir = run(Some(repo), &["rev-parse", "--git-dir"])?;
    let git_dir = if Path::new(&git_dir).is_absolute() {
        PathBuf::from(git_dir)
    } else {
        repo.join(git_dir)
    };
    let exclude = git_dir.join("info").join("exclude");
    let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == entry) {
        return Ok(());
    }
    if let Some(parent) = exclude.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GitError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(entry);
    content.push('\n');
    std::fs::write(&exclude, content).map_err(|e| GitError::Io {
        path: exclude,
        source: e,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
