//! Merge-test pipeline: rebase onto base, run tests, let the agent repair.
//!
//! Runs after a worker reports a commit. The worktree branch is rebased onto
//! the freshest base ref, the project's test suite runs, and on conflicts or
//! failures the agent is invoked in the worktree to repair, with a bounded
//! number of rounds. The engine never merges or pushes; that stays with the
//! scheduler, which owns the project flags.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::agent::{AgentInvoker, AgentRequest};
use crate::git::{self, RebaseOutcome};
use crate::prompt;
use crate::testkit;

/// Default bound on repair rounds.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How long to wait after a non-conflict rebase failure before retrying.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Result of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeTestOutcome {
    /// Rebase and tests succeeded; the worktree head is `final_sha`.
    Ok { final_sha: String },
    Failed { reason: String },
}

/// Coarse progress, surfaced so the scheduler can flip the task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    Rebasing,
    Testing,
}

/// One pipeline invocation.
#[derive(Debug, Clone)]
pub struct MergeTestRequest {
    pub worktree: PathBuf,
    pub repo: PathBuf,
    pub base_branch: String,
    /// Cap for each agent repair call.
    pub agent_timeout: Duration,
}

/// The engine itself. Cheap to construct per run.
pub struct MergeTestEngine {
    agent: Arc<dyn AgentInvoker>,
    max_retries: u32,
    settle_delay: Duration,
}

impl MergeTestEngine {
    pub fn new(agent: Arc<dyn AgentInvoker>) -> Self {
        Self {
            agent,
            max_retries: DEFAULT_MAX_RETRIES,
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_limits(mut self, max_retries: u32, settle_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.settle_delay = settle_delay;
        self
    }

    /// Run the pipeline to completion.
    pub async fn run(
        &self,
        request: &MergeTestRequest,
        phases: Option<mpsc::UnboundedSender<MergePhase>>,
    ) -> MergeTestOutcome {
        let mut last_reason = String::new();

        for round in 1..=self.max_retries {
            tracing::info!(
                worktree = %request.worktree.display(),
                round,
                "merge-test round"
            );

            match self.rebase_round(request, &phases).await {
                RoundStep::Proceed => {}
                RoundStep::Retry(reason) => {
                    last_reason = reason;
                    continue;
                }
                RoundStep::Abort(reason) => {
                    return MergeTestOutcome::Failed { reason };
                }
            }

            match self.test_round(request, &phases).await {
                RoundStep::Proceed => {
                    let worktree = request.worktree.clone();
                    match git_call(move || git::head_sha(&worktree)).await {
                        Ok(sha) => return MergeTestOutcome::Ok { final_sha: sha },
                        Err(e) => {
                            return MergeTestOutcome::Failed {
                                reason: e.excerpt(),
                            };
                        }
                    }
                }
                RoundStep::Retry(reason) => last_reason = reason,
                RoundStep::Abort(reason) => return MergeTestOutcome::Failed { reason },
            }
        }

        MergeTestOutcome::Failed {
            reason: format!(
                "merge-test retries exhausted after {} rounds: {last_reason}",
                self.max_retries
            ),
        }
    }

    /// Fetch (best-effort) and rebase onto the freshest base ref.
    async fn rebase_round(
        &self,
        request: &MergeTestRequest,
        phases: &Option<mpsc::UnboundedSender<MergePhase>>,
    ) -> RoundStep {
        if let Some(tx) = phases {
            let _ = tx.send(MergePhase::Rebasing);
        }

        let worktree = request.worktree.clone();
        let base = request.base_branch.clone();

        let target = git_call(move || {
            if git::has_remote(&worktree).unwrap_or(false) {
                if let Err(e) = git::fetch(&worktree, "origin") {
                    tracing::warn!(error = %e, "fetch before rebase failed (continuing)");
                }
            }
            let remote_ref = format!("origin/{base}");
            if git::ref_sha(&worktree, &remote_ref).ok().flatten().is_some() {
                Some(remote_ref)
            } else if git::ref_sha(&worktree, &base).ok().flatten().is_some() {
                Some(base)
            } else {
                None
            }
        })
        .await;

        let Some(target) = target else {
            // Nothing to rebase onto (empty repo); skip straight to tests.
            return RoundStep::Proceed;
        };

        let worktree = request.worktree.clone();
        let target_clone = target.clone();
        let outcome = match git_call(move || git::rebase(&worktree, &target_clone)).await {
            Ok(outcome) => outcome,
            Err(e) => return RoundStep::Abort(e.excerpt()),
        };

        match outcome {
            RebaseOutcome::Clean => RoundStep::Proceed,
            RebaseOutcome::Conflict(files) => {
                tracing::info!(?files, "rebase conflicts, invoking agent");
                let resolve = self
                    .agent
                    .invoke(AgentRequest {
                        prompt: prompt::compose_conflict_prompt(&request.base_branch, &files),
                        workdir: request.worktree.clone(),
                        timeout: request.agent_timeout,
                        events: None,
                    })
                    .await;
                if let Err(e) = resolve {
                    let worktree = request.worktree.clone();
                    let _ = git_call(move || git::rebase_abort(&worktree)).await;
                    return RoundStep::Retry(format!("conflict resolution agent failed: {e}"));
                }

                let worktree = request.worktree.clone();
                let remaining =
                    git_call(move || git::conflicted_files(&worktree)).await.unwrap_or_default();
                if remaining.is_empty() {
                    let worktree = request.worktree.clone();
                    match git_call(move || {
                        git::add_all(&worktree)?;
                        git::rebase_continue(&worktree)
                    })
                    .await
                    {
                        Ok(()) => RoundStep::Proceed,
                        Err(e) => {
                            let worktree = request.worktree.clone();
                            let _ = git_call(move || git::rebase_abort(&worktree)).await;
                            RoundStep::Retry(format!("rebase --continue failed: {}", e.excerpt()))
                        }
                    }
                } else {
                    let worktree = request.worktree.clone();
                    let _ = git_call(move || git::rebase_abort(&worktree)).await;
                    RoundStep::Retry(format!(
                        "conflicts unresolved after agent pass: {}",
                        remaining.join(", ")
                    ))
                }
            }
            RebaseOutcome::AbortedOther { stderr } => {
                let worktree = request.worktree.clone();
                let _ = git_call(move || git::rebase_abort(&worktree)).await;
                tokio::time::sleep(self.settle_delay).await;
                RoundStep::Retry(format!("rebase failed: {stderr}"))
            }
        }
    }

    /// Detect and run tests; on failure let the agent repair.
    async fn test_round(
        &self,
        request: &MergeTestRequest,
        phases: &Option<mpsc::UnboundedSender<MergePhase>>,
    ) -> RoundStep {
        let worktree = request.worktree.clone();
        let framework = git_call(move || testkit::detect(&worktree)).await;
        if framework == testkit::TestFramework::None {
            tracing::info!("no tests configured");
            return RoundStep::Proceed;
        }

        if let Some(tx) = phases {
            let _ = tx.send(MergePhase::Testing);
        }

        let worktree = request.worktree.clone();
        let framework_clone = framework.clone();
        let run = match git_call(move || testkit::run(&worktree, &framework_clone)).await {
            Ok(run) => run,
            Err(e) => return RoundStep::Abort(format!("failed to run tests: {e}")),
        };

        if run.passed {
            return RoundStep::Proceed;
        }

        tracing::info!("tests failing, invoking agent to repair");
        let fix = self
            .agent
            .invoke(AgentRequest {
                prompt: prompt::compose_test_fix_prompt(&run.output),
                workdir: request.worktree.clone(),
                timeout: request.agent_timeout,
                events: None,
            })
            .await;
        match fix {
            Ok(_) => RoundStep::Retry("tests failed; agent attempted a fix".to_string()),
            Err(e) => RoundStep::Retry(format!("test fix agent failed: {e}")),
        }
    }
}

enum RoundStep {
    /// Continue to the next stage of this round.
    Proceed,
    /// Start the next round (bounded).
    Retry(String),
    /// Unrecoverable; fail the pipeline now.
    Abort(String),
}

/// Run blocking git/test work off the async runtime.
async fn git_call<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f)
        .await
        .expect("blocking git task panicked")
}
