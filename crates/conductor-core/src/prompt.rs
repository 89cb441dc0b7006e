//! Agent prompt composition.
//!
//! Builds the single prompt a worker receives at claim time: approved plan
//! (when present), experience-log context, the task description, and the
//! working-directory constraint. Pure string assembly, tested by markers.

/// Inputs assembled into a worker prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub task_id: String,
    pub task_title: String,
    pub description: String,
    /// Approved plan text, when the task went through the plan gate.
    pub plan: Option<String>,
    /// Recent entries from this project's progress file.
    pub experience: Option<String>,
    /// Labeled entries from other projects' progress files.
    pub cross_project: Option<String>,
    /// Directory the agent must stay inside (the worktree mount).
    pub working_dir: String,
}

/// Compose the worker prompt.
pub fn compose_worker_prompt(inputs: &PromptInputs) -> String {
    let mut prompt = String::with_capacity(4096);

    prompt.push_str(&format!(
        "# Task {id}: {title}\n\n",
        id = inputs.task_id,
        title = inputs.task_title
    ));

    if let Some(ref plan) = inputs.plan {
        prompt.push_str("## Approved plan\n\n");
        prompt.push_str("Follow this plan. It was reviewed and approved by the operator.\n\n");
        prompt.push_str(plan.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Description\n\n");
    prompt.push_str(inputs.description.trim());
    prompt.push_str("\n\n");

    if let Some(ref experience) = inputs.experience {
        prompt.push_str("## Lessons from previous tasks in this repository\n\n");
        prompt.push_str(experience.trim());
        prompt.push_str("\n\n");
    }

    if let Some(ref cross) = inputs.cross_project {
        prompt.push_str("## Related lessons from other projects\n\n");
        prompt.push_str(cross.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Constraints\n\n");
    prompt.push_str(&format!(
        "- Work ONLY inside `{dir}`. Do not read or modify anything outside it.\n",
        dir = inputs.working_dir
    ));
    prompt.push_str("- Never touch the `.git` file at the root of the working directory.\n");
    prompt.push_str(
        "- Commit your work with a descriptive message when done; exit without \
         committing if you could not complete the task.\n",
    );

    prompt
}

/// Prompt asking the agent to resolve rebase conflicts in the named files.
pub fn compose_conflict_prompt(base_branch: &str, files: &[String]) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!(
        "A rebase onto `{base_branch}` stopped on merge conflicts. Resolve the \
         conflict markers in these files, keeping the intent of both sides:\n\n"
    ));
    for file in files {
        prompt.push_str(&format!("- {file}\n"));
    }
    prompt.push_str(
        "\nEdit each file to a correct merged state, remove every conflict \
         marker, then stage the files with `git add`. Do NOT run `git rebase \
         --continue`; the orchestrator does that.\n",
    );
    prompt
}

/// Prompt asking the agent to fix failing tests after a rebase.
pub fn compose_test_fix_prompt(test_output: &str) -> String {
    let mut prompt = String::with_capacity(1024 + test_output.len());
    prompt.push_str(
        "The test suite fails on this branch after rebasing. Fix the code (or \
         the tests, if they encode outdated expectations) so the suite passes. \
         Commit your fix.\n\n## Test output\n\n```\n",
    );
    prompt.push_str(test_output.trim());
    prompt.push_str("\n```\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PromptInputs {
        PromptInputs {
            task_id: "t-000042".to_string(),
            task_title: "add install docs".to_string(),
            description: "Add a README section explaining install.".to_string(),
            plan: Some("1. Read README\n2. Add section".to_string()),
            experience: Some("## [2026-01-01] earlier task".to_string()),
            cross_project: Some("[cross-project: beta] ## entry".to_string()),
            working_dir: "/workspace".to_string(),
        }
    }

    #[test]
    fn prompt_contains_every_section() {
        let prompt = compose_worker_prompt(&inputs());
        assert!(prompt.contains("# Task t-000042: add install docs"));
        assert!(prompt.contains("## Approved plan"));
        assert!(prompt.contains("1. Read README"));
        assert!(prompt.contains("## Description"));
        assert!(prompt.contains("## Lessons from previous tasks"));
        assert!(prompt.contains("## Related lessons from other projects"));
        assert!(prompt.contains("Work ONLY inside `/workspace`"));
        assert!(prompt.contains("`.git` file"));
    }

    #[test]
    fn optional_sections_are_omitted() {
        let mut i = inputs();
        i.plan = None;
        i.experience = None;
        i.cross_project = None;
        let prompt = compose_worker_prompt(&i);
        assert!(!prompt.contains("## Approved plan"));
        assert!(!prompt.contains("Lessons from previous"));
        assert!(!prompt.contains("Related lessons"));
        assert!(prompt.contains("## Description"));
    }

    #[test]
    fn plan_text_is_included_verbatim() {
        let mut i = inputs();
        i.plan = Some("EXACT-PLAN-MARKER step one".to_string());
        let prompt = compose_worker_prompt(&i);
        assert!(prompt.contains("EXACT-PLAN-MARKER step one"));
    }

    #[test]
    fn conflict_prompt_names_files_and_base() {
        let prompt = compose_conflict_prompt(
            "main",
            &["README.md".to_string(), "src/lib.rs".to_string()],
        );
        assert!(prompt.contains("`main`"));
        assert!(prompt.contains("- README.md"));
        assert!(prompt.contains("- src/lib.rs"));
        assert!(prompt.contains("Do NOT run `git rebase"));
    }

    #[test]
    fn test_fix_prompt_embeds_output() {
        let prompt = compose_test_fix_prompt("FAILED tests/test_auth.py::test_login");
        assert!(prompt.contains("FAILED tests/test_auth.py::test_login"));
        assert!(prompt.contains("Commit your fix"));
    }
}
