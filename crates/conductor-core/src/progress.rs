//! Experience log: structured completion entries in `PROGRESS.md`.
//!
//! Every completed task appends an entry to the repository's progress file,
//! which travels with merges like any other file. Before a new task launches,
//! the most recent entries are folded into the agent prompt under strict
//! byte budgets, and a cheap lexical search can pull related entries from
//! other projects.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;

/// File name of the experience log inside a repository.
pub const PROGRESS_FILE: &str = "PROGRESS.md";

/// Default number of entries folded into a prompt.
pub const DEFAULT_ENTRIES: usize = 5;
/// How much of the file tail is read at all.
pub const READ_BUDGET: usize = 12 * 1024;
/// How much ends up in the prompt.
pub const PROMPT_BUDGET: usize = 3 * 1024;
/// Budget for cross-project snippets.
pub const CROSS_PROJECT_BUDGET: usize = 2560;
/// Cross-project entry cap.
pub const CROSS_PROJECT_ENTRIES: usize = 3;

/// One structured completion entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEntry {
    pub title: String,
    /// What went wrong or was tricky during the task.
    pub problem: String,
    /// What was done.
    pub solution: String,
    /// What future workers should know.
    pub prevention: String,
}

/// Append an entry to `<repo>/PROGRESS.md`, creating the file on first use.
pub fn append_entry(repo: &Path, entry: &CompletionEntry) -> std::io::Result<()> {
    let path = repo.join(PROGRESS_FILE);
    let mut content = std::fs::read_to_string(&path).unwrap_or_default();
    if content.is_empty() {
        content.push_str("# Progress\n");
    }
    if !content.ends_with('\n') {
        content.push('\n');
    }
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M UTC");
    content.push_str(&format!(
        "\n## [{timestamp}] {title}\n\n**Problem:** {problem}\n\n**Solution:** {solution}\n\n**Prevention:** {prevention}\n",
        title = entry.title.trim(),
        problem = compact(&entry.problem),
        solution = compact(&entry.solution),
        prevention = compact(&entry.prevention),
    ));
    std::fs::write(&path, content)
}

/// Collapse internal newlines so one entry stays one block per label.
fn compact(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "(not recorded)".to_string();
    }
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The last `max_entries` entries of a project's progress file, bounded by
/// both the read budget (bytes read from disk) and the prompt budget (bytes
/// returned). Returns `None` when there is nothing useful.
pub fn recent_entries(repo: &Path, max_entries: usize) -> Option<String> {
    let raw = std::fs::read_to_string(repo.join(PROGRESS_FILE)).ok()?;
    let tail = byte_tail(&raw, READ_BUDGET);

    let mut entries: Vec<&str> = split_entries(tail);
    if entries.is_empty() {
        return None;
    }
    let keep = entries.len().saturating_sub(max_entries);
    entries.drain(..keep);

    let mut snippet = String::new();
    // Newest entries matter most; fill the budget from the end.
    for entry in entries.iter().rev() {
        let block = format!("## {}\n", entry.trim());
        if snippet.len() + block.len() > PROMPT_BUDGET {
            break;
        }
        snippet.insert_str(0, &block);
    }
    if snippet.trim().is_empty() {
        None
    } else {
        Some(snippet.trim_end().to_string())
    }
}

/// Search other projects' progress files for entries lexically close to a
/// task, labeled for the prompt. `repos` pairs a display name with the repo
/// path; the current project should be excluded by the caller.
pub fn cross_project_snippets(repos: &[(String, std::path::PathBuf)], query: &str) -> Option<String> {
    let query_tokens = token_set(query);
    if query_tokens.is_empty() {
        return None;
    }

    let mut scored: Vec<(usize, String)> = Vec::new();
    for (name, repo) in repos {
        let Ok(raw) = std::fs::read_to_string(repo.join(PROGRESS_FILE)) else {
            continue;
        };
        for entry in split_entries(byte_tail(&raw, READ_BUDGET)) {
            let overlap = token_set(entry).intersection(&query_tokens).count();
            if overlap >= 2 {
                scored.push((overlap, format!("[cross-project: {name}] ## {}", entry.trim())));
            }
        }
    }
    if scored.is_empty() {
        return None;
    }

    scored.sort_by(|a, b| b.0.cmp(&a.0));
    let mut snippet = String::new();
    for (_, block) in scored.into_iter().take(CROSS_PROJECT_ENTRIES) {
        if snippet.len() + block.len() + 1 > CROSS_PROJECT_BUDGET {
            break;
        }
        snippet.push_str(&block);
        snippet.push('\n');
    }
    if snippet.is_empty() {
        None
    } else {
        Some(snippet.trim_end().to_string())
    }
}

/// Entry bodies (without the leading `## `), oldest first.
fn split_entries(text: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    for chunk in text.split("\n## ") {
        let chunk = chunk.trim();
        // The part before the first heading is the file preamble.
        if chunk.is_empty() || !chunk.starts_with('[') {
            continue;
        }
        entries.push(chunk);
    }
    entries
}

/// Last `limit` bytes of `s` on a char boundary, starting at a line break
/// when possible so a heading is not cut in half.
fn byte_tail(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut start = s.len() - limit;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    match s[start..].find('\n') {
        Some(pos) => &s[start + pos + 1..],
        None => &s[start..],
    }
}

/// Stemmed, lowercase tokens of at least three characters.
fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(|w| stem(&w.to_lowercase()))
        .collect()
}

/// Crude suffix-stripping stemmer, enough for lexical overlap.
fn stem(word: &str) -> String {
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(base) = word.strip_suffix(suffix) {
            if base.len() >= 3 {
                return base.to_string();
            }
        }
    }
    word.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(title: &str) -> CompletionEntry {
        CompletionEntry {
            title: title.to_string(),
            problem: "tests flaked on the auth timeout".to_string(),
            solution: "raised the deadline and mocked the clock".to_string(),
            prevention: "never rely on wall time in auth tests".to_string(),
        }
    }

    #[test]
    fn append_creates_and_extends_the_file() {
        let dir = TempDir::new().unwrap();
        append_entry(dir.path(), &entry("fix auth timeout")).unwrap();
        append_entry(dir.path(), &entry("second task")).unwrap();

        let content = std::fs::read_to_string(dir.path().join(PROGRESS_FILE)).unwrap();
        assert!(content.starts_with("# Progress\n"));
        assert_eq!(content.matches("\n## [").count(), 2);
        assert!(content.contains("**Problem:** tests flaked"));
        assert!(content.contains("**Prevention:** never rely"));
    }

    #[test]
    fn append_compacts_multiline_fields() {
        let dir = TempDir::new().unwrap();
        let mut e = entry("multiline");
        e.solution = "line one\nline two\n\nline three".to_string();
        append_entry(dir.path(), &e).unwrap();
        let content = std::fs::read_to_string(dir.path().join(PROGRESS_FILE)).unwrap();
        assert!(content.contains("**Solution:** line one line two line three"));
    }

    #[test]
    fn recent_entries_returns_newest_bounded_count() {
        let dir = TempDir::new().unwrap();
        for i in 0..8 {
            append_entry(dir.path(), &entry(&format!("task number {i}"))).unwrap();
        }
        let snippet = recent_entries(dir.path(), DEFAULT_ENTRIES).unwrap();
        // Only the last five appear.
        assert!(!snippet.contains("task number 2"));
        assert!(snippet.contains("task number 3"));
        assert!(snippet.contains("task number 7"));
        assert!(snippet.len() <= PROMPT_BUDGET);
    }

    #[test]
    fn recent_entries_handles_missing_or_empty_file() {
        let dir = TempDir::new().unwrap();
        assert!(recent_entries(dir.path(), 5).is_none());
        std::fs::write(dir.path().join(PROGRESS_FILE), "# Progress\n").unwrap();
        assert!(recent_entries(dir.path(), 5).is_none());
    }

    #[test]
    fn recent_entries_prefers_newest_under_budget_pressure() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            let mut e = entry(&format!("bulky {i}"));
            e.solution = format!("{} {}", "detail".repeat(120), i);
            append_entry(dir.path(), &e).unwrap();
        }
        let snippet = recent_entries(dir.path(), DEFAULT_ENTRIES).unwrap();
        assert!(snippet.len() <= PROMPT_BUDGET);
        // The newest entry always survives budget trimming.
        assert!(snippet.contains("bulky 4"));
    }

    #[test]
    fn cross_project_matches_by_overlap() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        append_entry(dir_a.path(), &entry("auth timeout investigation")).unwrap();
        append_entry(
            dir_b.path(),
            &CompletionEntry {
                title: "styling cleanup".to_string(),
                problem: "css specificity".to_string(),
                solution: "scoped styles".to_string(),
                prevention: "lint selectors".to_string(),
            },
        )
        .unwrap();

        let repos = vec![
            ("alpha".to_string(), dir_a.path().to_path_buf()),
            ("beta".to_string(), dir_b.path().to_path_buf()),
        ];
        let snippet =
            cross_project_snippets(&repos, "fix the auth timeout in login tests").unwrap();
        assert!(snippet.contains("[cross-project: alpha]"));
        assert!(!snippet.contains("beta"));
        assert!(snippet.len() <= CROSS_PROJECT_BUDGET);
    }

    #[test]
    fn cross_project_returns_none_without_matches() {
        let dir = TempDir::new().unwrap();
        let repos = vec![("only".to_string(), dir.path().to_path_buf())];
        assert!(cross_project_snippets(&repos, "anything at all here").is_none());
    }

    #[test]
    fn stemming_normalizes_suffixes() {
        assert_eq!(stem("timeouts"), "timeout");
        assert_eq!(stem("testing"), "test");
        assert_eq!(stem("mocked"), "mock");
        assert_eq!(stem("fixes"), "fix");
        // Too short to strip.
        assert_eq!(stem("les"), "les");
    }

    #[test]
    fn byte_tail_starts_on_a_line_boundary() {
        let text = format!("{}\nheading line\nrest", "x".repeat(20_000));
        let tail = byte_tail(&text, 30);
        assert!(tail.starts_with("rest") || tail.starts_with("heading"));
    }
}
