//! Test framework detection and invocation for merge verification.
//!
//! The engine only needs to know *whether* a project's tests pass after a
//! rebase. Detection looks at marker files in the worktree; invocation runs
//! the conventional runner and captures a bounded output tail for the
//! fix-failing-tests prompt.

use std::path::Path;
use std::process::Command;

/// npm's placeholder test script in a fresh `package.json`.
const NPM_DEFAULT_TEST: &str = "echo \"Error: no test specified\" && exit 1";

/// Bytes of combined output kept for failure reporting.
const OUTPUT_TAIL: usize = 4096;

/// Which test runner a worktree uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestFramework {
    /// `package.json` with a real `scripts.test`.
    Node { script: String },
    /// pytest via `pytest.ini`, `pyproject.toml` or `setup.py`.
    Python,
    /// Nothing recognized; tests are considered passing.
    None,
}

/// Result of one test run.
#[derive(Debug, Clone)]
pub struct TestRun {
    pub passed: bool,
    /// Tail of combined stdout+stderr, for the fix prompt.
    pub output: String,
}

/// Inspect a worktree and decide which test runner applies.
pub fn detect(dir: &Path) -> TestFramework {
    let package_json = dir.join("package.json");
    if package_json.is_file() {
        if let Some(script) = node_test_script(&package_json) {
            return TestFramework::Node { script };
        }
    }
    for marker in ["pytest.ini", "pyproject.toml", "setup.py"] {
        if dir.join(marker).is_file() {
            return TestFramework::Python;
        }
    }
    TestFramework::None
}

/// A configured, non-placeholder `scripts.test` from package.json.
fn node_test_script(package_json: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(package_json).ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let script = value.get("scripts")?.get("test")?.as_str()?;
    if script.trim().is_empty() || script == NPM_DEFAULT_TEST {
        return None;
    }
    Some(script.to_string())
}

/// Run the detected framework in `dir`.
///
/// [`TestFramework::None`] passes without running anything.
pub fn run(dir: &Path, framework: &TestFramework) -> std::io::Result<TestRun> {
    let mut cmd = match framework {
        TestFramework::Node { .. } => {
            let mut c = Command::new("npm");
            c.arg("test");
            c
        }
        TestFramework::Python => {
            let mut c = Command::new("python3");
            c.args(["-m", "pytest"]);
            c
        }
        TestFramework::None => {
            return Ok(TestRun {
                passed: true,
                output: "no tests configured".to_string(),
            });
        }
    };

    let output = cmd.current_dir(dir).output()?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(TestRun {
        passed: output.status.success(),
        output: tail(&combined, OUTPUT_TAIL),
    })
}

/// Last `limit` bytes of `s`, on a char boundary.
fn tail(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut start = s.len() - limit;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_directory_has_no_tests() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect(dir.path()), TestFramework::None);
        let run = run(dir.path(), &TestFramework::None).unwrap();
        assert!(run.passed);
        assert_eq!(run.output, "no tests configured");
    }

    #[test]
    fn package_json_with_real_script_detected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"x","scripts":{"test":"vitest run"}}"#,
        )
        .unwrap();
        assert_eq!(
            detect(dir.path()),
            TestFramework::Node {
                script: "vitest run".to_string()
            }
        );
    }

    #[test]
    fn npm_placeholder_script_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            format!(r#"{{"scripts":{{"test":{}}}}}"#, serde_json::json!(NPM_DEFAULT_TEST)),
        )
        .unwrap();
        assert_eq!(detect(dir.path()), TestFramework::None);
    }

    #[test]
    fn malformed_package_json_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{ nope").unwrap();
        assert_eq!(detect(dir.path()), TestFramework::None);
    }

    #[test]
    fn python_markers_detected() {
        for marker in ["pytest.ini", "pyproject.toml", "setup.py"] {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join(marker), "").unwrap();
            assert_eq!(detect(dir.path()), TestFramework::Python, "marker {marker}");
        }
    }

    #[test]
    fn node_takes_precedence_over_python_markers() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"test":"jest"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "").unwrap();
        assert!(matches!(detect(dir.path()), TestFramework::Node { .. }));
    }

    #[test]
    fn tail_bounds_output() {
        let long = "a".repeat(10_000);
        let t = tail(&long, OUTPUT_TAIL);
        assert!(t.len() <= OUTPUT_TAIL + '…'.len_utf8());
        assert!(t.starts_with('…'));
        assert_eq!(tail("short", OUTPUT_TAIL), "short");
    }
}
