//! In-process agent invocations.
//!
//! Plan generation and merge-time fixes run the agent CLI directly on the
//! host (no container): spawn `<agent-cli> -p --skip-permissions
//! --stream-json --verbose` in a working directory, write the prompt to
//! stdin, and parse the JSONL stream from stdout. The [`AgentInvoker`] trait
//! exists so tests substitute a scripted fake.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::stream::{self, LogEvent};

/// Errors from an agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent binary {binary:?}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent exceeded {0:?}")]
    Timeout(Duration),

    #[error("agent exited with code {code}: {detail}")]
    Failed { code: i32, detail: String },
}

/// One agent call.
#[derive(Debug)]
pub struct AgentRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Optional live event sink (plan streaming).
    pub events: Option<mpsc::UnboundedSender<LogEvent>>,
}

/// Collected output of a completed agent call.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Assistant prose, concatenated in stream order.
    pub text: String,
    /// Error frames observed on the stream.
    pub errors: Vec<String>,
}

/// Something that can run the agent to completion.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutcome, AgentError>;
}

// ---------------------------------------------------------------------------
// CLI implementation
// ---------------------------------------------------------------------------

/// Agent backed by the external CLI binary.
#[derive(Debug, Clone)]
pub struct CliAgent {
    binary: String,
    /// Extra environment (API key, base URL, model, proxies).
    env: Vec<(String, String)>,
}

impl CliAgent {
    pub fn new(binary: impl Into<String>, env: Vec<(String, String)>) -> Self {
        Self {
            binary: binary.into(),
            env,
        }
    }
}

#[async_trait]
impl AgentInvoker for CliAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutcome, AgentError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-p", "--skip-permissions", "--stream-json", "--verbose"])
            .current_dir(&request.workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| AgentError::Spawn {
            binary: self.binary.clone(),
            source: e,
        })?;

        // The CLI reads the user prompt from stdin in -p mode; close stdin so
        // it starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                tracing::warn!(error = %e, "failed to write prompt to agent stdin");
            }
        }

        let stdout = child.stdout.take();
        let events = request.events.clone();
        let deadline = tokio::time::Instant::now() + request.timeout;

        let collect = async {
            let mut text = String::new();
            let mut errors = Vec::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    for event in stream::parse_line(&line) {
                        match &event {
                            LogEvent::Assistant { text: t, .. } => {
                                if !text.is_empty() {
                                    text.push('\n');
                                }
                                text.push_str(t);
                            }
                            LogEvent::Error { message } => errors.push(message.clone()),
                            _ => {}
                        }
                        if let Some(ref tx) = events {
                            let _ = tx.send(event);
                        }
                    }
                }
            }
            (text, errors)
        };

        let (text, errors) = match tokio::time::timeout_at(deadline, collect).await {
            Ok(done) => done,
            Err(_) => {
                terminate(&mut child).await;
                return Err(AgentError::Timeout(request.timeout));
            }
        };

        // Stdout is closed; the process should exit promptly. Allow a short
        // reap window in case it lingers with the pipe shut.
        let status = match tokio::time::timeout_at(deadline + Duration::from_secs(5), child.wait())
            .await
        {
            Ok(status) => status,
            Err(_) => {
                terminate(&mut child).await;
                return Err(AgentError::Timeout(request.timeout));
            }
        };

        match status {
            Ok(status) if status.success() => Ok(AgentOutcome { text, errors }),
            Ok(status) => Err(AgentError::Failed {
                code: status.code().unwrap_or(-1),
                detail: errors.last().cloned().unwrap_or_else(|| "agent failed".to_string()),
            }),
            Err(e) => Err(AgentError::Failed {
                code: -1,
                detail: format!("failed to reap agent process: {e}"),
            }),
        }
    }
}

/// SIGTERM, short grace, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from a child we spawned.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.kill().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write an executable script posing as the agent binary.
    fn fake_agent(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    fn request(dir: &TempDir) -> AgentRequest {
        AgentRequest {
            prompt: "do the thing".to_string(),
            workdir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(10),
            events: None,
        }
    }

    #[tokio::test]
    async fn collects_assistant_text_in_order() {
        let dir = TempDir::new().unwrap();
        let binary = fake_agent(
            &dir,
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"second"}]}}'
"#,
        );
        let agent = CliAgent::new(binary, Vec::new());
        let outcome = agent.invoke(request(&dir)).await.unwrap();
        assert_eq!(outcome.text, "first\nsecond");
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn prompt_arrives_on_stdin() {
        let dir = TempDir::new().unwrap();
        // Echo the prompt back as a result frame.
        let binary = fake_agent(
            &dir,
            r#"PROMPT=$(cat)
printf '{"type":"result","result":"%s"}\n' "$PROMPT"
"#,
        );
        let agent = CliAgent::new(binary, Vec::new());
        let outcome = agent.invoke(request(&dir)).await.unwrap();
        assert_eq!(outcome.text, "do the thing");
    }

    #[tokio::test]
    async fn forwards_events_to_sink() {
        let dir = TempDir::new().unwrap();
        let binary = fake_agent(
            &dir,
            r#"echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"result","result":"done"}'
"#,
        );
        let agent = CliAgent::new(binary, Vec::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut req = request(&dir);
        req.events = Some(tx);
        agent.invoke(req).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                LogEvent::ToolUse { .. } => "tool_use",
                LogEvent::Result { .. } => "result",
                LogEvent::Assistant { .. } => "assistant",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["tool_use", "result", "assistant"]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_stream_error() {
        let dir = TempDir::new().unwrap();
        let binary = fake_agent(
            &dir,
            r#"echo '{"type":"error","message":"credit exhausted"}'
exit 1
"#,
        );
        let agent = CliAgent::new(binary, Vec::new());
        let err = agent.invoke(request(&dir)).await.unwrap_err();
        match err {
            AgentError::Failed { code, detail } => {
                assert_eq!(code, 1);
                assert_eq!(detail, "credit exhausted");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_agent() {
        let dir = TempDir::new().unwrap();
        let binary = fake_agent(&dir, "sleep 600\n");
        let agent = CliAgent::new(binary, Vec::new());
        let mut req = request(&dir);
        req.timeout = Duration::from_millis(200);

        let started = std::time::Instant::now();
        let err = agent.invoke(req).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let agent = CliAgent::new("/nonexistent/agent-cli", Vec::new());
        let err = agent.invoke(request(&dir)).await.unwrap_err();
        assert!(matches!(err, AgentError::Spawn { .. }));
    }
}
