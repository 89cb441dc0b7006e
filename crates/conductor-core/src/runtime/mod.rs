//! Sandboxed worker containers.
//!
//! The engine talks to a container runtime through the [`ContainerRuntime`]
//! trait so tests can substitute a fake. The real implementation shells out
//! to the `docker` binary: create-and-start in one `docker run -d`, exit via
//! `docker wait`, termination via `docker stop` (SIGTERM, grace, SIGKILL),
//! log following via `docker logs -f`.

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Hostname inside the container that resolves to the engine's host, used
/// for the status callback URL.
pub const HOST_GATEWAY_ALIAS: &str = "host.conductor.internal";

/// Errors from container runtime invocations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("unexpected runtime output: {0}")]
    Parse(String),
}

/// A bind mount into the worker container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_write(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// Everything needed to launch one worker container.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Container name (sanitized for the runtime).
    pub name: String,
    pub image: String,
    /// Working directory inside the container.
    pub workdir: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    /// Map [`HOST_GATEWAY_ALIAS`] to the host so the callback URL resolves.
    pub host_gateway: bool,
    pub cpu_limit: Option<f64>,
    /// Memory cap in runtime syntax, e.g. `2g`.
    pub memory_limit: Option<String>,
    /// Remove the container when it exits.
    pub auto_remove: bool,
    /// Command override; empty means the image entrypoint.
    pub command: Vec<String>,
}

/// Handle to a started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// A line-oriented log stream from a container.
pub type LogStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Interface to the container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a container and return its handle.
    async fn start(&self, spec: &WorkerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Wait for the container to exit and return its exit code. Cancellable:
    /// dropping the future does not affect the container.
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    /// Stop the container: SIGTERM, wait up to `grace`, then SIGKILL.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError>;

    /// Follow the container's output as lines.
    async fn logs_stream(&self, handle: &ContainerHandle) -> Result<LogStream, RuntimeError>;

    /// Handles of containers this engine started that are still running.
    async fn list_alive(&self) -> Result<Vec<ContainerHandle>, RuntimeError>;

    /// Force-remove a container, ignoring "no such container".
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}

// ---------------------------------------------------------------------------
// Docker implementation
// ---------------------------------------------------------------------------

/// Runtime backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    /// Name prefix identifying containers owned by this engine.
    name_prefix: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            name_prefix: "conductor-".to_string(),
        }
    }

    /// Override the binary, e.g. `podman` or a test stub.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            name_prefix: "conductor-".to_string(),
        }
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Full container name for a worker spec name.
    pub fn container_name(&self, name: &str) -> String {
        format!("{}{}", self.name_prefix, sanitize_name(name))
    }

    async fn docker(&self, args: &[String]) -> Result<String, RuntimeError> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::Spawn {
                command: format!("{} {}", self.binary, args.join(" ")),
                source: e,
            })?;
        if !output.status.success() {
            return Err(RuntimeError::Command {
                command: format!("{} {}", self.binary, args.first().map(String::as_str).unwrap_or("")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Arguments for `docker run -d` from a spec. Split out for testing.
    fn run_args(&self, spec: &WorkerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name(&spec.name),
            "-w".to_string(),
            spec.workdir.clone(),
        ];
        if spec.auto_remove {
            args.push("--rm".to_string());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.source.display(), mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(volume);
        }
        if spec.host_gateway {
            args.push("--add-host".to_string());
            args.push(format!("{HOST_GATEWAY_ALIAS}:host-gateway"));
        }
        if let Some(cpus) = spec.cpu_limit {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(ref memory) = spec.memory_limit {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &WorkerSpec) -> Result<ContainerHandle, RuntimeError> {
        // A leftover container with the same name blocks the run; clear it.
        let name = self.container_name(&spec.name);
        let _ = self
            .docker(&["rm".to_string(), "-f".to_string(), name.clone()])
            .await;

        let args = self.run_args(spec);
        let id = self.docker(&args).await?;
        if id.is_empty() {
            return Err(RuntimeError::Parse(
                "docker run returned no container id".to_string(),
            ));
        }
        tracing::info!(container = %id, name = %name, image = %spec.image, "started worker container");
        Ok(ContainerHandle { id, name })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let stdout = self
            .docker(&["wait".to_string(), handle.id.clone()])
            .await?;
        stdout
            .trim()
            .parse()
            .map_err(|_| RuntimeError::Parse(format!("docker wait returned {stdout:?}")))
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        let secs = grace.as_secs().max(1).to_string();
        match self
            .docker(&[
                "stop".to_string(),
                "-t".to_string(),
                secs,
                handle.id.clone(),
            ])
            .await
        {
            Ok(_) => Ok(()),
            // Already gone is success for stop.
            Err(RuntimeError::Command { stderr, .. }) if stderr.contains("No such container") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn logs_stream(&self, handle: &ContainerHandle) -> Result<LogStream, RuntimeError> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "-f", &handle.id])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| RuntimeError::Spawn {
                command: format!("{} logs -f", self.binary),
                source: e,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::Parse("docker logs produced no stdout pipe".to_string())
        })?;

        let stream = async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => yield line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading container logs");
                        break;
                    }
                }
            }
            // Reap the follower process.
            let _ = child.wait().await;
        };
        Ok(Box::pin(stream))
    }

    async fn list_alive(&self) -> Result<Vec<ContainerHandle>, RuntimeError> {
        let filter = format!("name={}", self.name_prefix);
        let stdout = self
            .docker(&[
                "ps".to_string(),
                "--filter".to_string(),
                filter,
                "--format".to_string(),
                "{{.ID}}\t{{.Names}}".to_string(),
            ])
            .await?;
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let (id, name) = line.split_once('\t')?;
                Some(ContainerHandle {
                    id: id.to_string(),
                    name: name.to_string(),
                })
            })
            .collect())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        match self
            .docker(&["rm".to_string(), "-f".to_string(), handle.id.clone()])
            .await
        {
            Ok(_) => Ok(()),
            Err(RuntimeError::Command { stderr, .. }) if stderr.contains("No such container") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Restrict a name to characters container runtimes accept.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
