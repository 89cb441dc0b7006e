//! Configuration: TOML file plus environment overrides.
//!
//! Resolution chain per knob: CLI flag > env var > config file > default.
//! The config file lives at `$XDG_CONFIG_HOME/conductor/config.toml` and is
//! written by `conductor init` with a generated callback secret.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use rand::RngCore;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub worker_count: Option<usize>,
    pub worker_image: Option<String>,
    /// Root scanned by the local-repo discovery endpoint.
    pub local_repo_root: Option<PathBuf>,
    pub task_timeout_minutes: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent CLI binary, found via $PATH when relative.
    pub binary: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret for worker callback tokens.
    pub callback_secret: Option<String>,
}

// -----------------------------------------------------------------------
// Resolved configuration
// -----------------------------------------------------------------------

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub web_port: u16,
    pub worker_count: usize,
    pub worker_image: String,
    pub local_repo_root: PathBuf,
    pub task_timeout_minutes: u64,
    pub agent_binary: String,
    /// Environment handed to agent invocations (API key, base URL, model,
    /// proxy settings).
    pub agent_env: Vec<(String, String)>,
    pub callback_secret: Vec<u8>,
}

impl ServerConfig {
    /// Load the config file (if present) and apply env overrides.
    pub fn load() -> Result<Self> {
        let file = match std::fs::read_to_string(config_path()) {
            Ok(raw) => toml::from_str::<ConfigFile>(&raw)
                .with_context(|| format!("failed to parse {}", config_path().display()))?,
            Err(_) => ConfigFile::default(),
        };
        Self::from_sources(&file)
    }

    fn from_sources(file: &ConfigFile) -> Result<Self> {
        let web_port = env_parse("WEB_PORT")?
            .or(file.server.port)
            .unwrap_or(8420);
        let worker_count = env_parse("WORKER_COUNT")?
            .or(file.server.worker_count)
            .unwrap_or(3);
        let data_dir = std::env::var_os("DATA_DIR")
            .map(PathBuf::from)
            .or_else(|| file.server.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("./data"));
        let worker_image = std::env::var("WORKER_IMAGE")
            .ok()
            .or_else(|| file.server.worker_image.clone())
            .unwrap_or_else(|| "conductor-worker:latest".to_string());
        let local_repo_root = file
            .server
            .local_repo_root
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let task_timeout_minutes = file.server.task_timeout_minutes.unwrap_or(30);

        let agent_binary = file
            .agent
            .binary
            .clone()
            .unwrap_or_else(|| "claude".to_string());

        let mut agent_env = Vec::new();
        for (env_key, file_value) in [
            ("AGENT_API_KEY", file.agent.api_key.clone()),
            ("AGENT_BASE_URL", file.agent.base_url.clone()),
            ("AGENT_MODEL", file.agent.model.clone()),
        ] {
            if let Some(value) = std::env::var(env_key).ok().or(file_value) {
                agent_env.push((env_key.to_string(), value));
            }
        }
        for proxy in ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"] {
            if let Ok(value) = std::env::var(proxy) {
                agent_env.push((proxy.to_string(), value));
            }
        }

        let callback_secret = match &file.auth.callback_secret {
            Some(hex_secret) => hex::decode(hex_secret)
                .context("auth.callback_secret in the config file is not valid hex")?,
            // Ephemeral secret: tokens stop validating across restarts, which
            // is safe because containers do not outlive the engine.
            None => generate_secret(),
        };

        Ok(Self {
            data_dir,
            web_port,
            worker_count,
            worker_image,
            local_repo_root,
            task_timeout_minutes,
            agent_binary,
            agent_env,
            callback_secret,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{key} has invalid value {raw:?}")),
        Err(_) => Ok(None),
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Config directory, always XDG layout.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("conductor");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("conductor")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// `conductor init`
// -----------------------------------------------------------------------

fn generate_secret() -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    rand::rng().fill_bytes(&mut secret);
    secret
}

/// Write a fresh config file (0600 on Unix).
pub fn run_init(force: bool) -> Result<()> {
    let path = config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let file = ConfigFile {
        server: ServerSection {
            port: Some(8420),
            data_dir: Some(PathBuf::from("./data")),
            worker_count: Some(3),
            worker_image: Some("conductor-worker:latest".to_string()),
            local_repo_root: dirs::home_dir(),
            task_timeout_minutes: Some(30),
        },
        agent: AgentSection {
            binary: Some("claude".to_string()),
            api_key: None,
            base_url: None,
            model: None,
        },
        auth: AuthSection {
            callback_secret: Some(hex::encode(generate_secret())),
        },
    };

    std::fs::create_dir_all(config_dir())
        .with_context(|| format!("failed to create {}", config_dir().display()))?;
    let contents = toml::to_string_pretty(&file).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    println!("wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file_or_env() {
        let config = ServerConfig::from_sources(&ConfigFile::default()).unwrap();
        assert_eq!(config.web_port, 8420);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.agent_binary, "claude");
        assert_eq!(config.callback_secret.len(), 32);
        assert_eq!(config.task_timeout_minutes, 30);
    }

    #[test]
    fn file_values_are_used() {
        let file: ConfigFile = toml::from_str(
            r#"
[server]
port = 9000
worker_count = 7
worker_image = "custom:1"

[agent]
binary = "my-agent"
model = "fast-model"

[auth]
callback_secret = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff"
"#,
        )
        .unwrap();
        let config = ServerConfig::from_sources(&file).unwrap();
        assert_eq!(config.web_port, 9000);
        assert_eq!(config.worker_count, 7);
        assert_eq!(config.worker_image, "custom:1");
        assert_eq!(config.agent_binary, "my-agent");
        assert!(
            config
                .agent_env
                .iter()
                .any(|(k, v)| k == "AGENT_MODEL" && v == "fast-model")
        );
        assert_eq!(config.callback_secret.len(), 32);
    }

    #[test]
    fn bad_secret_hex_is_rejected() {
        let file: ConfigFile = toml::from_str(
            r#"
[auth]
callback_secret = "not hex"
"#,
        )
        .unwrap();
        assert!(ServerConfig::from_sources(&file).is_err());
    }

    #[test]
    fn partial_file_parses() {
        let file: ConfigFile = toml::from_str("[server]\nport = 1234\n").unwrap();
        let config = ServerConfig::from_sources(&file).unwrap();
        assert_eq!(config.web_port, 1234);
        assert_eq!(config.worker_count, 3);
    }
}
