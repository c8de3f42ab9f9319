use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4310;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_MAX_TURNS: i64 = 40;
const DEFAULT_PERMISSION_MODE: &str = "default";
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 1800;

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var > TOML > built-in default. Loaded once at
/// startup; there is no hot-reload — config changes require a restart.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    workers: Option<usize>,
    log: Option<String>,
    max_turns: Option<i64>,
    permission_mode: Option<String>,
    default_directory: Option<String>,
    agent_timeout_secs: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "dev",
            Environment::Production => "prod",
            Environment::Test => "test",
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" | "development" => Ok(Environment::Development),
            "prod" | "production" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => anyhow::bail!("unknown environment: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemvaConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub env: Environment,
    pub workers: usize,
    pub log: String,
    pub log_file: Option<PathBuf>,
    pub max_turns: i64,
    pub permission_mode: String,
    pub default_directory: Option<String>,
    pub agent_timeout_secs: u64,
}

impl MemvaConfig {
    /// Build config from CLI/env args + optional TOML file.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        env: Option<String>,
        workers: Option<usize>,
        log: Option<String>,
        log_file: Option<PathBuf>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let env = env
            .and_then(|e| e.parse().ok())
            .unwrap_or(Environment::Development);
        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let workers = workers.or(toml.workers).unwrap_or(DEFAULT_WORKERS).max(1);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let max_turns = toml.max_turns.unwrap_or(DEFAULT_MAX_TURNS);
        let permission_mode = toml
            .permission_mode
            .unwrap_or_else(|| DEFAULT_PERMISSION_MODE.to_string());
        let default_directory = toml.default_directory;
        let agent_timeout_secs = toml.agent_timeout_secs.unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS);

        Self {
            port,
            data_dir,
            env,
            workers,
            log,
            log_file,
            max_turns,
            permission_mode,
            default_directory,
            agent_timeout_secs,
        }
    }

    pub fn env_name(&self) -> &'static str {
        self.env.as_str()
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("memva");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("memva");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("memva");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("memva");
        }
    }
    PathBuf::from(".memva")
}
