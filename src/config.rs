//! Configuration for the plan runner.
//!
//! Read from `.plan-runner/config.toml`, then overlaid by `PLAN_RUNNER_*`
//! environment variables, then by CLI flags (file → environment → CLI).
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3150
//! dev_mode = false
//!
//! [storage]
//! db_path = ".plan-runner/runs.db"
//!
//! [executor]
//! kind = "command"
//! agent_id = "agent-execution"
//! model = "local-llm"
//! command = "./run-step.sh"
//! args = ["--quiet"]
//!
//! [streams]
//! event_buffer = 64
//! activity_buffer = 256
//! keepalive_secs = 15
//!
//! [logging]
//! json = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory holding the config file and the default database.
pub const RUNNER_DIR: &str = ".plan-runner";

/// Which executor performs task steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Echo the step action back in chunks (demos, tests)
    #[default]
    Mock,
    /// Spawn an external command per task step
    Command,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Mock => write!(f, "mock"),
            ExecutorKind::Command => write!(f, "command"),
        }
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(ExecutorKind::Mock),
            "command" => Ok(ExecutorKind::Command),
            _ => anyhow::bail!("Invalid executor kind '{}'. Valid values: mock, command", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS and bind on all interfaces
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3150
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(RUNNER_DIR).join("runs.db")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default)]
    pub kind: ExecutorKind,
    /// Agent identity echoed in `run_started`
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Program to run for the command executor
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments placed before the step action
    #[serde(default)]
    pub args: Vec<String>,
    /// Delay between mock output chunks
    #[serde(default = "default_mock_chunk_delay_ms")]
    pub mock_chunk_delay_ms: u64,
}

fn default_agent_id() -> String {
    "agent-execution".to_string()
}

fn default_mock_chunk_delay_ms() -> u64 {
    50
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            agent_id: default_agent_id(),
            model: None,
            command: None,
            args: Vec::new(),
            mock_chunk_delay_ms: default_mock_chunk_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsSection {
    /// Capacity of each run's dedicated event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Capacity of the activity broadcast channel
    #[serde(default = "default_activity_buffer")]
    pub activity_buffer: usize,
    /// SSE keep-alive interval
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_event_buffer() -> usize {
    64
}

fn default_activity_buffer() -> usize {
    256
}

fn default_keepalive_secs() -> u64 {
    15
}

impl Default for StreamsSection {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            activity_buffer: default_activity_buffer(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
}

/// Root of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub streams: StreamsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl RunnerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Load from `path`, falling back to defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        PathBuf::from(RUNNER_DIR).join("config.toml")
    }

    /// Overlay `PLAN_RUNNER_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from an environment-like lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PLAN_RUNNER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PLAN_RUNNER_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PLAN_RUNNER_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("PLAN_RUNNER_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(kind) = lookup("PLAN_RUNNER_EXECUTOR") {
            self.executor.kind = kind.parse()?;
        }
        if let Some(agent_id) = lookup("PLAN_RUNNER_AGENT_ID") {
            self.executor.agent_id = agent_id;
        }
        Ok(())
    }

    /// Check the configuration. Hard errors fail; soft issues come back as warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.streams.event_buffer == 0 {
            anyhow::bail!("streams.event_buffer must be greater than zero");
        }
        if self.streams.activity_buffer == 0 {
            anyhow::bail!("streams.activity_buffer must be greater than zero");
        }
        if self.executor.kind == ExecutorKind::Command
            && self
                .executor
                .command
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
        {
            anyhow::bail!("executor.command is required when executor.kind = \"command\"");
        }

        let mut warnings = Vec::new();
        if self.executor.kind == ExecutorKind::Mock && self.executor.command.is_some() {
            warnings.push("executor.command is ignored by the mock executor".to_string());
        }
        if self.executor.agent_id.trim().is_empty() {
            warnings.push("executor.agent_id is empty".to_string());
        }
        if self.streams.keepalive_secs == 0 {
            warnings.push("streams.keepalive_secs = 0 disables SSE keep-alive".to_string());
        }
        if self.server.dev_mode && self.server.host != default_host() {
            warnings.push(format!(
                "server.host '{}' is overridden by dev_mode (binds 0.0.0.0)",
                self.server.host
            ));
        }
        Ok(warnings)
    }
}
