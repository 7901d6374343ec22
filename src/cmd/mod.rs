//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled      |
//! |----------|-----------------------|
//! | `serve`  | `Serve`               |
//! | `db`     | `InitDb`, `Status`    |
//! | `config` | `Config`              |

pub mod config;
pub mod db;
pub mod serve;

pub use config::cmd_config;
pub use db::{cmd_init_db, cmd_status};
pub use serve::cmd_serve;

use anyhow::Result;
use std::path::{Path, PathBuf};

use plan_runner::config::RunnerConfig;

/// Resolve the effective configuration: file, then `PLAN_RUNNER_*`
/// variables, then CLI flags (applied by the caller).
pub fn load_config(config_path: Option<&Path>) -> Result<RunnerConfig> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(RunnerConfig::default_path);
    let mut config = if config_path.is_some() {
        RunnerConfig::load(&path)?
    } else {
        RunnerConfig::load_or_default(&path)?
    };
    config.apply_env()?;
    Ok(config)
}

/// Apply the global `--db-path` flag, if given.
pub fn override_db_path(config: &mut RunnerConfig, db_path: Option<&PathBuf>) {
    if let Some(path) = db_path {
        config.storage.db_path = path.clone();
    }
}
