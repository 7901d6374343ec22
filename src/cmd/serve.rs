//! HTTP server command: `plan-runner serve`.

use anyhow::Result;

use plan_runner::config::RunnerConfig;

pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dev: bool,
}

pub async fn cmd_serve(mut config: RunnerConfig, overrides: ServeOverrides) -> Result<()> {
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if overrides.dev {
        config.server.dev_mode = true;
    }

    for warning in config.validate()? {
        tracing::warn!(%warning, "configuration warning");
    }

    plan_runner::execution::server::start_server(config).await
}
