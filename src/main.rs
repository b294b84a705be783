//! `relay` binary: serves `/create`, `/join`, `/health` and `/metrics` until ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::shutdown::ShutdownOutcome;
use relay_server::{metrics, RelayServer, ServerConfig};
use relay_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay", about = "WebSocket session relay")]
struct Cli {
    /// Bind host (overrides HOST).
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Log output format: json or pretty (overrides RELAY_LOG_FORMAT).
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl Cli {
    fn server_config(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        format: cli.log_format,
        ..TelemetryConfig::default()
    })
    .context("Failed to initialise logging")?;

    let config = cli.server_config(ServerConfig::from_env());
    info!(
        bind = %config.bind_addr(),
        queue_capacity = config.subscriber_queue_capacity,
        overflow = %config.overflow,
        "starting relay"
    );

    let handle = metrics::install_recorder().context("Failed to install metrics recorder")?;
    let server = RelayServer::new(config, handle);
    let (addr, task) = server.listen().await.context("Failed to bind server")?;
    info!(%addr, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutting down");

    if server.shutdown().graceful_shutdown(vec![task], None).await == ShutdownOutcome::TimedOut {
        warn!("server did not drain in time");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from(["relay", "--host", "0.0.0.0", "--port", "9000", "--log-format", "pretty"]);
        let cfg = cli.server_config(ServerConfig::default());
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9000");
        assert_eq!(cli.log_format, LogFormat::Pretty);
    }

    #[test]
    fn no_flags_keep_config() {
        let cli = Cli::parse_from(["relay", "--log-format", "json"]);
        let base = ServerConfig::default();
        let cfg = cli.server_config(base.clone());
        assert_eq!(cfg.bind_addr(), base.bind_addr());
    }
}
