//! `relay-loadgen` binary: runs a load profile until ctrl-c or the configured duration, then prints the report as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use relay_loadgen::{run, LoadConfig};
use relay_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = LoadConfig::parse();

    let format = match std::env::var("RELAY_LOG_FORMAT") {
        Ok(raw) => raw.parse::<LogFormat>().context("Invalid RELAY_LOG_FORMAT")?,
        Err(_) => LogFormat::Pretty,
    };
    init_telemetry(&TelemetryConfig {
        format,
        ..TelemetryConfig::default()
    })
    .context("Failed to initialise logging")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let _signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, closing producers");
        }
        on_signal.cancel();
    });

    let report = run(config, cancel).await;
    println!("{}", serde_json::to_string(&report).context("Failed to encode report")?);
    Ok(())
}
