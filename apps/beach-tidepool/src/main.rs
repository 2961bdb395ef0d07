use anyhow::Result;
use beach_tidepool::{
    config::{Cli, Commands, ServerConfig},
    debug_client, server, telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Debug {
        url,
        token,
        room,
        command,
    }) = cli.command
    {
        telemetry::init_logging("warn")?;
        return debug_client::run_debug_client(url, token, room, command).await;
    }

    let telemetry = telemetry::Telemetry::init()?;
    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        tls = config.tls.is_some(),
        snapshot_path = %config.snapshot_path.display(),
        snapshot_interval_secs = config.snapshot_interval.as_secs(),
        "starting beach-tidepool"
    );

    server::run(config, telemetry.metrics_handle()).await
}
