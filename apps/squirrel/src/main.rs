use anyhow::Result;
use clap::Parser;

use squirrel::cli::{Cli, Commands};
use squirrel::config::ServerConfig;
use squirrel::telemetry::Telemetry;
use squirrel::{client, server};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(matches!(cli.command, Commands::Serve(_)))?;

    match cli.command {
        Commands::Serve(args) => {
            let config = ServerConfig::try_from(args)?;
            server::run(config, telemetry.metrics_handle()).await
        }
        Commands::Broadcast(args) => client::run_broadcast(args.remote.domain(), args.output).await,
        Commands::Listen(args) => client::run_listen(args.remote.domain(), args.peer_id).await,
    }
}
