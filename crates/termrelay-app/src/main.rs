use anyhow::Result;
use clap::Parser;

use termrelay::{app, logging, Cli, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let config = RelayConfig::from_cli(&cli)?;
    app::run_relay_server(config).await
}
