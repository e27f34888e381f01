use anyhow::Result;
use colored::Colorize;

use crate::config::RelayConfig;
use crate::web::RelayServer;

/// Run the relay until an interrupt or termination signal drains it
pub async fn run_relay_server(config: RelayConfig) -> Result<()> {
    println!("{}", "🖥️  Starting termrelay...".bold());
    println!("   WebSocket endpoint: ws://{}{}", config.bind_addr, config.terminal_path);
    println!("   Shell: {}", config.shell.program);
    println!("   Working directory: {}", config.shell.working_dir.display());
    if config.persistent {
        println!(
            "   Sessions persist for {}s of inactivity",
            config.policy.session_timeout.as_secs()
        );
    } else {
        println!("   {}", "Ephemeral mode: sessions end with their connection".yellow());
    }

    RelayServer::new(config).start().await
}
