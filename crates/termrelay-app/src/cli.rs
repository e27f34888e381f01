use clap::Parser;
use std::path::PathBuf;

use termrelay_types::{
    DEFAULT_PORT, DEFAULT_TERMINAL_PATH, KILL_GRACE_MS, REAP_INTERVAL_SECS, REPLAY_BUFFER_BYTES, REPLAY_DELAY_MS,
    SESSION_TIMEOUT_SECS,
};

/// CLI arguments for termrelay
#[derive(Parser, Debug, Clone)]
#[command(name = "termrelay")]
#[command(about = "Persistent WebSocket relay between browser terminals and shell processes")]
#[command(version)]
pub struct Cli {
    /// Port for the WebSocket endpoint
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "TERMRELAY_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Route serving the terminal WebSocket
    #[arg(long, env = "TERMRELAY_PATH", default_value = DEFAULT_TERMINAL_PATH)]
    pub path: String,

    /// Shell executable launched for every session
    #[arg(long, env = "TERMRELAY_SHELL", default_value = "/bin/bash")]
    pub shell: String,

    /// Working directory for spawned shells (default: current directory)
    #[arg(long, env = "TERMRELAY_WORKDIR", value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Extra environment variable for spawned shells, may be repeated
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Evict sessions idle for longer than this many seconds
    #[arg(long, env = "TERMRELAY_SESSION_TIMEOUT", default_value_t = SESSION_TIMEOUT_SECS)]
    pub session_timeout_secs: u64,

    /// Seconds between reaper sweeps
    #[arg(long, env = "TERMRELAY_REAP_INTERVAL", default_value_t = REAP_INTERVAL_SECS)]
    pub reap_interval_secs: u64,

    /// Bytes of recent output kept per session for replay
    #[arg(long, env = "TERMRELAY_REPLAY_BYTES", default_value_t = REPLAY_BUFFER_BYTES)]
    pub replay_bytes: usize,

    /// Delay before replaying output to a reconnecting client
    #[arg(long, default_value_t = REPLAY_DELAY_MS)]
    pub replay_delay_ms: u64,

    /// Grace period between hang-up and forced kill of a shell
    #[arg(long, default_value_t = KILL_GRACE_MS)]
    pub kill_grace_ms: u64,

    /// End sessions when their connection closes instead of keeping them for reconnects
    #[arg(long, env = "TERMRELAY_EPHEMERAL")]
    pub ephemeral: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Parse a `KEY=VALUE` pair
fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{s}'"))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_reference_policy() {
        let cli = Cli::try_parse_from(["termrelay"]).unwrap();
        assert_eq!(cli.port, 8090);
        assert_eq!(cli.path, "/terminal");
        assert_eq!(cli.replay_bytes, 5000);
        assert_eq!(cli.session_timeout_secs, 1800);
        assert_eq!(cli.reap_interval_secs, 60);
        assert!(!cli.ephemeral);
    }

    #[test]
    fn env_pairs_accumulate() {
        let cli = Cli::try_parse_from(["termrelay", "--env", "LC_ALL=C.UTF-8", "--env", "EMPTY="]).unwrap();
        assert_eq!(
            cli.env,
            vec![
                ("LC_ALL".to_string(), "C.UTF-8".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn malformed_env_pair_is_rejected() {
        assert!(Cli::try_parse_from(["termrelay", "--env", "NOEQUALS"]).is_err());
        assert!(Cli::try_parse_from(["termrelay", "--env", "=value"]).is_err());
    }
}
