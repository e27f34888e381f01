use anyhow::{bail, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use termrelay_terminal::{default_env, SessionPolicy, ShellSpec};
use termrelay_types::{DEFAULT_PORT, DEFAULT_TERMINAL_PATH};

use crate::cli::Cli;

/// Everything the relay needs to run
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub terminal_path: String,
    pub shell: ShellSpec,
    pub policy: SessionPolicy,
    /// Keep sessions alive across transport disconnects
    pub persistent: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            terminal_path: DEFAULT_TERMINAL_PATH.to_string(),
            shell: ShellSpec::default(),
            policy: SessionPolicy::default(),
            persistent: true,
        }
    }
}

impl RelayConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let ip: IpAddr = cli
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", cli.bind))?;

        if !cli.path.starts_with('/') {
            bail!("WebSocket path must start with '/', got '{}'", cli.path);
        }
        if cli.session_timeout_secs == 0 {
            bail!("--session-timeout-secs must be greater than zero");
        }
        if cli.reap_interval_secs == 0 {
            bail!("--reap-interval-secs must be greater than zero");
        }
        if cli.replay_bytes == 0 {
            bail!("--replay-bytes must be greater than zero");
        }

        let working_dir = match &cli.workdir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };
        if !working_dir.is_dir() {
            bail!("Working directory does not exist: {}", working_dir.display());
        }

        let mut env = default_env();
        for (key, value) in &cli.env {
            match env.iter_mut().find(|(existing, _)| existing == key) {
                Some(entry) => entry.1 = value.clone(),
                None => env.push((key.clone(), value.clone())),
            }
        }

        Ok(Self {
            bind_addr: SocketAddr::new(ip, cli.port),
            terminal_path: cli.path.clone(),
            shell: ShellSpec {
                program: cli.shell.clone(),
                working_dir,
                env,
            },
            policy: SessionPolicy {
                session_timeout: Duration::from_secs(cli.session_timeout_secs),
                reap_interval: Duration::from_secs(cli.reap_interval_secs),
                replay_bytes: cli.replay_bytes,
                replay_delay: Duration::from_millis(cli.replay_delay_ms),
                kill_grace: Duration::from_millis(cli.kill_grace_ms),
            },
            persistent: !cli.ephemeral,
        })
    }
}
