//! termrelay application library
//!
//! CLI, configuration, logging and the WebSocket server that binds browser
//! terminals to persistent shell sessions.

// Re-export workspace crates
pub use termrelay_terminal::{self as terminal, SessionPolicy, SessionRegistry, ShellSpec};
pub use termrelay_types as types;

// Local modules
pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod web;

// Re-exports from local modules
pub use cli::Cli;
pub use config::RelayConfig;
pub use web::RelayServer;
