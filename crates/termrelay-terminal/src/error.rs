use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by PTY and session operations
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("invalid terminal geometry {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("working directory does not exist: {}", .0.display())]
    InvalidWorkingDir(PathBuf),

    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("pty error: {0}")]
    Pty(String),

    #[error("shell process has exited")]
    Exited,

    #[error("shell is not reading its input")]
    InputBacklog,

    #[error("session registry is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TerminalError>;
