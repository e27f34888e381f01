// Persistent terminal session management
//
// This crate owns the shell processes behind the relay: one PTY per session,
// a bounded replay buffer per session, the registry that decides which
// sessions are alive, and the reaper that evicts idle ones.

mod decoder;
mod error;
mod manager;
mod pty_handler;
mod reaper;
mod replay_buffer;
mod session;

// Re-export public API
pub use decoder::Utf8Decoder;
pub use error::{Result, TerminalError};
pub use manager::{SessionPolicy, SessionRegistry};
pub use pty_handler::{default_env, ExitInfo, PtyEvent, PtyHandler, ShellSpec};
pub use reaper::spawn_reaper;
pub use replay_buffer::ReplayBuffer;
pub use session::{ConnectionId, Frame, SessionId, SessionInfo, TerminalSession, Transport};
