//! Core types shared across termrelay crates
//!
//! Wire protocol messages, the ANSI status lines injected into terminal
//! streams, and the reference session policy constants.

pub mod ansi;
pub mod protocol;

pub use protocol::{classify, ClientMessage, Inbound, ServerMessage};

// ============================================================================
// Constants
// ============================================================================

/// Default TCP port for the WebSocket endpoint
pub const DEFAULT_PORT: u16 = 8090;

/// Default WebSocket route
pub const DEFAULT_TERMINAL_PATH: &str = "/terminal";

/// Maximum number of output bytes retained per session for replay
pub const REPLAY_BUFFER_BYTES: usize = 5000;

/// Inactivity window after which a session is reaped
pub const SESSION_TIMEOUT_SECS: u64 = 30 * 60;

/// Period of the reaper sweep
pub const REAP_INTERVAL_SECS: u64 = 60;

/// Delay between `session_restored` and the replay, lets the client renderer settle
pub const REPLAY_DELAY_MS: u64 = 200;

/// Grace window between the hang-up signal and the forced kill
pub const KILL_GRACE_MS: u64 = 1000;

/// Frames queued per connection before a client that stopped reading is dropped
pub const FRAME_QUEUE_CAPACITY: usize = 256;

/// Geometry used when the handshake carries none
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
