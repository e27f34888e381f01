use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use termrelay_types::{ansi, ServerMessage};

use super::decoder::{trim_partial_prefix, Utf8Decoder};
use super::error::Result;
use super::pty_handler::{ExitInfo, PtyHandler};
use super::replay_buffer::ReplayBuffer;

/// Opaque 128-bit session token, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Frames queued for a bound transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(ServerMessage),
    /// Terminal output, sent unframed
    Output(String),
    /// Ask the connection to close itself
    Close,
}

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Sending half of one client connection.
///
/// A session only holds this as a back-reference; the connection owns its
/// own lifecycle and the session is re-pointed on reconnect.
///
/// The frame queue is bounded. A client that stops reading fills it, after
/// which the transport is marked overrun and the connection is expected to
/// close itself. The replay buffer still holds the tail for a reconnect.
#[derive(Debug, Clone)]
pub struct Transport {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    overrun: CancellationToken,
}

impl Transport {
    /// A transport and the receiving end its connection drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let transport = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            overrun: CancellationToken::new(),
        };
        (transport, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting. Returns `false` if the frame was dropped.
    pub fn send(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.overrun.is_cancelled() {
                    tracing::warn!(connection = self.id, "client is not keeping up, dropping transport");
                    self.overrun.cancel();
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_overrun(&self) -> bool {
        self.overrun.is_cancelled()
    }

    /// Resolves once a send found the queue full
    pub async fn overrun(&self) {
        self.overrun.cancelled().await
    }
}

struct Binding {
    transport: Transport,
    /// Output is buffered but not forwarded until the replay goes out
    replay_pending: bool,
}

struct SessionState {
    binding: Option<Binding>,
    buffer: ReplayBuffer,
    decoder: Utf8Decoder,
    last_activity: Instant,
}

/// Session summary for listings
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub pid: Option<u32>,
    pub working_dir: String,
    pub created_at: String,
    pub idle_secs: u64,
    pub attached: bool,
    pub buffered_bytes: usize,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// A single persistent terminal session.
///
/// All mutable state sits behind one mutex so transport binding, the replay
/// buffer and the activity clock change together.
pub struct TerminalSession {
    id: SessionId,
    pty: PtyHandler,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("pty", &self.pty)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    pub fn new(id: SessionId, pty: PtyHandler, working_dir: PathBuf, replay_bytes: usize) -> Self {
        Self {
            id,
            pty,
            working_dir,
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                binding: None,
                buffer: ReplayBuffer::new(replay_bytes),
                decoder: Utf8Decoder::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    pub fn pty(&self) -> &PtyHandler {
        &self.pty
    }

    pub fn is_alive(&self) -> bool {
        !self.pty.has_exited()
    }

    pub fn touch(&self) {
        self.state().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state().last_activity.elapsed()
    }

    pub fn is_attached(&self) -> bool {
        self.state().binding.is_some()
    }

    pub fn bound_connection(&self) -> Option<ConnectionId> {
        self.state().binding.as_ref().map(|b| b.transport.id())
    }

    pub fn buffered_len(&self) -> usize {
        self.state().buffer.len()
    }

    /// Point the session at `transport`.
    ///
    /// A previously bound transport is told why and asked to close. With
    /// `replay_pending`, live output is held back until [`replay`](Self::replay).
    pub fn attach(&self, transport: Transport, replay_pending: bool) {
        let mut state = self.state();
        if let Some(previous) = state.binding.take() {
            if previous.transport.id() != transport.id() {
                tracing::info!(session_id = %self.id, connection = previous.transport.id(), "transport superseded");
                previous.transport.send(Frame::Output(ansi::superseded_notice()));
                previous.transport.send(Frame::Close);
            }
        }
        state.binding = Some(Binding {
            transport,
            replay_pending,
        });
        state.last_activity = Instant::now();
    }

    /// Clear the binding if it still belongs to `connection`
    pub fn detach(&self, connection: ConnectionId) -> bool {
        let mut state = self.state();
        match &state.binding {
            Some(binding) if binding.transport.id() == connection => {
                state.binding = None;
                true
            }
            _ => false,
        }
    }

    /// Send the buffered tail to `connection` and resume live forwarding
    pub fn replay(&self, connection: ConnectionId) -> bool {
        let mut state = self.state();
        let state = &mut *state;
        let Some(binding) = state.binding.as_mut() else {
            return false;
        };
        if binding.transport.id() != connection || !binding.replay_pending {
            return false;
        }

        let snapshot = state.buffer.snapshot();
        // Bytes still held by the decoder arrive with the next live chunk
        let end = snapshot.len().saturating_sub(state.decoder.pending_len());
        let text = String::from_utf8_lossy(trim_partial_prefix(&snapshot[..end])).into_owned();
        let text = if text.is_empty() { ansi::prompt_hint() } else { text };

        binding.transport.send(Frame::Output(text));
        binding.replay_pending = false;
        true
    }

    /// Record shell output and forward it to the bound transport.
    ///
    /// A transport that cannot take the chunk is released; the output stays
    /// in the replay buffer.
    pub fn record_output(&self, bytes: &[u8]) {
        let mut state = self.state();
        state.last_activity = Instant::now();
        state.buffer.append(bytes);
        let text = state.decoder.decode(bytes);
        if text.is_empty() {
            return;
        }
        let delivered = match state.binding.as_ref().filter(|b| !b.replay_pending) {
            Some(binding) => binding.transport.send(Frame::Output(text)),
            None => true,
        };
        if !delivered {
            if let Some(binding) = state.binding.take() {
                tracing::info!(session_id = %self.id, connection = binding.transport.id(), "transport released, output kept for replay");
            }
        }
    }

    /// Send a frame to the bound transport, if any
    pub fn notify(&self, frame: Frame) -> bool {
        self.state()
            .binding
            .as_ref()
            .map(|b| b.transport.send(frame))
            .unwrap_or(false)
    }

    pub fn notify_error(&self, message: &str) {
        self.notify(Frame::Output(ansi::error_line(message)));
    }

    /// Tell the bound transport the shell is gone and release it
    pub fn notify_exit(&self, info: &ExitInfo) {
        if let Some(binding) = self.state().binding.take() {
            binding
                .transport
                .send(Frame::Output(ansi::exit_notice(info.code, info.signal.as_deref())));
            binding.transport.send(Frame::Close);
        }
    }

    /// Close the bound transport without a notice
    pub fn close_transport(&self) {
        if let Some(binding) = self.state().binding.take() {
            binding.transport.send(Frame::Close);
        }
    }

    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        self.pty.write(data)
    }

    pub fn run_command(&self, command: &str) -> Result<()> {
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        self.pty.write(&line)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.pty.resize(cols, rows)
    }

    pub fn info(&self) -> SessionInfo {
        let size = self.pty.size();
        let state = self.state();
        SessionInfo {
            id: self.id.clone(),
            pid: self.pty.pid(),
            working_dir: self.working_dir.display().to_string(),
            created_at: self.created_at.to_rfc3339(),
            idle_secs: state.last_activity.elapsed().as_secs(),
            attached: state.binding.is_some(),
            buffered_bytes: state.buffer.len(),
            cols: size.map(|(cols, _)| cols),
            rows: size.map(|(_, rows)| rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_128_bit_hex() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_ids_do_not_repeat() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn transports_get_distinct_ids() {
        let (a, _a_rx) = Transport::channel(4);
        let (b, _b_rx) = Transport::channel(4);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn full_queue_marks_transport_overrun() {
        let (transport, mut rx) = Transport::channel(2);
        assert!(transport.send(Frame::Output("a".into())));
        assert!(transport.send(Frame::Output("b".into())));
        assert!(!transport.is_overrun());

        assert!(!transport.send(Frame::Output("c".into())));
        assert!(transport.is_overrun());

        // Draining does not undo the overrun
        assert_eq!(rx.try_recv().ok(), Some(Frame::Output("a".into())));
        assert!(transport.is_overrun());
    }

    #[test]
    fn closed_receiver_is_not_an_overrun() {
        let (transport, rx) = Transport::channel(2);
        drop(rx);
        assert!(!transport.send(Frame::Close));
        assert!(!transport.is_overrun());
    }
}
