//! Per-connection protocol handling.
//!
//! A connection moves through three phases:
//!
//! 1. awaiting handshake: only a `{"type":"session"}` message is acted on,
//!    everything else is dropped since there is no shell to route it to;
//! 2. bound: control messages drive the PTY, anything else is keystrokes;
//! 3. closed: the session is detached but keeps running (persistent mode) or
//!    is evicted (ephemeral mode).

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use termrelay_terminal::{Frame, TerminalSession, Transport};
use termrelay_types::{ansi, classify, Inbound, ServerMessage, DEFAULT_COLS, DEFAULT_ROWS, FRAME_QUEUE_CAPACITY};

use crate::web::routes::AppState;

/// How long a closing connection waits for its last frames to flush
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

struct Handshake {
    session_id: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
}

/// Handle one WebSocket connection from accept to close
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, mut stream) = socket.split();
    let (transport, rx) = Transport::channel(FRAME_QUEUE_CAPACITY);
    let connection = transport.id();
    let mut writer = tokio::spawn(write_frames(sink, rx));

    tracing::debug!(connection, "connection accepted, awaiting handshake");

    let handshake = tokio::select! {
        handshake = await_handshake(&mut stream, connection) => handshake,
        _ = state.shutdown.cancelled() => None,
    };

    // A spawn still in flight when shutdown starts is abandoned; the registry
    // kills whatever finishes spawning after that.
    let session = match handshake {
        Some(handshake) => tokio::select! {
            session = bind_session(&state, handshake, &transport) => session,
            _ = state.shutdown.cancelled() => None,
        },
        None => None,
    };

    let mut writer_done = false;
    if let Some(session) = &session {
        loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(message)) => {
                            if !route_message(session, message) {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::debug!(connection, error = %e, "websocket read failed");
                            break;
                        }
                        None => break,
                    }
                }
                _ = state.shutdown.cancelled() => break,
                _ = transport.overrun() => break,
                _ = &mut writer => {
                    // Server-side close: shell exited or another connection took over
                    writer_done = true;
                    break;
                }
            }
        }

        // An overrun transport was already released by the session
        let superseded = session.bound_connection().is_some_and(|bound| bound != connection);
        session.detach(connection);
        if superseded {
            tracing::debug!(session_id = %session.id(), connection, "superseded transport closed");
        } else if state.persistent {
            tracing::info!(session_id = %session.id(), connection, "transport closed, session kept alive");
        } else {
            state.registry.evict(session.id().as_str()).await;
        }
    }

    transport.send(Frame::Close);
    drop(transport);
    if !writer_done && tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::debug!(connection, "connection closed");
}

/// Forward queued frames to the socket until a close is requested
async fn write_frames(mut sink: SplitSink<WebSocket, WsMessage>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            Frame::Message(message) => WsMessage::Text(message.to_json()),
            Frame::Output(text) => WsMessage::Text(text),
            Frame::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Wait for the handshake, ignoring anything else
async fn await_handshake(stream: &mut SplitStream<WebSocket>, connection: u64) -> Option<Handshake> {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(connection, error = %e, "websocket read failed before handshake");
                return None;
            }
        };
        let Some(payload) = payload(&message) else {
            if matches!(message, WsMessage::Close(_)) {
                return None;
            }
            continue;
        };

        match classify(payload) {
            Inbound::Handshake {
                session_id,
                cols,
                rows,
            } => {
                return Some(Handshake {
                    session_id,
                    cols,
                    rows,
                })
            }
            _ => tracing::debug!(connection, "ignoring message received before handshake"),
        }
    }
    None
}

/// Attach the transport to an existing session or a fresh one
async fn bind_session(state: &AppState, handshake: Handshake, transport: &Transport) -> Option<Arc<TerminalSession>> {
    let connection = transport.id();

    let restored = match handshake.session_id.as_deref() {
        Some(id) if state.persistent => state.registry.rebind(id, transport.clone()).await,
        _ => None,
    };

    let session = match restored {
        Some(session) => {
            transport.send(Frame::Message(ServerMessage::SessionRestored {
                session_id: session.id().to_string(),
            }));
            if let (Some(cols), Some(rows)) = (handshake.cols, handshake.rows) {
                if let Err(e) = session.resize(cols, rows) {
                    tracing::debug!(session_id = %session.id(), error = %e, "resize on restore ignored");
                }
            }

            // Give the client renderer a moment before the replay
            let delay = state.registry.policy().replay_delay;
            let replay_session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                replay_session.replay(connection);
            });
            session
        }
        None => {
            if let Some(id) = &handshake.session_id {
                tracing::debug!(requested = %id, connection, "unknown or expired session id, starting fresh");
            }
            let cols = handshake.cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS);
            let rows = handshake.rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS);

            match state.registry.create(cols, rows).await {
                Ok(session) => {
                    session.attach(transport.clone(), true);
                    transport.send(Frame::Message(ServerMessage::SessionCreated {
                        session_id: session.id().to_string(),
                    }));
                    session.replay(connection);
                    session
                }
                Err(e) => {
                    tracing::error!(connection, error = %e, "failed to start shell");
                    transport.send(Frame::Output(ansi::error_line(&format!("failed to start shell: {e}"))));
                    return None;
                }
            }
        }
    };

    // The shell may have died before the binding took effect
    if let Some(info) = session.pty().exit_info() {
        session.notify_exit(&info);
    }
    Some(session)
}

/// Route one message on a bound connection. Returns `false` on close.
fn route_message(session: &TerminalSession, message: WsMessage) -> bool {
    if matches!(message, WsMessage::Close(_)) {
        return false;
    }
    session.touch();

    let Some(payload) = payload(&message) else {
        // Ping/pong: activity only
        return true;
    };

    let result = match classify(payload) {
        Inbound::Resize { cols, rows } => session.resize(cols, rows),
        Inbound::Command(command) => session.run_command(&command),
        // Not a bound-state control message: it is terminal input like any other
        Inbound::Handshake { .. } => session.write_input(payload),
        Inbound::Raw(bytes) => session.write_input(&bytes),
    };
    if let Err(e) = result {
        tracing::debug!(session_id = %session.id(), error = %e, "input dropped");
    }
    true
}

fn payload(message: &WsMessage) -> Option<&[u8]> {
    match message {
        WsMessage::Text(text) => Some(text.as_bytes()),
        WsMessage::Binary(bytes) => Some(bytes),
        _ => None,
    }
}
