use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, RwLock};

use termrelay_types::{
    ansi, KILL_GRACE_MS, REAP_INTERVAL_SECS, REPLAY_BUFFER_BYTES, REPLAY_DELAY_MS, SESSION_TIMEOUT_SECS,
};

use super::error::{Result, TerminalError};
use super::pty_handler::{PtyEvent, PtyHandler, ShellSpec};
use super::session::{SessionId, SessionInfo, TerminalSession, Transport};

/// Lifecycle policy applied to every session in a registry
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Sessions idle longer than this are evicted by the reaper
    pub session_timeout: Duration,
    pub reap_interval: Duration,
    /// Replay buffer cap, in bytes
    pub replay_bytes: usize,
    pub replay_delay: Duration,
    /// Time between hang-up and forced kill
    pub kill_grace: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(SESSION_TIMEOUT_SECS),
            reap_interval: Duration::from_secs(REAP_INTERVAL_SECS),
            replay_bytes: REPLAY_BUFFER_BYTES,
            replay_delay: Duration::from_millis(REPLAY_DELAY_MS),
            kill_grace: Duration::from_millis(KILL_GRACE_MS),
        }
    }
}

/// Sole authority on which sessions are alive.
///
/// Handed to connection handlers and the reaper by `Arc`; several
/// independent registries can coexist in one process.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<TerminalSession>>>,
    /// Set under the write lock by `shutdown`; `create` checks it under the
    /// same lock before inserting.
    closed: AtomicBool,
    shell: ShellSpec,
    policy: SessionPolicy,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("shell", &self.shell)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(shell: ShellSpec, policy: SessionPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shell,
            policy,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Spawn a shell and register a new session around it.
    ///
    /// The session banner is the first thing in the replay buffer. Nothing is
    /// registered if the spawn fails. Once [`shutdown`](Self::shutdown) has
    /// started, a shell that finishes spawning is killed and
    /// [`TerminalError::ShuttingDown`] is returned.
    pub async fn create(self: &Arc<Self>, cols: u16, rows: u16) -> Result<Arc<TerminalSession>> {
        if self.is_closed() {
            return Err(TerminalError::ShuttingDown);
        }

        let shell = self.shell.clone();
        let kill_grace = self.policy.kill_grace;
        let (pty, events) = tokio::task::spawn_blocking(move || PtyHandler::spawn(&shell, cols, rows, kill_grace))
            .await
            .map_err(|e| TerminalError::Spawn {
                program: self.shell.program.clone(),
                reason: e.to_string(),
            })??;

        let id = SessionId::generate();
        let session = Arc::new(TerminalSession::new(
            id.clone(),
            pty,
            self.shell.working_dir.clone(),
            self.policy.replay_bytes,
        ));
        session.record_output(
            ansi::session_banner(id.as_str(), &self.shell.working_dir.display().to_string()).as_bytes(),
        );

        {
            let mut sessions = self.sessions.write().await;
            if self.is_closed() {
                drop(sessions);
                tracing::debug!(session_id = %id, "shell spawned during shutdown, killing it");
                session.pty().kill();
                return Err(TerminalError::ShuttingDown);
            }
            sessions.insert(id.clone(), Arc::clone(&session));
        }
        tokio::spawn(pump_events(Arc::downgrade(self), Arc::clone(&session), events));

        tracing::info!(session_id = %id, pid = ?session.pid(), cols, rows, "session created");
        Ok(session)
    }

    /// Find a live session
    pub async fn lookup(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions
            .read()
            .await
            .get(id)
            .filter(|session| session.is_alive())
            .cloned()
    }

    /// Re-point an existing session at a new transport.
    ///
    /// Live output is held back until the caller replays the buffer. A
    /// session whose shell already exited counts as not found.
    pub async fn rebind(&self, id: &str, transport: Transport) -> Option<Arc<TerminalSession>> {
        let session = self.lookup(id).await?;
        session.attach(transport, true);
        tracing::info!(session_id = %session.id(), "session restored");
        Some(session)
    }

    /// Remove a session and kill its shell
    pub async fn evict(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.pty().kill();
                tracing::info!(session_id = %session.id(), "session evicted");
                true
            }
            None => false,
        }
    }

    /// Evict every session idle past the timeout
    pub async fn sweep(&self) -> Vec<SessionId> {
        let timeout = self.policy.session_timeout;
        let stale: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.idle_for() > timeout)
            .map(|session| session.id().clone())
            .collect();

        let mut reaped = Vec::with_capacity(stale.len());
        for id in stale {
            if self.evict(id.as_str()).await {
                tracing::info!(session_id = %id, timeout_secs = timeout.as_secs(), "session reaped for inactivity");
                reaped.push(id);
            }
        }
        reaped
    }

    /// Evict everything, close every transport and wait for the shells to die.
    ///
    /// Returns how many sessions were drained.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Arc<TerminalSession>> = {
            let mut sessions = self.sessions.write().await;
            self.closed.store(true, Ordering::Release);
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            session.close_transport();
        }

        let results = join_all(drained.iter().map(|session| session.pty().terminate())).await;
        for (session, exited) in drained.iter().zip(&results) {
            if !exited {
                tracing::warn!(session_id = %session.id(), pid = ?session.pid(), "shell did not exit during shutdown");
            }
        }
        tracing::info!(count = drained.len(), "all sessions drained");
        drained.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has started
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// All sessions, most recently active first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.read().await.values().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.idle_secs);
        infos
    }

    /// Drop a session whose shell exited on its own
    async fn remove_exited(&self, session: &Arc<TerminalSession>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session.id().as_str())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.id().as_str());
        }
    }
}

/// Consume one shell's events for the lifetime of its session
async fn pump_events(
    registry: Weak<SessionRegistry>,
    session: Arc<TerminalSession>,
    mut events: mpsc::Receiver<PtyEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Data(bytes) => session.record_output(&bytes),
            PtyEvent::Error(message) => {
                tracing::warn!(session_id = %session.id(), %message, "shell fault");
                session.notify_error(&message);
            }
            PtyEvent::Exit(info) => {
                tracing::info!(session_id = %session.id(), code = info.code, signal = ?info.signal, "shell exited");
                if let Some(registry) = registry.upgrade() {
                    registry.remove_exited(&session).await;
                }
                session.notify_exit(&info);
                break;
            }
        }
    }
}
