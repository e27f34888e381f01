use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};

use super::error::{Result, TerminalError};

/// How long the exit watcher waits for the reader to drain after the child exits
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Output chunks queued between the reader thread and the session. A full
/// queue stalls the reader, which in turn stalls the shell.
const EVENT_QUEUE_CHUNKS: usize = 64;

/// Input writes queued for a shell that is not reading its terminal
const INPUT_QUEUE_WRITES: usize = 1024;

/// Variables injected into every shell on top of the inherited environment
pub fn default_env() -> Vec<(String, String)> {
    vec![
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
    ]
}

/// What every session launches
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub program: String,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl Default for ShellSpec {
    fn default() -> Self {
        Self {
            program: "/bin/bash".to_string(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            env: default_env(),
        }
    }
}

/// Exit status of a shell process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: u32,
    /// Signal description when the process was killed by a signal
    pub signal: Option<String>,
}

impl ExitInfo {
    fn from_status(status: &portable_pty::ExitStatus) -> Self {
        // portable-pty only exposes the signal through its Display impl
        let signal = status
            .to_string()
            .strip_prefix("Terminated by ")
            .map(str::to_string);
        Self {
            code: status.exit_code(),
            signal,
        }
    }
}

/// Lifecycle and output events published by a [`PtyHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of shell output, in emission order
    Data(Vec<u8>),
    /// Runtime fault; does not end the process by itself
    Error(String),
    /// Sent exactly once, after the last `Data`
    Exit(ExitInfo),
}

/// Owns one shell process and its pseudo-terminal.
///
/// Output and lifecycle events flow out through the bounded receiver returned
/// by [`PtyHandler::spawn`]. Input goes through a dedicated writer thread so
/// callers never block on the PTY.
pub struct PtyHandler {
    master: Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    killer: Arc<Mutex<Box<dyn ChildKiller + Send + Sync>>>,
    pid: Option<u32>,
    exited: watch::Receiver<Option<ExitInfo>>,
    kill_requested: AtomicBool,
    kill_grace: Duration,
}

impl std::fmt::Debug for PtyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandler")
            .field("pid", &self.pid)
            .field("exited", &*self.exited.borrow())
            .finish_non_exhaustive()
    }
}

impl PtyHandler {
    /// Spawn `shell` inside a new PTY of the given size
    pub fn spawn(
        shell: &ShellSpec,
        cols: u16,
        rows: u16,
        kill_grace: Duration,
    ) -> Result<(Self, mpsc::Receiver<PtyEvent>)> {
        if cols == 0 || rows == 0 {
            return Err(TerminalError::InvalidGeometry { cols, rows });
        }
        if !shell.working_dir.is_dir() {
            return Err(TerminalError::InvalidWorkingDir(shell.working_dir.clone()));
        }

        let pty_system = native_pty_system();
        let pty_pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Pty(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&shell.program);
        cmd.cwd(&shell.working_dir);
        for (key, value) in &shell.env {
            cmd.env(key, value);
        }

        let mut child = pty_pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::Spawn {
                program: shell.program.clone(),
                reason: e.to_string(),
            })?;
        // Our copy of the slave must go, otherwise the reader never sees EOF.
        drop(pty_pair.slave);

        let master = pty_pair.master;
        let pid = child.process_id();
        let killer = Arc::new(Mutex::new(child.clone_killer()));
        let reader = master
            .try_clone_reader()
            .map_err(|e| TerminalError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let writer = master
            .take_writer()
            .map_err(|e| TerminalError::Pty(format!("failed to take PTY writer: {e}")))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CHUNKS);
        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_WRITES);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (drained_tx, drained_rx) = std_mpsc::channel::<()>();

        // Reader: PTY output -> Data events. Dropping `drained_tx` tells the
        // exit watcher that no more data will follow.
        let reader_events = events_tx.clone();
        thread::spawn(move || {
            let mut reader = reader;
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if reader_events.blocking_send(PtyEvent::Data(buffer[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a hung-up slave
                        if !is_hangup(&e) {
                            let _ = reader_events.blocking_send(PtyEvent::Error(format!("read failed: {e}")));
                        }
                        break;
                    }
                }
            }
            drop(drained_tx);
        });

        // Writer: input channel -> PTY
        let writer_events = events_tx.clone();
        thread::spawn(move || {
            let mut writer = writer;
            let mut input_rx = input_rx;
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    let _ = writer_events.blocking_send(PtyEvent::Error(format!("write failed: {e}")));
                    break;
                }
            }
        });

        // Exit watcher: reaps the child, then publishes Exit after the reader drained
        thread::spawn(move || {
            let info = match child.wait() {
                Ok(status) => ExitInfo::from_status(&status),
                Err(e) => {
                    let _ = events_tx.blocking_send(PtyEvent::Error(format!("wait failed: {e}")));
                    ExitInfo { code: 1, signal: None }
                }
            };
            let _ = drained_rx.recv_timeout(READER_DRAIN_TIMEOUT);
            let _ = exit_tx.send(Some(info.clone()));
            let _ = events_tx.blocking_send(PtyEvent::Exit(info));
        });

        Ok((
            Self {
                master: Mutex::new(master),
                input_tx,
                killer,
                pid,
                exited: exit_rx,
                kill_requested: AtomicBool::new(false),
                kill_grace,
            },
            events_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exited.borrow().clone()
    }

    /// Queue raw bytes for the shell's input. Fails instead of blocking when
    /// the shell has stopped reading.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.has_exited() {
            return Err(TerminalError::Exited);
        }
        self.input_tx.try_send(data.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TerminalError::InputBacklog,
            mpsc::error::TrySendError::Closed(_) => TerminalError::Exited,
        })
    }

    /// Resize the PTY. A no-op once the process has exited.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(TerminalError::InvalidGeometry { cols, rows });
        }
        if self.has_exited() {
            return Ok(());
        }
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Pty(format!("failed to resize PTY: {e}")))
    }

    /// Current PTY size as `(cols, rows)`
    pub fn size(&self) -> Option<(u16, u16)> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_size()
            .ok()
            .map(|size| (size.cols, size.rows))
    }

    /// Request termination without waiting for it.
    ///
    /// Sends SIGHUP to the shell's process group, then SIGKILL if the process
    /// is still alive after the grace window. The timer is dropped as soon as
    /// the exit is observed. Repeated calls are no-ops.
    pub fn kill(&self) {
        if self.has_exited() || self.kill_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(pid = ?self.pid, "sending hang-up to shell");
        signal_group(self.pid, HANGUP);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mut exited = self.exited.clone();
                let pid = self.pid;
                let killer = Arc::clone(&self.killer);
                let grace = self.kill_grace;
                handle.spawn(async move {
                    let exited_in_time = tokio::time::timeout(grace, exited.wait_for(Option::is_some))
                        .await
                        .is_ok();
                    if !exited_in_time {
                        tracing::warn!(?pid, "shell ignored hang-up, forcing kill");
                        force_kill(pid, &killer);
                    }
                });
            }
            Err(_) => force_kill(self.pid, &self.killer),
        }
    }

    /// Kill and wait until the process is gone.
    ///
    /// Bounded: returns `false` if the exit was not observed in time.
    pub async fn terminate(&self) -> bool {
        self.kill();
        let mut exited = self.exited.clone();
        let bound = self.kill_grace + Duration::from_secs(2);
        let exited_in_time = tokio::time::timeout(bound, exited.wait_for(Option::is_some))
            .await
            .is_ok();
        exited_in_time
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&self) -> Option<ExitInfo> {
        let mut exited = self.exited.clone();
        let info = exited.wait_for(Option::is_some).await.ok().and_then(|info| info.clone());
        info
    }
}

impl Drop for PtyHandler {
    fn drop(&mut self) {
        if !self.has_exited() {
            force_kill(self.pid, &self.killer);
        }
    }
}

#[cfg(unix)]
const HANGUP: i32 = libc::SIGHUP;
#[cfg(unix)]
const KILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const HANGUP: i32 = 1;
#[cfg(not(unix))]
const KILL: i32 = 9;

#[cfg(unix)]
fn is_hangup(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(unix))]
fn is_hangup(_e: &std::io::Error) -> bool {
    false
}

/// Signal the process group led by `pid`, falling back to the process itself
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: i32) -> bool {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()).filter(|p| *p > 0) else {
        return false;
    };
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: i32) -> bool {
    false
}

fn force_kill(pid: Option<u32>, killer: &Mutex<Box<dyn ChildKiller + Send + Sync>>) {
    if signal_group(pid, KILL) {
        return;
    }
    let _ = killer.lock().unwrap_or_else(PoisonError::into_inner).kill();
}
