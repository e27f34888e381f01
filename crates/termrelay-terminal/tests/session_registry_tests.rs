#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use termrelay_terminal::{
    default_env, spawn_reaper, Frame, SessionPolicy, SessionRegistry, ShellSpec, TerminalError, Transport,
};

const WAIT: Duration = Duration::from_secs(10);

fn shell_in(dir: &TempDir) -> ShellSpec {
    ShellSpec {
        program: "/bin/sh".to_string(),
        working_dir: dir.path().to_path_buf(),
        env: default_env(),
    }
}

fn fast_policy() -> SessionPolicy {
    SessionPolicy {
        session_timeout: Duration::from_millis(150),
        reap_interval: Duration::from_millis(50),
        kill_grace: Duration::from_millis(200),
        ..SessionPolicy::default()
    }
}

fn create_registry(dir: &TempDir, policy: SessionPolicy) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(shell_in(dir), policy))
}

fn transport() -> (Transport, mpsc::Receiver<Frame>) {
    Transport::channel(1024)
}

/// Collect output frames until `needle` shows up
async fn output_until(rx: &mut mpsc::Receiver<Frame>, needle: &str) -> String {
    let mut seen = String::new();
    let found = tokio::time::timeout(WAIT, async {
        while let Some(frame) = rx.recv().await {
            if let Frame::Output(text) = frame {
                seen.push_str(&text);
                if seen.contains(needle) {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "never saw {needle:?} in output: {seen:?}");
    seen
}

async fn wait_until_empty(registry: &SessionRegistry) {
    let emptied = tokio::time::timeout(WAIT, async {
        while !registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(emptied.is_ok(), "registry still holds sessions");
}

#[tokio::test]
async fn test_create_registers_session_with_banner() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());

    let session = registry.create(80, 24).await.unwrap();

    assert_eq!(registry.len().await, 1);
    assert!(session.is_alive());
    assert!(session.pid().is_some());
    assert!(session.buffered_len() > 0, "banner should be buffered");
    assert!(registry.lookup(session.id().as_str()).await.is_some());

    registry.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_registers_nothing() {
    let dir = TempDir::new().unwrap();
    let mut shell = shell_in(&dir);
    shell.program = "/definitely/not/a/shell".to_string();
    let registry = Arc::new(SessionRegistry::new(shell, SessionPolicy::default()));

    let result = registry.create(80, 24).await;
    assert!(matches!(result, Err(TerminalError::Spawn { .. })), "got {result:?}");
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_missing_working_dir_registers_nothing() {
    let dir = TempDir::new().unwrap();
    let mut shell = shell_in(&dir);
    shell.working_dir = dir.path().join("gone");
    let registry = Arc::new(SessionRegistry::new(shell, SessionPolicy::default()));

    let result = registry.create(80, 24).await;
    assert!(matches!(result, Err(TerminalError::InvalidWorkingDir(_))), "got {result:?}");
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_command_output_reaches_bound_transport() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();
    let (transport, mut rx) = transport();
    let connection = transport.id();

    session.attach(transport, true);
    assert!(session.replay(connection));
    session.run_command("echo $((40 + 2))").unwrap();

    output_until(&mut rx, "42").await;
    registry.shutdown().await;
}

#[tokio::test]
async fn test_rebind_reuses_the_same_process() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();
    let pid = session.pid();

    let (first, _first_rx) = transport();
    let restored = registry.rebind(session.id().as_str(), first).await.unwrap();
    let (second, _second_rx) = transport();
    let restored_again = registry.rebind(session.id().as_str(), second).await.unwrap();

    assert!(Arc::ptr_eq(&restored, &session));
    assert!(Arc::ptr_eq(&restored_again, &session));
    assert_eq!(restored_again.pid(), pid);
    assert_eq!(registry.len().await, 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_rebind_unknown_id_is_not_found() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let (transport, _rx) = transport();

    assert!(registry.rebind("00000000000000000000000000000000", transport).await.is_none());
}

#[tokio::test]
async fn test_rebind_supersedes_previous_transport() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();

    let (first, mut first_rx) = transport();
    session.attach(first, false);
    let (second, _second_rx) = transport();
    let second_id = second.id();
    registry.rebind(session.id().as_str(), second).await.unwrap();

    let mut closed = false;
    while let Ok(frame) = first_rx.try_recv() {
        closed |= frame == Frame::Close;
    }
    assert!(closed, "old transport should be asked to close");
    assert_eq!(session.bound_connection(), Some(second_id));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_detached_session_keeps_running_and_replays() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();

    let (first, mut first_rx) = transport();
    let first_id = first.id();
    session.attach(first, false);
    session.run_command("echo before-$((1 + 1))").unwrap();
    output_until(&mut first_rx, "before-2").await;

    assert!(session.detach(first_id));
    assert!(!session.is_attached());
    session.run_command("echo while-detached-$((3 + 4))").unwrap();

    // Output keeps accumulating with nobody attached
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(session.is_alive());

    let (second, mut second_rx) = transport();
    let second_id = second.id();
    let restored = registry.rebind(session.id().as_str(), second).await.unwrap();
    assert!(restored.replay(second_id));

    let replay = output_until(&mut second_rx, "while-detached-7").await;
    assert!(replay.contains("before-2"));

    restored.run_command("echo after-$((5 + 5))").unwrap();
    output_until(&mut second_rx, "after-10").await;

    registry.shutdown().await;
}

#[tokio::test]
async fn test_detach_ignores_stale_connection() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();

    let (first, _first_rx) = transport();
    let first_id = first.id();
    session.attach(first, false);
    let (second, _second_rx) = transport();
    session.attach(second, false);

    assert!(!session.detach(first_id));
    assert!(session.is_attached());

    registry.shutdown().await;
}

#[tokio::test]
async fn test_replay_buffer_stays_bounded() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();
    let (transport, mut rx) = transport();
    session.attach(transport, false);

    session
        .run_command("i=0; while [ $i -lt 400 ]; do echo line-$i-padding-padding; i=$((i+1)); done; echo done-$((6 * 7))")
        .unwrap();
    output_until(&mut rx, "done-42").await;

    assert!(session.buffered_len() <= 5000);
    assert_eq!(session.buffered_len(), 5000);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_resize_changes_pty_size() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();

    assert_eq!(session.pty().size(), Some((80, 24)));
    session.resize(132, 50).unwrap();
    assert_eq!(session.pty().size(), Some((132, 50)));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_shell_exit_evicts_and_closes_transport() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();
    let (bound, mut rx) = transport();
    session.attach(bound, false);

    session.run_command("exit 3").unwrap();
    output_until(&mut rx, "exited with code 3").await;

    let closed = tokio::time::timeout(WAIT, async {
        while let Some(frame) = rx.recv().await {
            if frame == Frame::Close {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(closed);

    wait_until_empty(&registry).await;
    let (again, _again_rx) = transport();
    assert!(registry.rebind(session.id().as_str(), again).await.is_none());

    // Faults on a dead shell degrade to errors, never panics
    assert!(matches!(session.write_input(b"ls\n"), Err(TerminalError::Exited)));
    assert!(session.resize(100, 40).is_ok());
    session.pty().kill();
}

#[tokio::test]
async fn test_sweep_evicts_idle_session_and_kills_it() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, fast_policy());
    let session = registry.create(80, 24).await.unwrap();

    // A legitimately busy but silent shell is still reaped once idle: the
    // timeout only sees message and output activity.
    session.run_command("sleep 30").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let reaped = registry.sweep().await;
    assert_eq!(reaped, vec![session.id().clone()]);
    assert!(registry.is_empty().await);

    let exited = tokio::time::timeout(WAIT, session.pty().wait()).await;
    assert!(matches!(exited, Ok(Some(_))), "shell still running after reap");
}

#[tokio::test]
async fn test_activity_keeps_session_off_the_sweep() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, fast_policy());
    let session = registry.create(80, 24).await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        session.touch();
        assert!(registry.sweep().await.is_empty());
    }
    assert_eq!(registry.len().await, 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_reaper_task_evicts_and_stops_on_cancel() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, fast_policy());
    let shutdown = CancellationToken::new();
    let reaper = spawn_reaper(Arc::clone(&registry), shutdown.clone());

    let session = registry.create(80, 24).await.unwrap();
    wait_until_empty(&registry).await;
    assert!(tokio::time::timeout(WAIT, session.pty().wait()).await.is_ok());

    shutdown.cancel();
    assert!(tokio::time::timeout(WAIT, reaper).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_terminates_every_shell() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, fast_policy());
    let first = registry.create(80, 24).await.unwrap();
    let second = registry.create(100, 30).await.unwrap();
    let (transport, mut rx) = transport();
    first.attach(transport, false);

    let drained = registry.shutdown().await;

    assert_eq!(drained, 2);
    assert!(registry.is_empty().await);
    assert!(!first.is_alive());
    assert!(!second.is_alive());

    let mut closed = false;
    while let Ok(frame) = rx.try_recv() {
        closed |= frame == Frame::Close;
    }
    assert!(closed);
}

#[tokio::test]
async fn test_shell_killed_by_signal_names_the_signal() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();
    let (bound, mut rx) = transport();
    session.attach(bound, false);

    session.run_command("kill -9 $$").unwrap();
    output_until(&mut rx, "[Process terminated by signal:").await;

    let info = tokio::time::timeout(WAIT, session.pty().wait()).await.unwrap().unwrap();
    assert!(info.signal.is_some());
    wait_until_empty(&registry).await;
}

#[tokio::test]
async fn test_create_after_shutdown_is_rejected() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, fast_policy());
    assert_eq!(registry.shutdown().await, 0);
    assert!(registry.is_closed());

    let result = registry.create(80, 24).await;
    assert!(matches!(result, Err(TerminalError::ShuttingDown)), "got {result:?}");
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_spawns_racing_shutdown_leave_no_live_shells() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, fast_policy());

    let spawns: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.create(80, 24).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(2)).await;
    registry.shutdown().await;

    for spawn in spawns {
        match spawn.await.unwrap() {
            Ok(session) => {
                let exited = tokio::time::timeout(WAIT, session.pty().wait()).await;
                assert!(matches!(exited, Ok(Some(_))), "shell {:?} outlived shutdown", session.pid());
            }
            Err(e) => assert!(matches!(e, TerminalError::ShuttingDown), "got {e:?}"),
        }
    }
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_stalled_transport_is_released_and_output_kept() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(80, 24).await.unwrap();

    // Nobody reads this queue
    let (stalled, _stalled_rx) = Transport::channel(2);
    let watcher = stalled.clone();
    session.attach(stalled, false);

    session
        .run_command("i=0; while [ $i -lt 2000 ]; do echo flood-$i; i=$((i+1)); done; echo flood-done-$((8 * 8))")
        .unwrap();

    let released = tokio::time::timeout(WAIT, watcher.overrun()).await;
    assert!(released.is_ok(), "transport never marked overrun");
    assert!(!session.is_attached());
    assert!(session.is_alive());

    // The shell kept running and its output kept accumulating
    let (fresh, mut fresh_rx) = transport();
    let fresh_id = fresh.id();
    let restored = registry.rebind(session.id().as_str(), fresh).await.unwrap();
    assert!(restored.replay(fresh_id));
    output_until(&mut fresh_rx, "flood-done-64").await;

    registry.shutdown().await;
}

#[tokio::test]
async fn test_listing_reports_buffer_and_binding() {
    let dir = TempDir::new().unwrap();
    let registry = create_registry(&dir, SessionPolicy::default());
    let session = registry.create(100, 30).await.unwrap();
    let (bound, _rx) = transport();
    session.attach(bound, false);

    let listing = registry.list().await;
    assert_eq!(listing.len(), 1);
    let info = &listing[0];
    assert_eq!(&info.id, session.id());
    assert!(info.attached);
    assert_eq!(info.buffered_bytes, session.buffered_len());
    assert_eq!((info.cols, info.rows), (Some(100), Some(30)));
    assert_eq!(info.working_dir, dir.path().display().to_string());

    registry.shutdown().await;
}
