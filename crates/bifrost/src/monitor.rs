//! Output monitor - background task reading the companion's stdout.
//!
//! One monitor per companion process, for that process's whole lifetime:
//! 1. Read one line at a time (lossy UTF-8; malformed lines are never fatal)
//! 2. Completion marker → clear the run flag for this generation
//! 3. Any other line → re-emitted on the `bifrost::companion` tracing target
//! 4. Process exit (EOF or `try_wait` after each line) → clear the run flag
//!    with [`CompletionReason::ProcessExited`] and stop
//!
//! Stopping is cooperative: [`MonitorHandle::stop`] fires a cancellation token
//! that the read loop observes at its next await point. A stopped monitor reaps
//! its child, killing it if it outlives the grace period.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::OutputLine;
use crate::state::{CompletionReason, RunState};

/// Upper bound on waiting for leftover output once the process has exited.
const DRAIN_WINDOW: Duration = Duration::from_millis(100);

/// Handle held by the supervisor for one running monitor.
pub struct MonitorHandle {
    stop: CancellationToken,
    exited: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Ask the monitor to stop. Observed within one loop iteration.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether the monitor saw its process exit.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a monitor bound to `generation` that owns `child` until it exits.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_monitor(
    child: Child,
    stdout: ChildStdout,
    generation: u64,
    state: Arc<RunState>,
    reap_grace: Duration,
) -> MonitorHandle {
    let stop = CancellationToken::new();
    let exited = Arc::new(AtomicBool::new(false));

    let monitor = OutputMonitor {
        pid: child.id(),
        child,
        generation,
        state,
        stop: stop.clone(),
        exited: Arc::clone(&exited),
        reap_grace,
    };
    let task = tokio::spawn(monitor.run(BufReader::new(stdout)));

    MonitorHandle { stop, exited, task }
}

struct OutputMonitor {
    child: Child,
    pid: Option<u32>,
    generation: u64,
    state: Arc<RunState>,
    stop: CancellationToken,
    exited: Arc<AtomicBool>,
    reap_grace: Duration,
}

impl OutputMonitor {
    async fn run(mut self, mut reader: BufReader<ChildStdout>) {
        tracing::debug!(pid = ?self.pid, generation = self.generation, "Output monitor started");
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    tracing::debug!(pid = ?self.pid, "Output monitor stop requested");
                    break;
                }
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    self.on_stream_closed().await;
                    break;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    self.handle_line(&line).await;
                }
                Err(e) => {
                    tracing::error!(pid = ?self.pid, error = %e, "Companion stdout read failed");
                    self.on_stream_closed().await;
                    break;
                }
            }

            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.drain(&mut reader, &mut buf).await;
                    self.record_exit(status.code()).await;
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(pid = ?self.pid, error = %e, "Failed to poll companion status");
                }
            }
        }

        if !self.exited.load(Ordering::Acquire) {
            self.reap().await;
        }
        tracing::debug!(pid = ?self.pid, generation = self.generation, "Output monitor exiting");
    }

    async fn handle_line(&self, line: &str) {
        match OutputLine::classify(line) {
            OutputLine::Empty => {}
            OutputLine::Completion => {
                if self
                    .state
                    .finish(self.generation, CompletionReason::Signaled)
                    .await
                {
                    tracing::debug!(pid = ?self.pid, "Run completion signaled");
                } else {
                    tracing::warn!(pid = ?self.pid, "Completion signal with no active run");
                }
            }
            OutputLine::Message(msg) => {
                tracing::info!(
                    target: "bifrost::companion",
                    pid = ?self.pid,
                    msg_type = %msg.kind,
                    "{}",
                    line.trim()
                );
            }
            OutputLine::Text(text) => {
                tracing::info!(target: "bifrost::companion", pid = ?self.pid, "{}", text);
            }
        }
    }

    /// Handle lines still buffered after the process exited, so a completion
    /// marker written just before exit is not mistaken for a crash.
    async fn drain(&self, reader: &mut BufReader<ChildStdout>, buf: &mut Vec<u8>) {
        loop {
            buf.clear();
            match tokio::time::timeout(DRAIN_WINDOW, reader.read_until(b'\n', buf)).await {
                Ok(Ok(n)) if n > 0 => {
                    let line = String::from_utf8_lossy(buf);
                    self.handle_line(&line).await;
                }
                _ => break,
            }
        }
    }

    /// EOF on stdout: wait for the process itself unless asked to stop first.
    async fn on_stream_closed(&mut self) {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {}
            status = self.child.wait() => match status {
                Ok(status) => self.record_exit(status.code()).await,
                Err(e) => {
                    tracing::error!(pid = ?self.pid, error = %e, "Failed to wait for companion");
                    self.record_exit(None).await;
                }
            },
        }
    }

    async fn record_exit(&self, code: Option<i32>) {
        // Run flag first, then `exited`.
        let cleared = self
            .state
            .finish(self.generation, CompletionReason::ProcessExited { code })
            .await;
        self.exited.store(true, Ordering::Release);
        if cleared {
            tracing::warn!(pid = ?self.pid, ?code, "Companion exited during a run");
        } else {
            tracing::info!(pid = ?self.pid, ?code, "Companion exited");
        }
    }

    async fn reap(&mut self) {
        // Without a pid-based signal the supervisor relies on this kill.
        #[cfg(not(unix))]
        self.request_kill();

        match tokio::time::timeout(self.reap_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = ?self.pid, code = ?status.code(), "Companion reaped");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to reap companion");
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "Companion ignored termination, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill companion");
                }
            }
        }
        self.exited.store(true, Ordering::Release);
    }

    /// Send a kill without waiting for the process. Returns whether it was sent.
    #[cfg_attr(unix, allow(dead_code))]
    fn request_kill(&mut self) -> bool {
        match self.child.start_kill() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill companion");
                false
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> (Child, ChildStdout) {
        let mut child = Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn sh");
        let stdout = child.stdout.take().expect("stdout captured");
        (child, stdout)
    }

    async fn wait_until_cleared(state: &RunState) {
        for _ in 0..200 {
            if !state.is_running().await {
                return;
            }
            state.wait_for_change(Duration::from_millis(25)).await;
        }
        panic!("run flag was never cleared");
    }

    #[tokio::test]
    async fn completion_marker_clears_flag_and_keeps_reading() {
        let state = Arc::new(RunState::new());
        state.begin(1).await;

        let (child, stdout) = spawn_sh(
            r#"echo 'plain text'
               echo '{"type":"log","message":"hi"}'
               echo '{"type":"done"}'
               sleep 30"#,
        );
        let grace = Duration::from_millis(200);
        let handle = spawn_monitor(child, stdout, 1, Arc::clone(&state), grace);

        wait_until_cleared(&state).await;
        assert_eq!(
            state.snapshot().await.completion,
            Some(CompletionReason::Signaled)
        );
        assert!(!handle.has_exited());
        assert!(!handle.is_finished());

        handle.stop();
    }

    #[tokio::test]
    async fn process_exit_clears_flag_with_exit_code() {
        let state = Arc::new(RunState::new());
        state.begin(4).await;

        let (child, stdout) = spawn_sh("echo 'about to fail'; exit 3");
        let grace = Duration::from_millis(200);
        let handle = spawn_monitor(child, stdout, 4, Arc::clone(&state), grace);

        wait_until_cleared(&state).await;
        assert_eq!(
            state.snapshot().await.completion,
            Some(CompletionReason::ProcessExited { code: Some(3) })
        );
        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.has_exited());
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn stale_monitor_cannot_clear_newer_run() {
        let state = Arc::new(RunState::new());
        state.begin(2).await;

        let (child, stdout) = spawn_sh(r#"echo '{"type":"done"}'; exit 0"#);
        let grace = Duration::from_millis(200);
        let handle = spawn_monitor(child, stdout, 1, Arc::clone(&state), grace);

        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.is_finished());
        assert!(state.is_running().await);
    }

    #[tokio::test]
    async fn kill_request_reports_failure_once_reaped() {
        let (child, _stdout) = spawn_sh("sleep 30");
        let mut monitor = OutputMonitor {
            pid: child.id(),
            child,
            generation: 1,
            state: Arc::new(RunState::new()),
            stop: CancellationToken::new(),
            exited: Arc::new(AtomicBool::new(false)),
            reap_grace: Duration::from_millis(100),
        };

        assert!(monitor.request_kill());
        monitor.child.wait().await.unwrap();
        assert!(!monitor.request_kill());
    }

    #[tokio::test]
    async fn stop_reaps_long_running_child() {
        let state = Arc::new(RunState::new());
        let (child, stdout) = spawn_sh("sleep 30");
        let grace = Duration::from_millis(100);
        let handle = spawn_monitor(child, stdout, 1, Arc::clone(&state), grace);

        handle.stop();
        for _ in 0..200 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.is_finished());
        assert!(handle.has_exited());
    }
}
