//! Process supervisor - owns the companion process lifecycle.
//!
//! Flow:
//! 1. Spawn the companion with runtime args + positional bridge args
//! 2. Capture stdin as a framed writer, hand stdout and the child to a monitor
//! 3. On cancel: SIGTERM, stop the monitor, optionally spawn a fresh process
//!
//! Every spawn bumps the generation so run-state can tell processes apart.

use std::process::Stdio;
use std::sync::Arc;

use futures::SinkExt;
use tokio::process::{ChildStdin, Command};
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::{FrameCodec, FrameError};
use crate::bridge::protocol::DispatchRequest;
use crate::config::CompanionConfig;
use crate::monitor::{MonitorHandle, spawn_monitor};
use crate::state::RunState;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn companion {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid module search path: {0}")]
    ModulePath(#[from] std::env::JoinPathsError),
    #[error("companion {0} not captured")]
    StreamNotCaptured(&'static str),
}

struct CompanionProcess {
    pid: Option<u32>,
    generation: u64,
    writer: FramedWrite<ChildStdin, FrameCodec<DispatchRequest>>,
    monitor: MonitorHandle,
}

pub struct ProcessSupervisor {
    config: Arc<CompanionConfig>,
    state: Arc<RunState>,
    generation: u64,
    process: Option<CompanionProcess>,
}

impl ProcessSupervisor {
    /// Create a supervisor and spawn its first process.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: CompanionConfig, state: Arc<RunState>) -> Result<Self, SpawnError> {
        let mut supervisor = Self {
            config: Arc::new(config),
            state,
            generation: 0,
            process: None,
        };
        supervisor.initialize()?;
        Ok(supervisor)
    }

    /// Spawn a fresh companion, replacing (and terminating) any current one.
    pub fn initialize(&mut self) -> Result<(), SpawnError> {
        if let Some(old) = self.process.take() {
            terminate(&old);
        }

        let config = &self.config;
        let inherited = std::env::var_os(&config.module_path_var);
        let module_path = config.module_search_path(inherited.as_deref())?;

        let mut command = Command::new(&config.program);
        command
            .args(config.spawn_args())
            .env(&config.module_path_var, module_path)
            .envs(config.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
            program: config.program.display().to_string(),
            source,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or(SpawnError::StreamNotCaptured("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::StreamNotCaptured("stdout"))?;

        self.generation += 1;
        let pid = child.id();
        let monitor = spawn_monitor(
            child,
            stdout,
            self.generation,
            Arc::clone(&self.state),
            config.reap_grace,
        );

        tracing::info!(
            pid = ?pid,
            generation = self.generation,
            program = %config.program.display(),
            segment = %config.segment_name,
            "Companion started"
        );

        self.process = Some(CompanionProcess {
            pid,
            generation: self.generation,
            writer: FramedWrite::new(stdin, FrameCodec::new()),
            monitor,
        });
        Ok(())
    }

    /// Terminate the current process and stop its monitor; respawn if `restart`.
    ///
    /// Signal failures are logged, never returned. Only the respawn can fail.
    pub fn cancel(&mut self, restart: bool) -> Result<(), SpawnError> {
        match self.process.take() {
            Some(process) => terminate(&process),
            None => tracing::debug!("Cancel requested with no companion running"),
        }
        if restart {
            self.initialize()?;
        }
        Ok(())
    }

    /// Restart the companion if its monitor saw it exit. Returns whether a restart happened.
    pub fn ensure_alive(&mut self) -> Result<bool, SpawnError> {
        let dead = match &self.process {
            // A finished monitor without a recorded exit has died itself.
            Some(process) => process.monitor.has_exited() || process.monitor.is_finished(),
            None => true,
        };
        if dead {
            tracing::warn!(pid = ?self.pid(), "Companion is not running, restarting");
            self.initialize()?;
        }
        Ok(dead)
    }

    /// Frame and write one dispatch, flushing stdin.
    ///
    /// Oversized payloads are rejected before any byte is written.
    pub async fn write(&mut self, request: DispatchRequest) -> Result<(), FrameError> {
        let process = self.process.as_mut().ok_or_else(|| {
            FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no companion process",
            ))
        })?;
        process.writer.send(request).await
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid)
    }

    pub fn generation(&self) -> u64 {
        self.process.as_ref().map_or(self.generation, |p| p.generation)
    }

    pub fn has_exited(&self) -> bool {
        self.process
            .as_ref()
            .is_none_or(|p| p.monitor.has_exited())
    }

    pub fn config(&self) -> &CompanionConfig {
        &self.config
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            terminate(&process);
        }
    }
}

/// Best-effort SIGTERM plus cooperative monitor stop. Dropping the process
/// afterwards closes its stdin.
fn terminate(process: &CompanionProcess) {
    if let Some(pid) = process.pid
        && !process.monitor.has_exited()
        && let Err(e) = send_terminate(pid)
    {
        tracing::warn!(pid, error = %e, "Failed to signal companion, it may already be gone");
    }
    process.monitor.stop();
    tracing::debug!(pid = ?process.pid, generation = process.generation, "Companion cancelled");
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(std::io::Error::other)?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(std::io::Error::from)
}

/// No pid-addressed signal here; the stopped monitor kills the child instead.
#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> std::io::Result<()> {
    Ok(())
}
