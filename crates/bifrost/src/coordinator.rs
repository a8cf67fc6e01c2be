//! Run coordinator - the host-facing bridge.
//!
//! One run at a time (`&mut self`):
//! 1. Push variables through the [`VariableSync`]
//! 2. Mark the run active for the current process generation and dispatch
//! 3. Poll the run flag until it clears, the timeout passes, or the caller
//!    cancels its token
//! 4. Pull variables back and merge them into the caller's set
//!
//! Timeouts and interrupts cancel the companion and start a fresh one, so the
//! next run never waits behind a stuck script. The same happens when a run's
//! future is dropped mid-flight: the next run finds the flag still set and
//! restarts the companion before pushing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::FrameError;
use crate::bridge::protocol::DispatchRequest;
use crate::config::{BridgeConfig, CompanionConfig};
use crate::state::{CompletionReason, RunState};
use crate::supervisor::{ProcessSupervisor, SpawnError};
use crate::sync::{
    EncodedVariable, SerializerRegistry, SyncError, TypeTag, Variable, VariableSet, VariableSync,
};

/// How a run ended, when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { completion: CompletionReason },
    TimedOut { elapsed: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub elapsed: Duration,
    /// Companion process that executed the script.
    pub pid: Option<u32>,
    pub generation: u64,
}

impl RunReport {
    pub fn completion(&self) -> Option<CompletionReason> {
        match self.outcome {
            RunOutcome::Completed { completion } => Some(completion),
            RunOutcome::TimedOut { .. } => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.outcome, RunOutcome::TimedOut { .. })
    }

    /// Completed with the companion's own completion marker.
    pub fn is_clean(&self) -> bool {
        self.completion().is_some_and(|c| c.is_trustworthy())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("companion could not be started: {0}")]
    Spawn(#[from] SpawnError),

    #[error("variable sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("script payload of {len} bytes is too large to frame")]
    OversizedMessage { len: u64 },

    #[error("failed to write script to companion: {0}")]
    WriteFailure(#[source] std::io::Error),

    /// Nothing reached the companion, so it is not restarted.
    #[error("failed to encode script: {0}")]
    Encode(#[source] FrameError),

    #[error("run interrupted after {elapsed:?}")]
    Interrupted { elapsed: Duration },

    #[error("failed to read script {path}: {source}")]
    ReadScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

enum WaitResult {
    Finished(CompletionReason),
    TimedOut(Duration),
    Interrupted(Duration),
}

pub struct Bridge {
    supervisor: ProcessSupervisor,
    state: Arc<RunState>,
    sync: Arc<dyn VariableSync>,
    registry: SerializerRegistry,
    config: BridgeConfig,
}

impl Bridge {
    /// Spawn the companion and return a bridge ready for runs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        companion: CompanionConfig,
        sync: Arc<dyn VariableSync>,
    ) -> Result<Self, SpawnError> {
        let state = Arc::new(RunState::new());
        let supervisor = ProcessSupervisor::start(companion, Arc::clone(&state))?;
        Ok(Self {
            supervisor,
            state,
            sync,
            registry: SerializerRegistry::new(),
            config: BridgeConfig::default(),
        })
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register_serializer<F>(&mut self, tag: TypeTag, f: F)
    where
        F: Fn(&Variable) -> Result<EncodedVariable, String> + Send + Sync + 'static,
    {
        self.registry.register_serializer(tag, f);
    }

    pub fn register_deserializer<F>(&mut self, tag: TypeTag, f: F)
    where
        F: Fn(EncodedVariable) -> Result<Variable, String> + Send + Sync + 'static,
    {
        self.registry.register_deserializer(tag, f);
    }

    /// Run with the configured default timeout and no interruption.
    pub async fn run(
        &mut self,
        script: &str,
        variables: &mut VariableSet,
    ) -> Result<RunReport, RunError> {
        let timeout = self.config.default_timeout;
        self.run_until(script, variables, timeout, &CancellationToken::new())
            .await
    }

    /// Run `script`, exchanging `variables` with the companion.
    ///
    /// Variables the companion returns are merged into `variables`, also after
    /// a timeout. An interrupt skips the pull and returns
    /// [`RunError::Interrupted`]; the companion is restarted either way.
    pub async fn run_until(
        &mut self,
        script: &str,
        variables: &mut VariableSet,
        timeout: Option<Duration>,
        interrupt: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        if self.state.is_running().await {
            // A previous run's future was dropped before it finished.
            tracing::warn!(
                pid = ?self.supervisor.pid(),
                "Previous run was abandoned, restarting companion"
            );
            let restarted = self.supervisor.cancel(true);
            self.state.abort().await;
            restarted?;
        } else if self.supervisor.ensure_alive()? {
            self.state.abort().await;
        }

        let warn = self.config.warn_on_sync_failure;
        self.sync.push(variables, &self.registry, warn).await?;

        let generation = self.supervisor.generation();
        let pid = self.supervisor.pid();
        self.state.begin(generation).await;
        let started = Instant::now();
        tracing::debug!(
            ?pid,
            generation,
            script_bytes = script.len(),
            ?timeout,
            "Dispatching script"
        );

        // A companion that stops reading stdin must not hold the run past its
        // timeout or interrupt.
        let request = DispatchRequest::new(script);
        let deadline = timeout.map(|limit| started + limit);
        let dispatched = tokio::select! {
            biased;
            _ = interrupt.cancelled() => Ok(Some(WaitResult::Interrupted(started.elapsed()))),
            written = self.supervisor.write(request) => written.map(|()| None),
            _ = expire_at(deadline) => Ok(Some(WaitResult::TimedOut(started.elapsed()))),
        };
        let waited = match dispatched {
            Ok(Some(early)) => early,
            Ok(None) => self.wait(generation, started, timeout, interrupt).await,
            Err(e) => return Err(self.dispatch_failed(e).await),
        };

        let outcome = match waited {
            WaitResult::Finished(completion) => {
                if !completion.is_trustworthy() {
                    tracing::warn!(?pid, ?completion, "Run ended without a completion signal");
                }
                RunOutcome::Completed { completion }
            }
            WaitResult::TimedOut(elapsed) => {
                tracing::warn!(?pid, ?elapsed, "Run timed out, restarting companion");
                let restarted = self.supervisor.cancel(true);
                self.state.abort().await;
                restarted?;
                RunOutcome::TimedOut { elapsed }
            }
            WaitResult::Interrupted(elapsed) => {
                tracing::info!(?pid, ?elapsed, "Run interrupted, restarting companion");
                if let Err(e) = self.supervisor.cancel(true) {
                    // Interrupted still wins; the next run retries the spawn.
                    tracing::error!(error = %e, "Failed to restart companion after interrupt");
                }
                self.state.abort().await;
                return Err(RunError::Interrupted { elapsed });
            }
        };

        let pulled = self.sync.pull(&self.registry, warn).await?;
        let returned = pulled.len();
        variables.extend(pulled);

        let elapsed = started.elapsed();
        tracing::info!(?pid, generation, ?elapsed, returned, ?outcome, "Run finished");
        Ok(RunReport {
            outcome,
            elapsed,
            pid,
            generation,
        })
    }

    /// Read `path` and run its contents.
    pub async fn run_file(
        &mut self,
        path: impl AsRef<Path>,
        variables: &mut VariableSet,
        timeout: Option<Duration>,
        interrupt: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let path = path.as_ref();
        let script = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RunError::ReadScript {
                path: path.to_path_buf(),
                source,
            })?;
        self.run_until(&script, variables, timeout, interrupt).await
    }

    /// Discard the companion's state by replacing it with a fresh process.
    pub async fn clear(&mut self) -> Result<(), SpawnError> {
        self.supervisor.cancel(true)?;
        self.state.abort().await;
        Ok(())
    }

    /// Terminate the companion without restarting it.
    pub async fn shutdown(mut self) {
        tracing::info!(pid = ?self.supervisor.pid(), "Shutting down companion");
        if let Err(e) = self.supervisor.cancel(false) {
            tracing::warn!(error = %e, "Companion shutdown failed");
        }
        self.state.abort().await;
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    pub fn generation(&self) -> u64 {
        self.supervisor.generation()
    }

    pub async fn is_running(&self) -> bool {
        self.state.is_running().await
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    async fn wait(
        &self,
        generation: u64,
        started: Instant,
        timeout: Option<Duration>,
        interrupt: &CancellationToken,
    ) -> WaitResult {
        let poll = self.config.poll_interval;
        loop {
            let snapshot = self.state.snapshot().await;
            if !snapshot.running {
                let completion = snapshot.completion.unwrap_or(CompletionReason::Aborted);
                return WaitResult::Finished(completion);
            }

            // Monitor already gone, so nothing else will clear this run.
            if self.supervisor.has_exited() {
                self.state
                    .finish(generation, CompletionReason::ProcessExited { code: None })
                    .await;
                continue;
            }

            let elapsed = started.elapsed();
            let pause = match timeout {
                Some(limit) if elapsed >= limit => return WaitResult::TimedOut(elapsed),
                Some(limit) => poll.min(limit - elapsed),
                None => poll,
            };

            tokio::select! {
                biased;
                _ = interrupt.cancelled() => return WaitResult::Interrupted(started.elapsed()),
                _ = self.state.wait_for_change(pause) => {}
            }
        }
    }

    async fn dispatch_failed(&mut self, error: FrameError) -> RunError {
        self.state.abort().await;
        match error {
            FrameError::Oversized { len } => {
                tracing::error!(len, "Script too large to dispatch");
                RunError::OversizedMessage { len }
            }
            FrameError::Io(e) => {
                tracing::error!(error = %e, "Dispatch write failed, restarting companion");
                if let Err(spawn) = self.supervisor.cancel(true) {
                    tracing::error!(error = %spawn, "Failed to restart companion after write");
                }
                RunError::WriteFailure(e)
            }
            other @ (FrameError::Json(_) | FrameError::MalformedHeader(_)) => {
                tracing::error!(error = %other, "Failed to encode script");
                RunError::Encode(other)
            }
        }
    }
}

async fn expire_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
