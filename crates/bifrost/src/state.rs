//! Run-state shared between the coordinator and the output monitor.
//!
//! A single `running` flag behind a read/write lock. All access goes through
//! scoped guards, so a cancelled or panicking holder can never leave the lock
//! held. A [`Notify`] lets the coordinator's bounded poll wake as soon as the
//! flag is cleared instead of sleeping out the whole interval.
//!
//! Each run is bound to the process generation it was dispatched to. Monitors
//! of earlier generations cannot clear a newer run.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};

/// Why a run stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CompletionReason {
    /// Companion printed the completion marker.
    Signaled,
    /// Companion process exited before signaling completion.
    ProcessExited { code: Option<i32> },
    /// Host cleared the flag (timeout, interrupt, dispatch failure).
    Aborted,
}

impl CompletionReason {
    /// Whether variables written by the companion can be relied on.
    pub fn is_trustworthy(&self) -> bool {
        matches!(self, Self::Signaled)
    }
}

/// Consistent view of the run flag, taken under one read guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSnapshot {
    pub running: bool,
    pub generation: u64,
    pub completion: Option<CompletionReason>,
}

pub struct RunState {
    flag: RwLock<RunSnapshot>,
    changed: Notify,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            flag: RwLock::new(RunSnapshot {
                running: false,
                generation: 0,
                completion: None,
            }),
            changed: Notify::new(),
        }
    }

    /// Mark a run as dispatched to `generation`.
    pub async fn begin(&self, generation: u64) {
        let mut flag = self.flag.write().await;
        flag.running = true;
        flag.generation = generation;
        flag.completion = None;
    }

    /// Clear the flag on behalf of the monitor bound to `generation`.
    ///
    /// Returns false (and changes nothing) when no run is active or the run
    /// belongs to another generation, so a run is cleared at most once.
    pub async fn finish(&self, generation: u64, reason: CompletionReason) -> bool {
        let cleared = {
            let mut flag = self.flag.write().await;
            if !flag.running || flag.generation != generation {
                false
            } else {
                flag.running = false;
                flag.completion = Some(reason);
                true
            }
        };
        if cleared {
            self.changed.notify_one();
        }
        cleared
    }

    /// Force the flag off regardless of generation. Returns whether a run was active.
    pub async fn abort(&self) -> bool {
        let was_running = {
            let mut flag = self.flag.write().await;
            let was_running = flag.running;
            if was_running {
                flag.running = false;
                flag.completion = Some(CompletionReason::Aborted);
            }
            was_running
        };
        if was_running {
            self.changed.notify_one();
        }
        was_running
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        *self.flag.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.flag.read().await.running
    }

    /// Sleep until the flag changes or `max` elapses, whichever comes first.
    pub async fn wait_for_change(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.changed.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn starts_idle() {
        let state = RunState::new();
        let snap = state.snapshot().await;
        assert!(!snap.running);
        assert_eq!(snap.completion, None);
    }

    #[tokio::test]
    async fn completion_clears_exactly_once_per_dispatch() {
        let state = RunState::new();
        state.begin(1).await;
        assert!(state.is_running().await);

        assert!(state.finish(1, CompletionReason::Signaled).await);
        assert!(!state.is_running().await);

        // A second marker without a new dispatch is ignored.
        assert!(!state.finish(1, CompletionReason::Signaled).await);
        assert!(!state.finish(1, CompletionReason::ProcessExited { code: Some(0) }).await);
        assert_eq!(
            state.snapshot().await.completion,
            Some(CompletionReason::Signaled)
        );

        state.begin(1).await;
        assert!(state.finish(1, CompletionReason::Signaled).await);
    }

    #[tokio::test]
    async fn stale_generation_cannot_clear_run() {
        let state = RunState::new();
        state.begin(3).await;

        assert!(!state.finish(2, CompletionReason::Signaled).await);
        assert!(state.is_running().await);

        assert!(state.finish(3, CompletionReason::ProcessExited { code: None }).await);
        assert_eq!(
            state.snapshot().await.completion,
            Some(CompletionReason::ProcessExited { code: None })
        );
    }

    #[tokio::test]
    async fn abort_overrides_any_generation() {
        let state = RunState::new();
        assert!(!state.abort().await);

        state.begin(7).await;
        assert!(state.abort().await);
        let snap = state.snapshot().await;
        assert!(!snap.running);
        assert_eq!(snap.completion, Some(CompletionReason::Aborted));
        assert!(!state.finish(7, CompletionReason::Signaled).await);
    }

    #[tokio::test]
    async fn finish_wakes_waiter() {
        let state = Arc::new(RunState::new());
        state.begin(1).await;

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                state.wait_for_change(Duration::from_secs(30)).await;
                started.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.finish(1, CompletionReason::Signaled).await;

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(5), "waited {waited:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_partial_transition() {
        let state = Arc::new(RunState::new());

        let writer = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                for generation in 1..=500u64 {
                    state.begin(generation).await;
                    tokio::task::yield_now().await;
                    state.finish(generation, CompletionReason::Signaled).await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let state = Arc::clone(&state);
            readers.push(tokio::spawn(async move {
                for _ in 0..2_000 {
                    let snap = state.snapshot().await;
                    // running and completion always move together
                    assert_eq!(snap.running, snap.completion.is_none() && snap.generation > 0);
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[test]
    fn completion_reason_serializes() {
        insta::assert_json_snapshot!(
            "completion_reasons",
            [
                CompletionReason::Signaled,
                CompletionReason::ProcessExited { code: Some(1) },
                CompletionReason::Aborted,
            ]
        );
    }
}
