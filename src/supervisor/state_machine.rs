use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

/// Phase of the supervised server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl Lifecycle {
    /// Phases during which a process handle is held.
    pub fn has_process(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Phases from which a new `start()` may spawn.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::NotStarted | Self::Stopped | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0} -> {1}")]
    InvalidTransition(Lifecycle, Lifecycle),
}

pub fn can_transition(from: Lifecycle, to: Lifecycle) -> bool {
    use Lifecycle::*;
    matches!(
        (from, to),
        (NotStarted | Stopped | Failed, Starting)
            | (NotStarted | Stopped, Failed)
            | (Starting, Running)
            | (Starting, Stopping)
            | (Starting, Failed)
            | (Running, Stopping)
            | (Running, Stopped)
            | (Stopping, Stopped)
            // 출력은 닫혔지만 프로세스가 남아 있어 stop()이 회수하는 경우
            | (Stopped | Failed, Stopping)
    )
}

/// Snapshot of the supervisor state published to observers.
#[derive(Debug, Clone, Serialize)]
pub struct ServerState {
    pub lifecycle: Lifecycle,
    /// Incremented on every spawn; 0 until the first one.
    pub generation: u64,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Local>>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::NotStarted,
            generation: 0,
            pid: None,
            started_at: None,
        }
    }
}

impl ServerState {
    pub fn uptime_seconds(&self) -> Option<i64> {
        if !self.lifecycle.has_process() {
            return None;
        }
        self.started_at
            .map(|t| (Local::now() - t).num_seconds().max(0))
    }
}

/// Lifecycle holder shared by the controller and the output reader.
///
/// Writes go through a `watch` channel so status readers and the readiness
/// detector observe changes without locking the supervisor itself.
#[derive(Clone)]
pub struct StateMachine {
    tx: Arc<watch::Sender<ServerState>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        let (tx, _) = watch::channel(ServerState::default());
        Self { tx: Arc::new(tx) }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ServerState {
        self.tx.borrow().clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.tx.borrow().lifecycle
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }

    pub fn transition(&self, to: Lifecycle) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|state| {
            if !can_transition(state.lifecycle, to) {
                result = Err(TransitionError::InvalidTransition(state.lifecycle, to));
                return false;
            }
            tracing::info!("State transition: {} -> {}", state.lifecycle, to);
            state.lifecycle = to;
            if !to.has_process() {
                state.pid = None;
            }
            true
        });
        result
    }

    /// Idle -> Starting for a freshly spawned process. Returns the new generation id.
    pub fn begin_generation(&self, pid: Option<u32>) -> Result<u64, TransitionError> {
        let mut result = Err(TransitionError::InvalidTransition(
            Lifecycle::NotStarted,
            Lifecycle::Starting,
        ));
        self.tx.send_if_modified(|state| {
            if !can_transition(state.lifecycle, Lifecycle::Starting) {
                result = Err(TransitionError::InvalidTransition(
                    state.lifecycle,
                    Lifecycle::Starting,
                ));
                return false;
            }
            tracing::info!("State transition: {} -> {}", state.lifecycle, Lifecycle::Starting);
            state.lifecycle = Lifecycle::Starting;
            state.generation += 1;
            state.pid = pid;
            state.started_at = Some(Local::now());
            result = Ok(state.generation);
            true
        });
        result
    }

    /// Idle -> Stopping for a process whose output closed before it exited.
    /// The pid cleared at end-of-stream is published again.
    pub fn reclaim(&self, pid: Option<u32>) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|state| {
            if !state.lifecycle.is_idle() || !can_transition(state.lifecycle, Lifecycle::Stopping) {
                result = Err(TransitionError::InvalidTransition(state.lifecycle, Lifecycle::Stopping));
                return false;
            }
            tracing::info!(
                "State transition: {} -> {} (process still alive)",
                state.lifecycle,
                Lifecycle::Stopping
            );
            state.lifecycle = Lifecycle::Stopping;
            state.pid = pid;
            true
        });
        result
    }

    /// Called by the output reader when its streams reach end-of-stream.
    ///
    /// Only the generation that is still current is touched, and only while it
    /// is Starting or Running; a Stopping generation is finished by `stop()`.
    pub fn finish_generation(&self, generation: u64) -> Option<Lifecycle> {
        let mut changed = None;
        self.tx.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            let next = match state.lifecycle {
                Lifecycle::Starting => Lifecycle::Failed,
                Lifecycle::Running => Lifecycle::Stopped,
                _ => return false,
            };
            tracing::warn!(
                "Server output closed, state transition: {} -> {}",
                state.lifecycle,
                next
            );
            state.lifecycle = next;
            state.pid = None;
            changed = Some(next);
            true
        });
        changed
    }

    /// Force an idle phase after the process handle has been released.
    pub fn settle(&self, to: Lifecycle) {
        debug_assert!(to.is_idle());
        self.tx.send_if_modified(|state| {
            let pid_cleared = state.pid.take().is_some();
            if state.lifecycle == to {
                return pid_cleared;
            }
            tracing::info!("State transition: {} -> {}", state.lifecycle, to);
            state.lifecycle = to;
            true
        });
    }
}
