use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Child;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process has no pid (already reaped)")]
    NoPid,
    #[error("failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}

/// Result of a non-blocking liveness check against the OS process table.
#[derive(Debug)]
pub enum Liveness {
    Alive,
    Exited(ExitStatus),
    /// The OS could not be queried; treat as alive.
    Unknown(std::io::Error),
}

impl Liveness {
    pub fn has_exited(&self) -> bool {
        matches!(self, Self::Exited(_))
    }
}

pub fn poll_liveness(child: &mut Child) -> Liveness {
    match child.try_wait() {
        Ok(Some(status)) => Liveness::Exited(status),
        Ok(None) => Liveness::Alive,
        Err(e) => {
            tracing::warn!("Failed to query process status: {}", e);
            Liveness::Unknown(e)
        }
    }
}

/// Ask the process to terminate (SIGTERM on Unix).
pub fn send_terminate(child: &mut Child) -> Result<(), ProcessError> {
    let pid = child.id().ok_or(ProcessError::NoPid)?;
    tracing::info!("Sending TERM signal to server process (pid: {})", pid);

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
            ProcessError::SignalFailed {
                pid,
                reason: format!("Failed to send signal: {}", e),
            }
        })?;
    }

    // Windows에는 SIGTERM이 없으므로 TerminateProcess로 바로 종료
    #[cfg(not(unix))]
    {
        child.start_kill().map_err(|e| ProcessError::SignalFailed {
            pid,
            reason: e.to_string(),
        })?;
    }

    Ok(())
}

/// Unconditional kill (SIGKILL on Unix, TerminateProcess on Windows).
pub fn send_kill(child: &mut Child) -> Result<(), ProcessError> {
    let pid = child.id().ok_or(ProcessError::NoPid)?;
    tracing::warn!("Sending KILL signal to server process (pid: {})", pid);
    child.start_kill().map_err(|e| ProcessError::SignalFailed {
        pid,
        reason: e.to_string(),
    })
}

/// Wait at most `window` for the process to exit.
pub async fn wait_for_exit(child: &mut Child, window: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(window, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!("Failed to wait for server process: {}", e);
            None
        }
        Err(_) => None,
    }
}
