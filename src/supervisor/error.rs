//! Supervisor error types. Each failure kind stays distinguishable so the IPC
//! layer can tell a caller whether to retry, escalate or just inform.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;

use super::state_machine::{Lifecycle, TransitionError};
use crate::backup::BackupError;
use crate::players::PlayerError;

#[derive(thiserror::Error, Debug)]
pub enum StartError {
    #[error("required file not found: {0}")]
    MissingFile(PathBuf),

    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("server is {0}; wait for the current operation to finish")]
    Busy(Lifecycle),

    #[error("server process exited during startup")]
    ExitedDuringStartup,

    #[error("startup was interrupted by another request (server is now {0})")]
    Interrupted(Lifecycle),
}

#[derive(thiserror::Error, Debug)]
pub enum StopError {
    #[error("server process {pid:?} survived terminate and kill")]
    Unresponsive { pid: Option<u32> },
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("server is not running ({0})")]
    NotRunning(Lifecycle),

    #[error("command channel closed: the server process is gone")]
    ChannelClosed,

    #[error("server did not accept the command within {0:?}; its input is now closed")]
    Timeout(Duration),

    #[error("failed to write command: {0}")]
    Io(#[source] io::Error),
}

/// Umbrella error for the IPC layer and `restart()`.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Player(#[from] PlayerError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("server must be stopped first (currently {0})")]
    MustBeStopped(Lifecycle),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Start(StartError::MissingFile(_)) => StatusCode::NOT_FOUND,
            Self::Start(StartError::Busy(_) | StartError::Interrupted(_)) => StatusCode::CONFLICT,
            Self::Start(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Stop(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Command(CommandError::NotRunning(_)) => StatusCode::CONFLICT,
            Self::Command(CommandError::ChannelClosed) => StatusCode::GONE,
            Self::Command(CommandError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Command(CommandError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Backup(BackupError::SourceMissing(_) | BackupError::ArchiveMissing(_)) => {
                StatusCode::NOT_FOUND
            }
            Self::Backup(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Player(PlayerError::AlreadyListed(_)) => StatusCode::CONFLICT,
            Self::Player(PlayerError::NotListed(_)) => StatusCode::NOT_FOUND,
            Self::Player(PlayerError::InvalidLevel(_)) => StatusCode::BAD_REQUEST,
            Self::Player(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Transition(_) | Self::MustBeStopped(_) => StatusCode::CONFLICT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Start(StartError::MissingFile(_)) => "MISSING_FILE",
            Self::Start(StartError::SpawnFailed { .. }) => "SPAWN_FAILED",
            Self::Start(StartError::Busy(_)) => "BUSY",
            Self::Start(StartError::ExitedDuringStartup) => "EXITED_DURING_STARTUP",
            Self::Start(StartError::Interrupted(_)) => "START_INTERRUPTED",
            Self::Stop(StopError::Unresponsive { .. }) => "UNRESPONSIVE",
            Self::Command(CommandError::NotRunning(_)) => "NOT_RUNNING",
            Self::Command(CommandError::ChannelClosed) => "CHANNEL_CLOSED",
            Self::Command(CommandError::Timeout(_)) => "COMMAND_TIMEOUT",
            Self::Command(CommandError::Io(_)) => "COMMAND_IO_ERROR",
            Self::Backup(BackupError::SourceMissing(_)) => "SOURCE_MISSING",
            Self::Backup(BackupError::ArchiveMissing(_)) => "ARCHIVE_MISSING",
            Self::Backup(_) => "BACKUP_IO_ERROR",
            Self::Player(PlayerError::AlreadyListed(_)) => "ALREADY_LISTED",
            Self::Player(PlayerError::NotListed(_)) => "NOT_LISTED",
            Self::Player(PlayerError::InvalidLevel(_)) => "INVALID_LEVEL",
            Self::Player(_) => "PLAYER_FILE_ERROR",
            Self::Transition(_) => "INVALID_TRANSITION",
            Self::MustBeStopped(_) => "MUST_BE_STOPPED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
