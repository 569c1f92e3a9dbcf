use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::super::{optional_json, IPCServer};
use crate::backup;
use crate::supervisor::error::SupervisorError;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RestoreRequest {
    pub name: String,
}

/// GET /api/backups?filter=
pub async fn list(State(state): State<IPCServer>, Query(q): Query<ListQuery>) -> Result<Json<Value>, SupervisorError> {
    let dir = state.config.backup_dir();
    let backups = tokio::task::spawn_blocking(move || backup::list_backups(&dir, q.filter.as_deref()))
        .await
        .map_err(anyhow::Error::from)??;
    Ok(Json(json!({ "backups": backups })))
}

/// POST /api/backups - 월드 백업 생성
pub async fn create(State(state): State<IPCServer>) -> Result<Json<Value>, SupervisorError> {
    let dir = state.config.backup_dir();
    let mut supervisor = state.controller().await?;
    let archive = supervisor.backup_world(&dir).await?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Json(json!({ "success": true, "name": name, "path": archive })))
}

/// POST /api/backups/restore - 서버가 정지된 상태에서만 허용
pub async fn restore(State(state): State<IPCServer>, body: Bytes) -> Result<Json<Value>, SupervisorError> {
    let req: RestoreRequest = optional_json(&body)?;
    let name = req.name.trim().to_string();
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(SupervisorError::InvalidRequest(format!("invalid backup name {:?}", name)));
    }
    let archive = state.config.backup_dir().join(&name);
    let world = state.config.world_dir();

    // 복원 중에는 시작 요청이 끼어들지 못하도록 락 유지
    let mut supervisor = state.controller().await?;
    let lifecycle = supervisor.lifecycle();
    if supervisor.is_running().await || !lifecycle.is_idle() {
        return Err(SupervisorError::MustBeStopped(supervisor.lifecycle()));
    }

    let previous = tokio::task::spawn_blocking(move || backup::replace_with_backup(&archive, &world))
        .await
        .map_err(anyhow::Error::from)??;
    drop(supervisor);

    tracing::info!("Restored backup {}", name);
    Ok(Json(json!({ "success": true, "name": name, "previous": previous })))
}
