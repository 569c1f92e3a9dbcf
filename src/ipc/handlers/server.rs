use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::super::{optional_json, IPCServer};
use crate::supervisor::error::SupervisorError;
use crate::system;

const DEFAULT_CONSOLE_LINES: usize = 100;
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    pub grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConsoleQuery {
    pub since: Option<u64>,
    pub count: Option<usize>,
}

/// GET /api/status - 서버 상태 조회 (supervisor 락을 잡지 않음)
pub async fn status(State(state): State<IPCServer>) -> Json<Value> {
    let current = state.state.current();
    let process = match current.pid {
        Some(pid) => system::process_stats_async(pid).await,
        None => None,
    };
    let port = state.config.server.port;
    let port_open = system::check_port_open_async("127.0.0.1", port, PORT_PROBE_TIMEOUT).await;

    Json(json!({
        "lifecycle": current.lifecycle,
        "generation": current.generation,
        "pid": current.pid,
        "started_at": current.started_at,
        "uptime_seconds": current.uptime_seconds(),
        "port": port,
        "port_open": port_open,
        "process": process,
        "console_lines": state.output.len(),
    }))
}

/// POST /api/server/start - 서버 시작 (준비 완료까지 대기, 대기 중에는 락을 잡지 않음)
pub async fn start(State(state): State<IPCServer>) -> Result<Json<Value>, SupervisorError> {
    let spec = state.config.launch_spec();
    let outcome = state.start_server(&spec, None).await?;
    Ok(Json(json!({
        "success": true,
        "result": outcome,
        "lifecycle": state.state.lifecycle(),
    })))
}

/// POST /api/server/stop - 서버 중지
pub async fn stop(State(state): State<IPCServer>, body: Bytes) -> Result<Json<Value>, SupervisorError> {
    let req: StopRequest = optional_json(&body)?;
    let grace = req
        .grace_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.grace_period());

    let mut supervisor = state.controller().await?;
    let outcome = supervisor.stop(grace).await?;
    Ok(Json(json!({
        "success": true,
        "result": outcome,
        "lifecycle": supervisor.lifecycle(),
    })))
}

/// POST /api/server/restart
pub async fn restart(State(state): State<IPCServer>, body: Bytes) -> Result<Json<Value>, SupervisorError> {
    let req: StopRequest = optional_json(&body)?;
    let grace = req
        .grace_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.grace_period());
    let spec = state.config.launch_spec();

    let outcome = state.start_server(&spec, Some(grace)).await?;
    Ok(Json(json!({
        "success": true,
        "result": outcome,
        "lifecycle": state.state.lifecycle(),
    })))
}

/// POST /api/server/command - 서버 콘솔에 명령어 전달
pub async fn command(State(state): State<IPCServer>, body: Bytes) -> Result<Json<Value>, SupervisorError> {
    let req: CommandRequest =
        serde_json::from_slice(&body).map_err(|e| SupervisorError::InvalidRequest(e.to_string()))?;
    let command = req.command.trim();
    if command.is_empty() || command.contains('\n') {
        return Err(SupervisorError::InvalidRequest(
            "command must be a single non-empty line".to_string(),
        ));
    }

    let mut supervisor = state.controller().await?;
    supervisor.send_command(command).await?;
    Ok(Json(json!({ "success": true, "command": command })))
}

/// GET /api/server/console?since=<id>&count=<n>
pub async fn console(State(state): State<IPCServer>, Query(q): Query<ConsoleQuery>) -> Json<Value> {
    let mut lines = match q.since {
        Some(id) => state.output.since(id),
        None => state.output.recent(q.count.unwrap_or(DEFAULT_CONSOLE_LINES)),
    };
    if let (Some(_), Some(count)) = (q.since, q.count) {
        let skip = lines.len().saturating_sub(count);
        lines.drain(..skip);
    }
    let last_id = lines.last().map(|l| l.id).or(q.since).unwrap_or(0);
    Json(json!({
        "lifecycle": state.state.lifecycle(),
        "lines": lines,
        "last_id": last_id,
    }))
}
