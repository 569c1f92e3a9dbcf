use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::super::IPCServer;
use crate::players::{self, PlayerManager};
use crate::supervisor::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerList {
    Whitelist,
    Ops,
    BannedPlayers,
    BannedIps,
}

impl PlayerList {
    fn parse(name: &str) -> Result<Self, SupervisorError> {
        match name {
            "whitelist" => Ok(Self::Whitelist),
            "ops" => Ok(Self::Ops),
            "banned-players" => Ok(Self::BannedPlayers),
            "banned-ips" => Ok(Self::BannedIps),
            other => Err(SupervisorError::InvalidRequest(format!("unknown player list '{}'", other))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AddRequest {
    pub name: Option<String>,
    pub ip: Option<String>,
    pub uuid: Option<String>,
    pub reason: Option<String>,
    pub expires: Option<String>,
    pub level: Option<u8>,
    #[serde(default)]
    pub bypasses_player_limit: bool,
}

impl AddRequest {
    fn key(&self, list: PlayerList) -> Result<&str, SupervisorError> {
        let (value, field) = match list {
            PlayerList::BannedIps => (self.ip.as_deref(), "ip"),
            _ => (self.name.as_deref(), "name"),
        };
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(SupervisorError::InvalidRequest(format!("'{}' is required", field))),
        }
    }
}

/// GET /api/players/:list - whitelist, ops, banned-players, banned-ips, activity
pub async fn list(State(state): State<IPCServer>, Path(list): Path<String>) -> Result<Json<Value>, SupervisorError> {
    if list == "activity" {
        let lines = state.output.snapshot();
        let events = players::extract_activity(lines.iter().map(String::as_str));
        return Ok(Json(json!({ "activity": events })));
    }

    let pm: &PlayerManager = &state.players;
    let entries = match PlayerList::parse(&list)? {
        PlayerList::Whitelist => json!(pm.whitelist()?),
        PlayerList::Ops => json!(pm.ops()?),
        PlayerList::BannedPlayers => json!(pm.banned_players()?),
        PlayerList::BannedIps => json!(pm.banned_ips()?),
    };
    Ok(Json(json!({ "list": list, "entries": entries })))
}

/// POST /api/players/:list
pub async fn add(
    State(state): State<IPCServer>,
    Path(list): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, SupervisorError> {
    let kind = PlayerList::parse(&list)?;
    let req: AddRequest =
        serde_json::from_slice(&body).map_err(|e| SupervisorError::InvalidRequest(e.to_string()))?;
    let key = req.key(kind)?;

    let pm = &state.players;
    match kind {
        PlayerList::Whitelist => pm.add_to_whitelist(key, req.uuid.as_deref())?,
        PlayerList::Ops => pm.add_op(key, req.level.unwrap_or(4), req.bypasses_player_limit)?,
        PlayerList::BannedPlayers => pm.ban_player(key, req.reason.as_deref(), req.expires.as_deref())?,
        PlayerList::BannedIps => pm.ban_ip(key, req.reason.as_deref(), req.expires.as_deref())?,
    }
    Ok(Json(json!({ "success": true, "list": list, "key": key })))
}

/// DELETE /api/players/:list/:key
pub async fn remove(
    State(state): State<IPCServer>,
    Path((list, key)): Path<(String, String)>,
) -> Result<Json<Value>, SupervisorError> {
    let pm = &state.players;
    match PlayerList::parse(&list)? {
        PlayerList::Whitelist => pm.remove_from_whitelist(&key)?,
        PlayerList::Ops => pm.remove_op(&key)?,
        PlayerList::BannedPlayers => pm.unban_player(&key)?,
        PlayerList::BannedIps => pm.unban_ip(&key)?,
    }
    Ok(Json(json!({ "success": true, "list": list, "key": key })))
}
