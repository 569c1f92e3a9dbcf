use std::time::Duration;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::super::IPCServer;
use crate::supervisor::error::SupervisorError;
use crate::system;

#[derive(Debug, Default, Deserialize)]
pub struct SystemQuery {
    /// Also look up the public address (outbound HTTPS request).
    #[serde(default)]
    pub external: bool,
}

/// GET /api/system?external=true
pub async fn info(State(state): State<IPCServer>, Query(q): Query<SystemQuery>) -> Result<Json<Value>, SupervisorError> {
    let host = system::system_info_async().await?;
    let local_ip = system::local_ip().await.ok();
    let java = match system::java_version(&state.config.server.java_path).await {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!("Java version unavailable: {:#}", e);
            None
        }
    };
    let properties = system::read_server_properties(&state.config.resolve(std::path::Path::new("server.properties"))).ok();

    let port = properties
        .as_ref()
        .and_then(|p| p.get("server-port"))
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(state.config.server.port);
    let port_open = system::check_port_open_async("127.0.0.1", port, Duration::from_millis(300)).await;

    let external_ip = if q.external {
        match system::external_ip().await {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::warn!("External IP lookup failed: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    Ok(Json(json!({
        "system": host,
        "local_ip": local_ip,
        "external_ip": external_ip,
        "java": java,
        "server_port": port,
        "port_open": port_open,
        "server_properties": properties,
    })))
}
