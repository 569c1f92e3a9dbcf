pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Bytes,
    routing::{delete, get, post},
    Router,
};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::GlobalConfig;
use crate::players::PlayerManager;
use crate::supervisor::error::{StartError, SupervisorError};
use crate::supervisor::launch::LaunchSpec;
use crate::supervisor::output::OutputRing;
use crate::supervisor::state_machine::StateMachine;
use crate::supervisor::{ProcessSupervisor, StartOutcome};

/// How long a request waits for the controller before answering BUSY.
const CONTROLLER_WAIT: Duration = Duration::from_secs(2);

/// IPC Server State
///
/// `supervisor` serializes lifecycle operations. `state` and `output` are
/// lock-free views used by status and console endpoints so they keep
/// answering while a start or stop is in progress.
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Mutex<ProcessSupervisor>>,
    pub state: StateMachine,
    pub output: OutputRing,
    pub players: Arc<PlayerManager>,
    pub config: Arc<GlobalConfig>,
}

impl IPCServer {
    pub fn new(supervisor: ProcessSupervisor, config: GlobalConfig) -> Self {
        let state = supervisor.state();
        let output = supervisor.output();
        let players = PlayerManager::new(config.server.working_dir.clone());
        Self {
            supervisor: Arc::new(Mutex::new(supervisor)),
            state,
            output,
            players: Arc::new(players),
            config: Arc::new(config),
        }
    }

    pub fn router(&self) -> Router {
        use handlers::{backup, players, server, system};

        Router::new()
            .route("/api/status", get(server::status))
            .route("/api/server/start", post(server::start))
            .route("/api/server/stop", post(server::stop))
            .route("/api/server/restart", post(server::restart))
            .route("/api/server/command", post(server::command))
            .route("/api/server/console", get(server::console))
            .route("/api/backups", get(backup::list).post(backup::create))
            .route("/api/backups/restore", post(backup::restore))
            .route("/api/players/:list", get(players::list).post(players::add))
            .route("/api/players/:list/:key", delete(players::remove))
            .route("/api/system", get(system::info))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Exclusive access to the supervisor for one lifecycle operation.
    pub(crate) async fn controller(&self) -> Result<MutexGuard<'_, ProcessSupervisor>, SupervisorError> {
        match tokio::time::timeout(CONTROLLER_WAIT, self.supervisor.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(StartError::Busy(self.state.lifecycle()).into()),
        }
    }

    /// Start (or, with `restart_grace`, stop then start) the server.
    ///
    /// The controller is held while spawning and while settling the outcome,
    /// but not during the readiness wait: a stop issued during a slow boot is
    /// served at once and the pending start answers `START_INTERRUPTED`.
    pub async fn start_server(
        &self,
        spec: &LaunchSpec,
        restart_grace: Option<Duration>,
    ) -> Result<StartOutcome, SupervisorError> {
        let pending = {
            let mut supervisor = self.controller().await?;
            if let Some(grace) = restart_grace {
                tracing::info!("Restarting server...");
                supervisor.stop(grace).await?;
                let delay = supervisor.options().restart_delay;
                tokio::time::sleep(delay).await;
            }
            supervisor.begin_start(spec).await?
        };
        let Some(wait) = pending else {
            return Ok(StartOutcome::AlreadyRunning);
        };

        let report = wait.wait().await;
        let outcome = self.supervisor.lock().await.finish_start(report).await?;
        Ok(outcome)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let listen_addr = self.config.ipc.listen.clone();
        tracing::info!("IPC HTTP server starting on {}", listen_addr);

        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
        tracing::info!("IPC listening on http://{}", listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("IPC server stopped");
        Ok(())
    }
}

/// Optional JSON body: empty means `T::default()`.
pub(crate) fn optional_json<T>(body: &Bytes) -> Result<T, SupervisorError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| SupervisorError::InvalidRequest(e.to_string()))
}
