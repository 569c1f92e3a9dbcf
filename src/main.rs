use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mc_warden::config::GlobalConfig;
use mc_warden::ipc::IPCServer;
use mc_warden::supervisor::ProcessSupervisor;

const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("mc-warden starting");

    let config = GlobalConfig::load()?;
    let supervisor = ProcessSupervisor::new(config.supervisor_options(), config.readiness_detector()?);
    let ipc_server = IPCServer::new(supervisor, config.clone());
    let shutdown = CancellationToken::new();

    if config.server.autostart {
        let spec = config.launch_spec();
        let server = ipc_server.clone();
        tokio::spawn(async move {
            match server.start_server(&spec, None).await {
                Ok(outcome) => tracing::info!("Autostart finished: {:?}", outcome),
                Err(e) => tracing::error!("Autostart failed: {}", e),
            }
        });
    }

    // 백그라운드 모니터링 태스크: 종료된 자식 프로세스 회수
    let supervisor_monitor = ipc_server.supervisor.clone();
    let monitor_shutdown = shutdown.clone();
    let monitor = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = monitor_shutdown.cancelled() => break,
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
            }
            // 시작/정지 중이면 이번 주기는 건너뜀
            let Ok(mut sup) = supervisor_monitor.try_lock() else {
                continue;
            };
            let had_process = sup.pid().is_some();
            if had_process && !sup.is_running().await {
                tracing::warn!("Server process is gone (now {})", sup.lifecycle());
            }
        }
    });

    // Graceful shutdown: Ctrl+C 시 게임 서버를 먼저 정지
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received, cleaning up...");
        signal_shutdown.cancel();
    });

    let mut server = tokio::spawn(ipc_server.clone().start(shutdown.clone()));

    // IPC 서버가 먼저 끝나면(바인드 실패 등) 그대로 정리 단계로 진행
    let early_exit = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = &mut server => {
            shutdown.cancel();
            Some(result)
        }
    };
    let _ = monitor.await;

    let grace = config.grace_period();
    let mut sup = ipc_server.supervisor.lock().await;
    match sup.stop(grace).await {
        Ok(outcome) => tracing::info!("Server stopped on shutdown: {:?}", outcome),
        Err(e) => tracing::error!("Failed to stop server on shutdown: {}", e),
    }
    drop(sup);

    let result = match early_exit {
        Some(result) => result,
        None => server.await,
    };
    match result {
        Ok(Err(e)) => tracing::error!("IPC server error: {}", e),
        Err(e) => tracing::error!("IPC server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    tracing::info!("mc-warden shutting down");
    Ok(())
}
