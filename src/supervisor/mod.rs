//! Single-server process supervisor.
//!
//! `ProcessSupervisor` owns the child process of one game server together with
//! its output reader task and command channel. Lifecycle operations take
//! `&mut self`; observers read the `StateMachine` watch channel and the
//! `OutputRing` without touching the supervisor.

pub mod channel;
pub mod error;
pub mod launch;
pub mod output;
pub mod process;
pub mod readiness;
pub mod state_machine;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backup::{self, BackupError};
use channel::{ChannelError, CommandChannel};
use error::{CommandError, StartError, StopError, SupervisorError};
use launch::LaunchSpec;
use output::OutputRing;
use process::Liveness;
use readiness::{ReadinessDetector, ReadinessError};
use state_machine::{Lifecycle, ServerState, StateMachine};

/// How long the release path waits for the reader to drain the last lines.
const READER_DRAIN_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub log_buffer_size: usize,
    /// Sent before the stop command and before backups. `None` skips the step.
    pub save_command: Option<String>,
    pub stop_command: String,
    pub save_delay: Duration,
    pub poll_interval: Duration,
    pub terminate_wait: Duration,
    pub kill_wait: Duration,
    /// Bound for one command write; a stalled write closes the input stream.
    pub command_write_timeout: Duration,
    pub restart_delay: Duration,
    pub backup_settle: Duration,
    pub world_dir: PathBuf,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            log_buffer_size: output::DEFAULT_CAPACITY,
            save_command: Some("save-all".to_string()),
            stop_command: "stop".to_string(),
            save_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            terminate_wait: Duration::from_secs(5),
            kill_wait: Duration::from_secs(5),
            command_write_timeout: channel::DEFAULT_WRITE_TIMEOUT,
            restart_delay: Duration::from_secs(5),
            backup_settle: Duration::from_secs(5),
            world_dir: PathBuf::from("world"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    AlreadyRunning,
    /// Sentinel observed.
    Ready { after_ms: u64 },
    /// Sentinel not seen within the startup budget; assumed running.
    Unconfirmed { waited_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    AlreadyStopped,
    Graceful,
    Terminated,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownStage {
    Graceful,
    Terminate,
    Kill,
}

impl ShutdownStage {
    fn outcome(self) -> StopOutcome {
        match self {
            Self::Graceful => StopOutcome::Graceful,
            Self::Terminate => StopOutcome::Terminated,
            Self::Kill => StopOutcome::Killed,
        }
    }

    fn escalate(self) -> Option<Self> {
        match self {
            Self::Graceful => Some(Self::Terminate),
            Self::Terminate => Some(Self::Kill),
            Self::Kill => None,
        }
    }
}

/// Readiness wait for a freshly launched generation.
///
/// Holds only observer handles, so it can run while the supervisor itself is
/// free to serve other requests (a stop during a slow boot, for example).
pub struct ReadinessWait {
    generation: u64,
    detector: ReadinessDetector,
    output: OutputRing,
    lifecycle: watch::Receiver<ServerState>,
}

/// Result of a `ReadinessWait`, handed back to `finish_start`.
#[derive(Debug)]
pub struct StartupReport {
    generation: u64,
    result: Result<Duration, ReadinessError>,
}

impl ReadinessWait {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn wait(self) -> StartupReport {
        tracing::info!("Waiting for server to become ready ({})", self.detector.describe());
        let result = self.detector.poll_until_ready(&self.output, self.lifecycle).await;
        StartupReport {
            generation: self.generation,
            result,
        }
    }
}

/// One spawn-to-exit lifetime of the child.
struct Generation {
    id: u64,
    child: Child,
    channel: CommandChannel,
    reader: JoinHandle<()>,
}

pub struct ProcessSupervisor {
    options: SupervisorOptions,
    readiness: ReadinessDetector,
    state: StateMachine,
    output: OutputRing,
    current: Option<Generation>,
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions, readiness: ReadinessDetector) -> Self {
        let output = OutputRing::with_capacity(options.log_buffer_size);
        Self {
            options,
            readiness,
            state: StateMachine::new(),
            output,
            current: None,
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    pub fn output(&self) -> OutputRing {
        self.output.clone()
    }

    pub fn state(&self) -> StateMachine {
        self.state.clone()
    }

    pub fn status(&self) -> ServerState {
        self.state.current()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle()
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(|g| g.child.id())
    }

    pub fn command_channel(&self) -> Option<CommandChannel> {
        self.current.as_ref().map(|g| g.channel.clone())
    }

    /// Spawn the server and wait for readiness. A no-op when already Running.
    pub async fn start(&mut self, spec: &LaunchSpec) -> Result<StartOutcome, StartError> {
        match self.begin_start(spec).await? {
            Some(wait) => {
                let report = wait.wait().await;
                self.finish_start(report).await
            }
            None => Ok(StartOutcome::AlreadyRunning),
        }
    }

    /// First half of `start()`: launch a new generation unless one is already
    /// Running (`None`). The returned wait borrows nothing from the supervisor.
    pub async fn begin_start(&mut self, spec: &LaunchSpec) -> Result<Option<ReadinessWait>, StartError> {
        self.reap_if_exited().await;

        match self.lifecycle() {
            Lifecycle::Running => {
                tracing::warn!("Server is already running");
                return Ok(None);
            }
            phase if !phase.is_idle() => return Err(StartError::Busy(phase)),
            _ => {}
        }

        // 출력은 닫혔지만 프로세스가 아직 살아 있는 경우 먼저 정리
        if self.current.is_some() {
            tracing::warn!("Previous server process is still alive; stopping it first");
            if self.stop(Duration::ZERO).await.is_err() {
                return Err(StartError::Busy(self.lifecycle()));
            }
        }

        let generation = self.launch(spec)?;
        Ok(Some(ReadinessWait {
            generation,
            detector: self.readiness.clone(),
            output: self.output.clone(),
            lifecycle: self.state.subscribe(),
        }))
    }

    /// Spawn the child, enter Starting and attach the reader. Returns the generation id.
    pub fn launch(&mut self, spec: &LaunchSpec) -> Result<u64, StartError> {
        let phase = self.lifecycle();
        if !phase.is_idle() || self.current.is_some() {
            return Err(StartError::Busy(phase));
        }

        if let Err(e) = spec.check_required_files() {
            self.mark_failed();
            return Err(e);
        }

        tracing::info!("Starting server: {}", spec.command_line());
        let mut child = match spec.to_command().spawn() {
            Ok(child) => child,
            Err(source) => {
                tracing::error!("Failed to spawn server process '{}': {}", spec.program, source);
                self.mark_failed();
                return Err(StartError::SpawnFailed {
                    program: spec.program.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            self.mark_failed();
            return Err(StartError::SpawnFailed {
                program: spec.program.clone(),
                source: io::Error::new(io::ErrorKind::Other, "stdout was not captured"),
            });
        };

        self.output.clear();
        let id = match self.state.begin_generation(pid) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Cannot enter starting phase: {}", e);
                let _ = child.start_kill();
                return Err(StartError::Busy(self.lifecycle()));
            }
        };

        let channel = stdin
            .map(CommandChannel::new)
            .unwrap_or_else(CommandChannel::closed)
            .with_write_timeout(self.options.command_write_timeout);
        let reader = output::spawn_reader(stdout, stderr, self.output.clone(), self.state.clone(), id);
        self.current = Some(Generation {
            id,
            child,
            channel,
            reader,
        });

        tracing::info!("Server process started (pid: {:?}, generation {})", pid, id);
        Ok(id)
    }

    /// Second half of `start()`: declare Running, or clean up a generation
    /// that died before becoming ready.
    pub async fn finish_start(&mut self, report: StartupReport) -> Result<StartOutcome, StartError> {
        let phase = self.lifecycle();
        let same_generation = self.current.as_ref().map(|g| g.id) == Some(report.generation);
        if !same_generation || phase == Lifecycle::Stopping {
            // 준비 대기 중에 stop 요청이 이 세대를 가져감
            tracing::warn!(
                "Startup of generation {} was interrupted (server is {})",
                report.generation,
                phase
            );
            return Err(StartError::Interrupted(phase));
        }

        let outcome = match report.result {
            Ok(after) => {
                tracing::info!("Server is ready after {:.1}s", after.as_secs_f64());
                StartOutcome::Ready {
                    after_ms: after.as_millis() as u64,
                }
            }
            Err(ReadinessError::Timeout(waited)) => {
                tracing::warn!(
                    "Readiness not confirmed after {}s; assuming the server is running",
                    waited.as_secs()
                );
                StartOutcome::Unconfirmed {
                    waited_ms: waited.as_millis() as u64,
                }
            }
            Err(ReadinessError::Abandoned(phase)) => {
                tracing::error!("Server left startup before becoming ready ({})", phase);
                self.abandon_generation().await;
                return Err(StartError::ExitedDuringStartup);
            }
        };

        if self.state.transition(Lifecycle::Running).is_err() {
            // 준비 확인 직후 프로세스가 종료됨
            self.abandon_generation().await;
            return Err(StartError::ExitedDuringStartup);
        }
        Ok(outcome)
    }

    /// Graceful -> Terminate -> Kill, each stage bounded.
    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, StopError> {
        if self.reap_if_exited().await || self.current.is_none() {
            tracing::info!("Server is not running, nothing to stop");
            return Ok(StopOutcome::AlreadyStopped);
        }

        let phase = self.lifecycle();
        if phase.is_idle() && self.exits_within(self.options.poll_interval).await {
            // 리더가 EOF를 먼저 본 경우: 프로세스 종료 처리 중
            self.release(phase).await;
            return Ok(StopOutcome::AlreadyStopped);
        }
        let entry = self.enter_shutdown(phase);
        tracing::info!("Stopping server (entry stage: {:?})", entry);

        let result = match self.current.as_mut() {
            Some(gen) => run_shutdown(gen, &self.options, entry, grace).await,
            None => Ok(StopOutcome::AlreadyStopped),
        };

        match result {
            Ok(outcome) => {
                self.release(Lifecycle::Stopped).await;
                tracing::info!("Server stopped ({:?})", outcome);
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!("{}", e);
                Err(e)
            }
        }
    }

    pub async fn restart(
        &mut self,
        spec: &LaunchSpec,
        grace: Duration,
    ) -> Result<StartOutcome, SupervisorError> {
        tracing::info!("Restarting server...");
        self.stop(grace).await?;
        tokio::time::sleep(self.options.restart_delay).await;
        Ok(self.start(spec).await?)
    }

    pub async fn send_command(&mut self, command: &str) -> Result<(), CommandError> {
        let phase = self.lifecycle();
        if phase != Lifecycle::Running {
            return Err(CommandError::NotRunning(phase));
        }
        let Some(channel) = self.command_channel() else {
            return Err(CommandError::NotRunning(phase));
        };

        match channel.write(command).await {
            Ok(()) => {
                tracing::info!("Command sent: {}", command);
                Ok(())
            }
            Err(ChannelError::BrokenPipe) | Err(ChannelError::Closed) => {
                tracing::warn!("Cannot send '{}': server input is closed", command);
                self.is_running().await;
                Err(CommandError::ChannelClosed)
            }
            Err(ChannelError::Timeout(waited)) => Err(CommandError::Timeout(waited)),
            Err(ChannelError::Io(e)) => Err(CommandError::Io(e)),
        }
    }

    /// Ask the OS whether the child is still alive. An exited child is
    /// released and the lifecycle corrected as a side effect.
    pub async fn is_running(&mut self) -> bool {
        if self.current.is_none() {
            return false;
        }
        !self.reap_if_exited().await
    }

    /// Save (if running), settle, then archive the world directory into `destination`.
    pub async fn backup_world(&mut self, destination: &Path) -> Result<PathBuf, BackupError> {
        let world = self.options.world_dir.clone();
        if !world.is_dir() {
            return Err(BackupError::SourceMissing(world));
        }

        if self.lifecycle() == Lifecycle::Running {
            if let Some(save) = self.options.save_command.clone() {
                tracing::info!("Saving world before backup...");
                match self.send_command(&save).await {
                    Ok(()) => tokio::time::sleep(self.options.backup_settle).await,
                    Err(e) => tracing::warn!("Save before backup failed: {}; archiving anyway", e),
                }
            }
        }

        let destination = destination.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || backup::create_backup(&world, &destination, None))
            .await
            .map_err(|e| BackupError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        tracing::info!("Backup created: {}", archive.display());
        Ok(archive)
    }

    /// Move into Stopping and pick the first shutdown stage for `phase`.
    fn enter_shutdown(&self, phase: Lifecycle) -> ShutdownStage {
        match phase {
            Lifecycle::Starting | Lifecycle::Running => {
                if let Err(e) = self.state.transition(Lifecycle::Stopping) {
                    tracing::warn!("{}", e);
                }
                ShutdownStage::Graceful
            }
            // 이전 stop이 Unresponsive로 끝난 상태
            Lifecycle::Stopping => ShutdownStage::Kill,
            // 출력 스트림만 닫히고 프로세스는 살아 있음
            _ => {
                if let Err(e) = self.state.reclaim(self.pid()) {
                    tracing::warn!("{}", e);
                }
                ShutdownStage::Terminate
            }
        }
    }

    fn mark_failed(&self) {
        if self.lifecycle() != Lifecycle::Failed {
            if let Err(e) = self.state.transition(Lifecycle::Failed) {
                tracing::warn!("{}", e);
            }
        }
    }

    /// Returns true when an exited generation was released.
    async fn reap_if_exited(&mut self) -> bool {
        let Some(gen) = self.current.as_mut() else {
            return false;
        };
        let Liveness::Exited(status) = process::poll_liveness(&mut gen.child) else {
            return false;
        };
        tracing::info!("Server process exited ({})", status);

        let to = match self.lifecycle() {
            Lifecycle::Starting => Lifecycle::Failed,
            phase if phase.is_idle() => phase,
            _ => Lifecycle::Stopped,
        };
        self.release(to).await;
        true
    }

    async fn exits_within(&mut self, window: Duration) -> bool {
        match self.current.as_mut() {
            Some(gen) => process::wait_for_exit(&mut gen.child, window).await.is_some(),
            None => true,
        }
    }

    async fn abandon_generation(&mut self) {
        if let Some(gen) = self.current.as_mut() {
            if !process::poll_liveness(&mut gen.child).has_exited() {
                if let Err(e) = process::send_kill(&mut gen.child) {
                    tracing::warn!("{}", e);
                }
                process::wait_for_exit(&mut gen.child, self.options.kill_wait).await;
            }
        }
        self.release(Lifecycle::Failed).await;
    }

    /// Drop the process handle, command channel and reader of the current generation.
    async fn release(&mut self, to: Lifecycle) {
        if let Some(mut gen) = self.current.take() {
            gen.channel.close().await;
            if tokio::time::timeout(READER_DRAIN_WINDOW, &mut gen.reader).await.is_err() {
                gen.reader.abort();
            }
            tracing::debug!("Released process generation {}", gen.id);
        }
        self.state.settle(to);
    }
}

async fn run_shutdown(
    gen: &mut Generation,
    options: &SupervisorOptions,
    entry: ShutdownStage,
    grace: Duration,
) -> Result<StopOutcome, StopError> {
    let mut stage = entry;
    loop {
        let exited = match stage {
            ShutdownStage::Graceful => graceful_stage(gen, options, grace).await,
            ShutdownStage::Terminate => terminate_stage(gen, options).await,
            ShutdownStage::Kill => kill_stage(gen, options).await,
        };
        if exited {
            return Ok(stage.outcome());
        }
        stage = match stage.escalate() {
            Some(next) => next,
            None => {
                return Err(StopError::Unresponsive {
                    pid: gen.child.id(),
                })
            }
        };
    }
}

fn has_exited(gen: &mut Generation) -> bool {
    process::poll_liveness(&mut gen.child).has_exited()
}

async fn graceful_stage(gen: &mut Generation, options: &SupervisorOptions, grace: Duration) -> bool {
    if let Some(save) = &options.save_command {
        tracing::info!("Saving world...");
        if let Err(e) = gen.channel.write(save).await {
            tracing::warn!("Could not send '{}': {}; escalating", save, e);
            return has_exited(gen);
        }
        tokio::time::sleep(options.save_delay).await;
    }

    tracing::info!("Sending '{}' to server...", options.stop_command);
    if let Err(e) = gen.channel.write(&options.stop_command).await {
        tracing::warn!("Could not send '{}': {}; escalating", options.stop_command, e);
        return has_exited(gen);
    }

    let started = Instant::now();
    let deadline = started + grace;
    loop {
        if has_exited(gen) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!("Server did not stop within {}s", grace.as_secs());
            return false;
        }
        tracing::debug!(
            "Waiting for server to stop... ({}s/{}s)",
            (now - started).as_secs(),
            grace.as_secs()
        );
        tokio::time::sleep_until((now + options.poll_interval).min(deadline)).await;
    }
}

async fn terminate_stage(gen: &mut Generation, options: &SupervisorOptions) -> bool {
    if has_exited(gen) {
        return true;
    }
    if let Err(e) = process::send_terminate(&mut gen.child) {
        tracing::warn!("{}", e);
    }
    process::wait_for_exit(&mut gen.child, options.terminate_wait)
        .await
        .is_some()
}

async fn kill_stage(gen: &mut Generation, options: &SupervisorOptions) -> bool {
    if has_exited(gen) {
        return true;
    }
    if let Err(e) = process::send_kill(&mut gen.child) {
        tracing::warn!("{}", e);
    }
    process::wait_for_exit(&mut gen.child, options.kill_wait)
        .await
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_options(world: PathBuf) -> SupervisorOptions {
        SupervisorOptions {
            save_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(20),
            terminate_wait: Duration::from_millis(500),
            kill_wait: Duration::from_secs(2),
            restart_delay: Duration::from_millis(10),
            backup_settle: Duration::from_millis(10),
            world_dir: world,
            ..SupervisorOptions::default()
        }
    }

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(
            fast_options(PathBuf::from("does-not-exist")),
            ReadinessDetector::default().with_poll_interval(Duration::from_millis(20)),
        )
    }

    #[test]
    fn stages_escalate_in_order() {
        assert_eq!(ShutdownStage::Graceful.escalate(), Some(ShutdownStage::Terminate));
        assert_eq!(ShutdownStage::Terminate.escalate(), Some(ShutdownStage::Kill));
        assert_eq!(ShutdownStage::Kill.escalate(), None);
        assert_eq!(ShutdownStage::Kill.outcome(), StopOutcome::Killed);
    }

    #[test]
    fn outcomes_serialize_for_the_api() {
        let v = serde_json::to_value(StartOutcome::Ready { after_ms: 1500 }).unwrap();
        assert_eq!(v, serde_json::json!({ "outcome": "ready", "after_ms": 1500 }));
        let v = serde_json::to_value(StopOutcome::AlreadyStopped).unwrap();
        assert_eq!(v, "already_stopped");
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let mut sup = supervisor();
        assert_eq!(sup.stop(Duration::from_secs(1)).await.unwrap(), StopOutcome::AlreadyStopped);
        assert_eq!(sup.lifecycle(), Lifecycle::NotStarted);
        assert!(!sup.is_running().await);
    }

    #[tokio::test]
    async fn command_requires_running() {
        let mut sup = supervisor();
        let err = sup.send_command("list").await.unwrap_err();
        assert!(matches!(err, CommandError::NotRunning(Lifecycle::NotStarted)));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let mut sup = supervisor();
        let spec = LaunchSpec::new("/definitely/not/a/java", std::env::temp_dir());
        let err = sup.start(&spec).await.unwrap_err();
        assert!(matches!(err, StartError::SpawnFailed { .. }), "{:?}", err);
        assert_eq!(sup.lifecycle(), Lifecycle::Failed);
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn missing_jar_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor();
        let spec = LaunchSpec::new("java", dir.path()).require("server.jar");
        let err = sup.start(&spec).await.unwrap_err();
        assert!(matches!(err, StartError::MissingFile(_)));
        assert_eq!(sup.lifecycle(), Lifecycle::Failed);
    }

    #[tokio::test]
    async fn backup_without_world_is_source_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor();
        let err = sup.backup_world(dir.path()).await.unwrap_err();
        assert!(matches!(err, BackupError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn backup_of_stopped_server_archives_world() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("world");
        std::fs::create_dir_all(world.join("region")).unwrap();
        std::fs::write(world.join("level.dat"), b"level").unwrap();

        let mut sup = ProcessSupervisor::new(fast_options(world), ReadinessDetector::default());
        let archive = sup.backup_world(&dir.path().join("backups")).await.unwrap();
        assert!(archive.exists());
        assert!(archive
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("world_backup_"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reader_eof_is_reconciled_by_is_running() {
        let mut sup = supervisor();
        let spec = LaunchSpec::new("sh", std::env::temp_dir()).args(["-c", "echo bye"]);
        sup.launch(&spec).unwrap();

        let mut rx = sup.state().subscribe();
        while rx.borrow_and_update().lifecycle == Lifecycle::Starting {
            rx.changed().await.unwrap();
        }
        assert_eq!(sup.lifecycle(), Lifecycle::Failed);

        // 자식 프로세스가 완전히 종료될 때까지 대기
        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.is_running().await {
            assert!(Instant::now() < deadline, "child never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(sup.pid().is_none());
        assert!(sup.output().snapshot().contains(&"bye".to_string()));
    }

    #[cfg(unix)]
    async fn wait_for_line(sup: &ProcessSupervisor, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !sup.output().any_line(|l| l.contains(needle)) {
            assert!(Instant::now() < deadline, "never saw {:?}", needle);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[cfg(unix)]
    async fn wait_while_starting(sup: &ProcessSupervisor) {
        let mut rx = sup.state().subscribe();
        while rx.borrow_and_update().lifecycle == Lifecycle::Starting {
            rx.changed().await.unwrap();
        }
    }

    /// TERM을 무시하고 stdin을 그대로 출력하는 프로세스
    #[cfg(unix)]
    const TERM_PROOF: &str = r#"trap '' TERM; echo armed; while read line; do echo "got: $line"; done; while true; do sleep 0.05; done"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn second_stop_from_stopping_goes_straight_to_kill() {
        let mut sup = supervisor();
        let spec = LaunchSpec::new("sh", std::env::temp_dir()).args(["-c", TERM_PROOF]);
        sup.launch(&spec).unwrap();
        wait_for_line(&sup, "armed").await;
        sup.state.transition(Lifecycle::Running).unwrap();

        // 첫 stop이 Terminate 단계까지 갔지만 프로세스가 살아남은 상태
        assert_eq!(sup.enter_shutdown(Lifecycle::Running), ShutdownStage::Graceful);
        let gen = sup.current.as_mut().unwrap();
        assert!(!terminate_stage(gen, &sup.options).await);
        assert_eq!(sup.lifecycle(), Lifecycle::Stopping);
        assert!(sup.pid().is_some());

        let grace = Duration::from_secs(10);
        let started = Instant::now();
        let outcome = sup.stop(grace).await.unwrap();
        assert_eq!(outcome, StopOutcome::Killed);
        assert!(started.elapsed() < grace);
        assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
        assert!(sup.pid().is_none());

        // save/stop 명령은 다시 보내지 않음
        assert!(!sup.output().any_line(|l| l == "got: save-all" || l == "got: stop"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closed_output_with_live_process_reenters_stopping() {
        let script = r#"trap '' TERM; echo armed; exec >&- 2>&-; while true; do sleep 0.05; done"#;
        let mut sup = supervisor();
        let spec = LaunchSpec::new("sh", std::env::temp_dir()).args(["-c", script]);
        sup.launch(&spec).unwrap();

        // 리더가 EOF를 보고 Starting -> Failed, 프로세스는 그대로 살아 있음
        wait_while_starting(&sup).await;
        assert_eq!(sup.lifecycle(), Lifecycle::Failed);
        assert!(sup.is_running().await);
        let pid = sup.pid();
        assert!(pid.is_some());

        // stop 진입 시 Stopping으로 돌아가고 pid가 다시 보임
        assert_eq!(sup.enter_shutdown(Lifecycle::Failed), ShutdownStage::Terminate);
        assert_eq!(sup.lifecycle(), Lifecycle::Stopping);
        assert_eq!(sup.status().pid, pid);

        // Unresponsive 이후와 같은 상태: 다음 stop은 Kill부터
        assert_eq!(sup.enter_shutdown(sup.lifecycle()), ShutdownStage::Kill);
        assert_eq!(sup.stop(Duration::from_secs(10)).await.unwrap(), StopOutcome::Killed);
        assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
        assert!(sup.pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_during_readiness_wait_interrupts_start() {
        let mut sup = supervisor();
        let spec = LaunchSpec::new("sh", std::env::temp_dir()).args(["-c", "echo booting; exec sleep 30"]);
        let wait = sup.begin_start(&spec).await.unwrap().unwrap();
        let generation = wait.generation();
        let waiting = tokio::spawn(wait.wait());

        assert_eq!(sup.stop(Duration::from_millis(100)).await.unwrap(), StopOutcome::Terminated);
        let report = waiting.await.unwrap();
        assert_eq!(report.generation, generation);

        let err = sup.finish_start(report).await.unwrap_err();
        assert!(matches!(err, StartError::Interrupted(Lifecycle::Stopped)), "{:?}", err);
        assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
    }
}
