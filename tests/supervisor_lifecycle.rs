//! ProcessSupervisor 통합 테스트
//!
//! 실제 `sh` 자식 프로세스를 가짜 게임 서버로 사용합니다.
//! - ready: 준비 문구를 출력한 뒤 stdin을 읽고 "stop"에서 종료
//! - silent: 준비 문구 없이 sleep
//! - stubborn: TERM 무시, stdin 무시
#![cfg(unix)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use mc_warden::supervisor::error::{CommandError, StartError};
use mc_warden::supervisor::launch::LaunchSpec;
use mc_warden::supervisor::readiness::ReadinessDetector;
use mc_warden::supervisor::state_machine::Lifecycle;
use mc_warden::supervisor::{ProcessSupervisor, StartOutcome, StopOutcome, SupervisorOptions};

const READY_SERVER: &str = r#"
echo "Starting minecraft server version 1.21"
echo "[Server thread/INFO]: Done (0.1s)! For help, type \"help\""
while read line; do
  echo "got: $line"
  if [ "$line" = "stop" ]; then
    echo "Stopping server"
    exit 0
  fi
done
"#;

const SILENT_SERVER: &str = "echo booting; exec sleep 30";

const STUBBORN_SERVER: &str = r#"
trap '' TERM
echo "Done (0.1s)! For help, type \"help\""
while true; do sleep 0.05; done
"#;

fn options() -> SupervisorOptions {
    SupervisorOptions {
        save_delay: Duration::from_millis(10),
        poll_interval: Duration::from_millis(20),
        terminate_wait: Duration::from_millis(300),
        kill_wait: Duration::from_secs(2),
        restart_delay: Duration::from_millis(20),
        backup_settle: Duration::from_millis(10),
        world_dir: PathBuf::from("world"),
        ..SupervisorOptions::default()
    }
}

fn supervisor(startup_timeout: Duration) -> ProcessSupervisor {
    let readiness = ReadinessDetector::default()
        .with_timeout(startup_timeout)
        .with_poll_interval(Duration::from_millis(20));
    ProcessSupervisor::new(options(), readiness)
}

fn sh(script: &str) -> LaunchSpec {
    LaunchSpec::new("sh", std::env::temp_dir()).args(["-c", script])
}

async fn wait_for_line(sup: &ProcessSupervisor, needle: &str) {
    let output = sup.output();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !output.any_line(|l| l.contains(needle)) {
        assert!(Instant::now() < deadline, "never saw {:?} in {:?}", needle, output.snapshot());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_lifecycle(sup: &ProcessSupervisor, want: Lifecycle) {
    let mut rx = sup.state().subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while rx.borrow_and_update().lifecycle != want {
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("lifecycle never reached {}", want));
}

#[tokio::test]
async fn start_command_and_graceful_stop() {
    let mut sup = supervisor(Duration::from_secs(5));
    let outcome = sup.start(&sh(READY_SERVER)).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Ready { .. }), "{:?}", outcome);
    assert_eq!(sup.lifecycle(), Lifecycle::Running);
    assert!(sup.pid().is_some());
    assert!(sup.is_running().await);

    sup.send_command("say hello").await.unwrap();
    wait_for_line(&sup, "got: say hello").await;

    let outcome = sup.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, StopOutcome::Graceful);
    assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
    assert!(sup.pid().is_none());

    // save 명령이 stop보다 먼저 전달됨
    let lines = sup.output().snapshot();
    let save = lines.iter().position(|l| l == "got: save-all").unwrap();
    let stop = lines.iter().position(|l| l == "got: stop").unwrap();
    assert!(save < stop);
}

#[tokio::test]
async fn start_while_running_spawns_nothing() {
    let mut sup = supervisor(Duration::from_secs(5));
    sup.start(&sh(READY_SERVER)).await.unwrap();
    let first = sup.status();

    let outcome = sup.start(&sh(READY_SERVER)).await.unwrap();
    assert_eq!(outcome, StartOutcome::AlreadyRunning);
    let second = sup.status();
    assert_eq!(first.generation, second.generation);
    assert_eq!(first.pid, second.pid);

    sup.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn stop_twice_is_noop() {
    let mut sup = supervisor(Duration::from_secs(5));
    sup.start(&sh(READY_SERVER)).await.unwrap();
    sup.stop(Duration::from_secs(5)).await.unwrap();

    let generation = sup.status().generation;
    assert_eq!(sup.stop(Duration::from_secs(5)).await.unwrap(), StopOutcome::AlreadyStopped);
    assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
    assert_eq!(sup.status().generation, generation);
}

#[tokio::test]
async fn command_after_stop_is_not_running() {
    let mut sup = supervisor(Duration::from_secs(5));
    sup.start(&sh(READY_SERVER)).await.unwrap();
    sup.stop(Duration::from_secs(5)).await.unwrap();

    let lines_before = sup.output().len();
    let err = sup.send_command("list").await.unwrap_err();
    assert!(matches!(err, CommandError::NotRunning(Lifecycle::Stopped)));
    assert_eq!(sup.output().len(), lines_before);
}

#[tokio::test]
async fn missing_sentinel_is_unconfirmed_then_terminated() {
    let mut sup = supervisor(Duration::from_millis(300));
    let started = Instant::now();
    let outcome = sup.start(&sh(SILENT_SERVER)).await.unwrap();
    let waited = started.elapsed();

    assert_eq!(outcome, StartOutcome::Unconfirmed { waited_ms: 300 });
    assert!(waited >= Duration::from_millis(300), "{:?}", waited);
    assert_eq!(sup.lifecycle(), Lifecycle::Running);

    // sleep은 stdin을 읽지 않으므로 grace 이후 TERM으로 종료
    let outcome = sup.stop(Duration::from_millis(200)).await.unwrap();
    assert_eq!(outcome, StopOutcome::Terminated);
    assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test]
async fn stubborn_process_is_killed_within_bounds() {
    let mut sup = supervisor(Duration::from_secs(5));
    sup.start(&sh(STUBBORN_SERVER)).await.unwrap();

    let grace = Duration::from_millis(500);
    let started = Instant::now();
    let outcome = sup.stop(grace).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome, StopOutcome::Killed);
    assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
    let opts = sup.options();
    assert!(elapsed >= grace + opts.terminate_wait, "{:?}", elapsed);
    assert!(
        elapsed < grace + opts.save_delay + opts.terminate_wait + opts.kill_wait + Duration::from_secs(1),
        "{:?}",
        elapsed
    );
}

#[tokio::test]
async fn stop_after_child_exited_on_its_own() {
    let script = r#"echo "Done (0.1s)! For help, type \"help\""; sleep 0.2; exit 0"#;
    let mut sup = supervisor(Duration::from_secs(5));
    sup.start(&sh(script)).await.unwrap();

    // 리더가 EOF를 감지해 Stopped로 전환
    wait_for_lifecycle(&sup, Lifecycle::Stopped).await;
    assert!(sup.output().any_line(|l| l.contains("output closed")));

    let started = Instant::now();
    assert_eq!(sup.stop(Duration::from_secs(5)).await.unwrap(), StopOutcome::AlreadyStopped);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
    assert!(sup.pid().is_none());
}

#[tokio::test]
async fn exit_during_startup_fails() {
    let mut sup = supervisor(Duration::from_secs(5));
    let err = sup.start(&sh("echo 'Error: Unable to access jarfile server.jar'; exit 1")).await.unwrap_err();
    assert!(matches!(err, StartError::ExitedDuringStartup), "{:?}", err);
    assert_eq!(sup.lifecycle(), Lifecycle::Failed);
    assert!(sup.output().any_line(|l| l.contains("Unable to access jarfile")));

    // Failed 이후 다시 시작 가능
    let outcome = sup.start(&sh(READY_SERVER)).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Ready { .. }));
    assert_eq!(sup.status().generation, 2);
    sup.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn restart_spawns_a_new_generation() {
    let mut sup = supervisor(Duration::from_secs(5));
    sup.start(&sh(READY_SERVER)).await.unwrap();
    let first = sup.status();

    let outcome = sup.restart(&sh(READY_SERVER), Duration::from_secs(5)).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Ready { .. }));
    let second = sup.status();
    assert_eq!(second.generation, first.generation + 1);
    assert_ne!(second.pid, first.pid);
    assert_eq!(second.lifecycle, Lifecycle::Running);

    sup.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn closed_stdin_surfaces_as_channel_closed() {
    let script = r#"exec 0<&-; echo "Done (0.1s)! For help, type \"help\""; sleep 1"#;
    let mut sup = supervisor(Duration::from_secs(5));
    sup.start(&sh(script)).await.unwrap();

    let err = sup.send_command("list").await.unwrap_err();
    assert!(matches!(err, CommandError::ChannelClosed), "{:?}", err);

    // stop은 broken pipe를 기록하고 TERM 단계로 넘어감
    let outcome = sup.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, StopOutcome::Terminated);
}

#[tokio::test]
async fn stalled_input_cannot_wedge_command_or_stop() {
    // stdin을 전혀 읽지 않는 서버: 파이프 버퍼가 가득 차면 쓰기가 멈춤
    let script = r#"echo "Done (0.1s)! For help, type \"help\""; exec sleep 60"#;
    let opts = SupervisorOptions {
        command_write_timeout: Duration::from_millis(300),
        ..options()
    };
    let readiness = ReadinessDetector::default().with_poll_interval(Duration::from_millis(20));
    let mut sup = ProcessSupervisor::new(opts, readiness);
    sup.start(&sh(script)).await.unwrap();

    let oversized = "x".repeat(256 * 1024);
    let sent = tokio::time::timeout(Duration::from_secs(3), sup.send_command(&oversized))
        .await
        .expect("send_command did not return");
    assert!(matches!(sent, Err(CommandError::Timeout(_))), "{:?}", sent);

    // 입력이 닫혔으므로 save/stop은 건너뛰고 TERM으로 종료
    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(10), sup.stop(Duration::from_millis(500)))
        .await
        .expect("stop did not return")
        .unwrap();
    assert_eq!(outcome, StopOutcome::Terminated);
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
    assert!(sup.pid().is_none());
}

#[tokio::test]
async fn ring_restarts_on_each_generation() {
    let mut sup = supervisor(Duration::from_secs(5));
    sup.start(&sh(READY_SERVER)).await.unwrap();
    sup.send_command("first-generation").await.unwrap();
    wait_for_line(&sup, "got: first-generation").await;
    sup.stop(Duration::from_secs(5)).await.unwrap();

    sup.start(&sh(READY_SERVER)).await.unwrap();
    assert!(!sup.output().any_line(|l| l.contains("first-generation")));
    sup.stop(Duration::from_secs(5)).await.unwrap();
}
