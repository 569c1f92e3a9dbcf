use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::supervisor::launch::LaunchSpec;
use crate::supervisor::readiness::{ContainsAll, PatternSentinel, ReadinessDetector};
use crate::supervisor::SupervisorOptions;

pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";
pub const CONFIG_PATH_ENV: &str = "WARDEN_CONFIG";

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GlobalConfig {
    pub ipc: IpcConfig,
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub backup: BackupConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct IpcConfig {
    pub listen: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:57474".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub java_path: String,
    pub jar: String,
    /// 서버 설치 디렉토리 (자식 프로세스의 작업 디렉토리)
    pub working_dir: PathBuf,
    pub min_ram: String,
    pub max_ram: String,
    pub jvm_args: Vec<String>,
    pub server_args: Vec<String>,
    /// 자식 프로세스에 추가로 넘길 환경 변수 (`[server.env]`)
    pub env: BTreeMap<String, String>,
    pub nogui: bool,
    pub port: u16,
    pub autostart: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            java_path: "java".to_string(),
            jar: "server.jar".to_string(),
            working_dir: PathBuf::from("."),
            min_ram: "1G".to_string(),
            max_ram: "2G".to_string(),
            jvm_args: Vec::new(),
            server_args: Vec::new(),
            env: BTreeMap::new(),
            nogui: true,
            port: 25565,
            autostart: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    pub log_buffer_size: usize,
    /// Empty string disables the save step.
    pub save_command: String,
    pub stop_command: String,
    pub save_delay_secs: u64,
    pub grace_period_secs: u64,
    pub poll_interval_ms: u64,
    pub terminate_wait_secs: u64,
    pub kill_wait_secs: u64,
    /// Upper bound for one write onto the server's stdin.
    pub command_write_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub ready_pattern: Option<String>,
    pub restart_delay_secs: u64,
    pub backup_settle_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_buffer_size: 1000,
            save_command: "save-all".to_string(),
            stop_command: "stop".to_string(),
            save_delay_secs: 2,
            grace_period_secs: 30,
            poll_interval_ms: 1000,
            terminate_wait_secs: 5,
            kill_wait_secs: 5,
            command_write_timeout_secs: 5,
            startup_timeout_secs: 60,
            ready_pattern: None,
            restart_delay_secs: 5,
            backup_settle_secs: 5,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct BackupConfig {
    pub world_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            world_dir: PathBuf::from("world"),
            backup_dir: PathBuf::from("backups"),
        }
    }
}

impl GlobalConfig {
    /// `$WARDEN_CONFIG` 또는 `config/global.toml`. 파일이 없으면 기본값.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Resolve a path against the server working directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.server.working_dir.join(path)
        }
    }

    pub fn world_dir(&self) -> PathBuf {
        self.resolve(&self.backup.world_dir)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(&self.backup.backup_dir)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.supervisor.grace_period_secs)
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::java_server(&self.server)
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        let s = &self.supervisor;
        let save_command = match s.save_command.trim() {
            "" => None,
            cmd => Some(cmd.to_string()),
        };
        SupervisorOptions {
            log_buffer_size: s.log_buffer_size,
            save_command,
            stop_command: s.stop_command.clone(),
            save_delay: Duration::from_secs(s.save_delay_secs),
            poll_interval: Duration::from_millis(s.poll_interval_ms.max(1)),
            terminate_wait: Duration::from_secs(s.terminate_wait_secs),
            kill_wait: Duration::from_secs(s.kill_wait_secs),
            command_write_timeout: Duration::from_secs(s.command_write_timeout_secs.max(1)),
            restart_delay: Duration::from_secs(s.restart_delay_secs),
            backup_settle: Duration::from_secs(s.backup_settle_secs),
            world_dir: self.world_dir(),
        }
    }

    pub fn readiness_detector(&self) -> anyhow::Result<ReadinessDetector> {
        let s = &self.supervisor;
        let detector = match &s.ready_pattern {
            Some(pattern) => ReadinessDetector::new(
                PatternSentinel::new(pattern)
                    .with_context(|| format!("invalid ready_pattern {:?}", pattern))?,
            ),
            None => ReadinessDetector::new(ContainsAll::minecraft()),
        };
        Ok(detector
            .with_timeout(Duration::from_secs(s.startup_timeout_secs))
            .with_poll_interval(Duration::from_millis(s.poll_interval_ms)))
    }
}
