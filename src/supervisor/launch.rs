use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use super::error::StartError;
use crate::config::ServerConfig;

/// Everything needed to spawn one server process.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Files that must exist before spawning (e.g. the server jar).
    /// Relative paths are resolved against `working_dir`.
    pub required_files: Vec<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            required_files: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn require(mut self, path: impl Into<PathBuf>) -> Self {
        self.required_files.push(path.into());
        self
    }

    /// `java -Xms<min> -Xmx<max> [jvm_args] -jar <jar> [nogui] [server_args]`
    pub fn java_server(server: &ServerConfig) -> Self {
        let mut spec = Self::new(&server.java_path, &server.working_dir)
            .arg(format!("-Xms{}", server.min_ram))
            .arg(format!("-Xmx{}", server.max_ram))
            .args(server.jvm_args.iter().cloned())
            .arg("-jar")
            .arg(&server.jar)
            .require(&server.jar);
        for (key, value) in &server.env {
            spec = spec.env(key, value);
        }
        if server.nogui {
            spec = spec.arg("nogui");
        }
        spec.args(server.server_args.iter().cloned())
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    pub(crate) fn check_required_files(&self) -> Result<(), StartError> {
        for file in &self.required_files {
            let resolved = self.resolve(file);
            if !resolved.is_file() {
                tracing::error!("Required server file not found: {}", resolved.display());
                return Err(StartError::MissingFile(resolved));
            }
        }
        Ok(())
    }

    /// stdin, stdout and stderr are all piped; the child dies with its handle.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        apply_creation_flags(&mut cmd);
        cmd
    }
}

/// Hide the console window of the child on Windows.
#[cfg(target_os = "windows")]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}
