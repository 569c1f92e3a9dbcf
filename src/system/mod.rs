//! Host probing: ports, addresses, OS/Java details and server process stats.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use sysinfo::{Pid, System};

pub const EXTERNAL_IP_URL: &str = "https://api.ipify.org";

/// TCP connect probe. Resolution failures count as closed.
pub fn check_port_open(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            tracing::debug!("Cannot resolve {}:{}: {}", host, port, e);
            return false;
        }
    };
    addrs.iter().any(|addr| connect_with_timeout(addr, timeout))
}

fn connect_with_timeout(addr: &SocketAddr, timeout: Duration) -> bool {
    let socket = match Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP)) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("Failed to create socket: {}", e);
            return false;
        }
    };
    socket.connect_timeout(&(*addr).into(), timeout).is_ok()
}

pub async fn check_port_open_async(host: &str, port: u16, timeout: Duration) -> bool {
    let host = host.to_string();
    tokio::task::spawn_blocking(move || check_port_open(&host, port, timeout))
        .await
        .unwrap_or(false)
}

/// Address of the interface that routes to the internet. No packet is sent.
pub async fn local_ip() -> anyhow::Result<IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    Ok(socket.local_addr()?.ip())
}

pub async fn external_ip() -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let body = client
        .get(EXTERNAL_IP_URL)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let ip = body.trim();
    ip.parse::<IpAddr>()
        .with_context(|| format!("unexpected response from {}: {:?}", EXTERNAL_IP_URL, ip))?;
    Ok(ip.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub os_version: String,
    pub kernel_version: String,
    pub arch: String,
    pub hostname: String,
    pub cpu_count: usize,
    pub total_memory: u64,
    pub used_memory: u64,
}

pub fn system_info() -> SystemInfo {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();
    let unknown = || "unknown".to_string();
    SystemInfo {
        os: System::name().unwrap_or_else(unknown),
        os_version: System::os_version().unwrap_or_else(unknown),
        kernel_version: System::kernel_version().unwrap_or_else(unknown),
        arch: std::env::consts::ARCH.to_string(),
        hostname: System::host_name().unwrap_or_else(unknown),
        cpu_count: sys.cpus().len(),
        total_memory: sys.total_memory(),
        used_memory: sys.used_memory(),
    }
}

/// Resource usage of the supervised server process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub pid: u32,
    pub memory: u64,
    pub cpu_usage: f32,
    pub run_time_secs: u64,
}

pub fn process_stats(pid: u32) -> Option<ProcessStats> {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return None;
    }
    sys.process(pid).map(|p| ProcessStats {
        pid: pid.as_u32(),
        memory: p.memory(),
        cpu_usage: p.cpu_usage(),
        run_time_secs: p.run_time(),
    })
}

// sysinfo는 프로세스 테이블을 동기적으로 스캔하므로 blocking 풀에서 실행
pub async fn process_stats_async(pid: u32) -> Option<ProcessStats> {
    tokio::task::spawn_blocking(move || process_stats(pid))
        .await
        .unwrap_or(None)
}

pub async fn system_info_async() -> anyhow::Result<SystemInfo> {
    Ok(tokio::task::spawn_blocking(system_info).await?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JavaVersion {
    pub version: String,
    pub implementation: String,
}

/// `java -version` prints to stderr, e.g. `openjdk version "21.0.2" 2024-01-16`.
pub fn parse_java_version(output: &str) -> Option<JavaVersion> {
    let re = Regex::new(r#"version "([^"]+)""#).ok()?;
    let first = output.lines().find(|l| re.is_match(l))?;
    let version = re.captures(first)?.get(1)?.as_str().to_string();
    let lower = output.to_lowercase();
    let implementation = if lower.contains("openjdk") {
        "OpenJDK"
    } else if lower.contains("java(tm)") || first.starts_with("java version") {
        "Oracle Java"
    } else {
        "unknown"
    };
    Some(JavaVersion {
        version,
        implementation: implementation.to_string(),
    })
}

pub async fn java_version(java_path: &str) -> anyhow::Result<JavaVersion> {
    let output = tokio::process::Command::new(java_path)
        .arg("-version")
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run '{} -version'", java_path))?;
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stderr),
        String::from_utf8_lossy(&output.stdout)
    );
    parse_java_version(&text).with_context(|| format!("could not parse Java version from {:?}", text.trim()))
}

/// `key=value` lines; blank lines and `#` comments are skipped.
pub fn parse_server_properties(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub fn read_server_properties(path: &Path) -> std::io::Result<BTreeMap<String, String>> {
    Ok(parse_server_properties(&std::fs::read_to_string(path)?))
}
