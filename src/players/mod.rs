//! Whitelist, ban lists and operators, stored in the server's own JSON files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const WHITELIST_FILE: &str = "whitelist.json";
pub const BANNED_PLAYERS_FILE: &str = "banned-players.json";
pub const BANNED_IPS_FILE: &str = "banned-ips.json";
pub const OPS_FILE: &str = "ops.json";

pub const DEFAULT_BAN_REASON: &str = "Banned by an operator";
pub const FOREVER: &str = "forever";

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("'{0}' is already listed")]
    AlreadyListed(String),
    #[error("'{0}' is not listed")]
    NotListed(String),
    #[error("operator level must be 1-4, got {0}")]
    InvalidLevel(u8),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    #[serde(default)]
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedPlayer {
    #[serde(default)]
    pub uuid: String,
    pub name: String,
    pub created: String,
    pub source: String,
    pub expires: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedIp {
    pub ip: String,
    pub created: String,
    pub source: String,
    pub expires: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    #[serde(default)]
    pub uuid: String,
    pub name: String,
    pub level: u8,
    #[serde(default)]
    pub bypasses_player_limit: bool,
}

/// Entries are matched by this key; player names compare case-insensitively.
trait Keyed {
    fn matches(&self, key: &str) -> bool;
}

impl Keyed for WhitelistEntry {
    fn matches(&self, key: &str) -> bool {
        self.name.eq_ignore_ascii_case(key)
    }
}

impl Keyed for BannedPlayer {
    fn matches(&self, key: &str) -> bool {
        self.name.eq_ignore_ascii_case(key)
    }
}

impl Keyed for BannedIp {
    fn matches(&self, key: &str) -> bool {
        self.ip == key
    }
}

impl Keyed for Operator {
    fn matches(&self, key: &str) -> bool {
        self.name.eq_ignore_ascii_case(key)
    }
}

/// Same timestamp layout the server itself writes.
fn created_now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S %z").to_string()
}

pub struct PlayerManager {
    server_dir: PathBuf,
}

impl PlayerManager {
    pub fn new(server_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_dir: server_dir.into(),
        }
    }

    pub fn server_dir(&self) -> &Path {
        &self.server_dir
    }

    fn load<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, PlayerError> {
        let path = self.server_dir.join(file);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(PlayerError::Io { path, source }),
        };
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&data).map_err(|source| PlayerError::Json { path, source })
    }

    fn save<T: Serialize>(&self, file: &str, entries: &[T]) -> Result<(), PlayerError> {
        let path = self.server_dir.join(file);
        let data = serde_json::to_string_pretty(entries).map_err(|source| PlayerError::Json {
            path: path.clone(),
            source,
        })?;
        // 임시 파일에 쓴 뒤 교체
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|source| PlayerError::Io { path, source })
    }

    fn insert<T>(&self, file: &str, key: &str, entry: T) -> Result<(), PlayerError>
    where
        T: Keyed + Serialize + DeserializeOwned,
    {
        let mut entries: Vec<T> = self.load(file)?;
        if entries.iter().any(|e| e.matches(key)) {
            return Err(PlayerError::AlreadyListed(key.to_string()));
        }
        entries.push(entry);
        self.save(file, &entries)?;
        tracing::info!("Added '{}' to {}", key, file);
        Ok(())
    }

    fn remove<T>(&self, file: &str, key: &str) -> Result<(), PlayerError>
    where
        T: Keyed + Serialize + DeserializeOwned,
    {
        let mut entries: Vec<T> = self.load(file)?;
        let before = entries.len();
        entries.retain(|e| !e.matches(key));
        if entries.len() == before {
            return Err(PlayerError::NotListed(key.to_string()));
        }
        self.save(file, &entries)?;
        tracing::info!("Removed '{}' from {}", key, file);
        Ok(())
    }

    pub fn whitelist(&self) -> Result<Vec<WhitelistEntry>, PlayerError> {
        self.load(WHITELIST_FILE)
    }

    pub fn add_to_whitelist(&self, name: &str, uuid: Option<&str>) -> Result<(), PlayerError> {
        let entry = WhitelistEntry {
            uuid: uuid.unwrap_or_default().to_string(),
            name: name.to_string(),
        };
        self.insert(WHITELIST_FILE, name, entry)
    }

    pub fn remove_from_whitelist(&self, name: &str) -> Result<(), PlayerError> {
        self.remove::<WhitelistEntry>(WHITELIST_FILE, name)
    }

    pub fn banned_players(&self) -> Result<Vec<BannedPlayer>, PlayerError> {
        self.load(BANNED_PLAYERS_FILE)
    }

    pub fn ban_player(
        &self,
        name: &str,
        reason: Option<&str>,
        expires: Option<&str>,
    ) -> Result<(), PlayerError> {
        let entry = BannedPlayer {
            uuid: String::new(),
            name: name.to_string(),
            created: created_now(),
            source: "Server".to_string(),
            expires: expires.unwrap_or(FOREVER).to_string(),
            reason: reason.unwrap_or(DEFAULT_BAN_REASON).to_string(),
        };
        self.insert(BANNED_PLAYERS_FILE, name, entry)
    }

    pub fn unban_player(&self, name: &str) -> Result<(), PlayerError> {
        self.remove::<BannedPlayer>(BANNED_PLAYERS_FILE, name)
    }

    pub fn banned_ips(&self) -> Result<Vec<BannedIp>, PlayerError> {
        self.load(BANNED_IPS_FILE)
    }

    pub fn ban_ip(&self, ip: &str, reason: Option<&str>, expires: Option<&str>) -> Result<(), PlayerError> {
        let entry = BannedIp {
            ip: ip.to_string(),
            created: created_now(),
            source: "Server".to_string(),
            expires: expires.unwrap_or(FOREVER).to_string(),
            reason: reason.unwrap_or(DEFAULT_BAN_REASON).to_string(),
        };
        self.insert(BANNED_IPS_FILE, ip, entry)
    }

    pub fn unban_ip(&self, ip: &str) -> Result<(), PlayerError> {
        self.remove::<BannedIp>(BANNED_IPS_FILE, ip)
    }

    pub fn ops(&self) -> Result<Vec<Operator>, PlayerError> {
        self.load(OPS_FILE)
    }

    pub fn add_op(&self, name: &str, level: u8, bypasses_player_limit: bool) -> Result<(), PlayerError> {
        if !(1..=4).contains(&level) {
            return Err(PlayerError::InvalidLevel(level));
        }
        let entry = Operator {
            uuid: String::new(),
            name: name.to_string(),
            level,
            bypasses_player_limit,
        };
        self.insert(OPS_FILE, name, entry)
    }

    pub fn remove_op(&self, name: &str) -> Result<(), PlayerError> {
        self.remove::<Operator>(OPS_FILE, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Join,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerEvent {
    pub player: String,
    pub action: Activity,
    /// Text before the first `[` of the log line.
    pub timestamp: String,
}

/// Join/leave events from console lines, in line order.
pub fn extract_activity<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<PlayerEvent> {
    let (Ok(join), Ok(left)) = (
        Regex::new(r"(\w+)\[.+\] logged in"),
        Regex::new(r"(\w+) left the game"),
    ) else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for line in lines {
        let (caps, action) = if let Some(c) = join.captures(line) {
            (c, Activity::Join)
        } else if let Some(c) = left.captures(line) {
            (c, Activity::Left)
        } else {
            continue;
        };
        let timestamp = line.split('[').next().unwrap_or_default().trim().to_string();
        events.push(PlayerEvent {
            player: caps[1].to_string(),
            action,
            timestamp,
        });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, PlayerManager) {
        let dir = tempfile::tempdir().unwrap();
        let pm = PlayerManager::new(dir.path());
        (dir, pm)
    }

    #[test]
    fn missing_files_are_empty_lists() {
        let (_dir, pm) = manager();
        assert!(pm.whitelist().unwrap().is_empty());
        assert!(pm.banned_players().unwrap().is_empty());
        assert!(pm.banned_ips().unwrap().is_empty());
        assert!(pm.ops().unwrap().is_empty());
    }

    #[test]
    fn whitelist_is_case_insensitive() {
        let (_dir, pm) = manager();
        pm.add_to_whitelist("Notch", Some("069a79f4-44e9-4726-a5be-fca90e38aaf5")).unwrap();
        assert!(matches!(
            pm.add_to_whitelist("notch", None),
            Err(PlayerError::AlreadyListed(_))
        ));
        assert_eq!(pm.whitelist().unwrap().len(), 1);

        pm.remove_from_whitelist("NOTCH").unwrap();
        assert!(pm.whitelist().unwrap().is_empty());
        assert!(matches!(pm.remove_from_whitelist("Notch"), Err(PlayerError::NotListed(_))));
    }

    #[test]
    fn ban_entries_use_server_format() {
        let (dir, pm) = manager();
        pm.ban_player("Griefer", None, None).unwrap();
        pm.ban_ip("10.0.0.7", Some("spam"), Some("2030-01-01 00:00:00 +0000")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(BANNED_PLAYERS_FILE)).unwrap()).unwrap();
        let ban = &raw[0];
        assert_eq!(ban["name"], "Griefer");
        assert_eq!(ban["source"], "Server");
        assert_eq!(ban["expires"], "forever");
        assert_eq!(ban["reason"], DEFAULT_BAN_REASON);
        assert!(ban["created"].as_str().unwrap().len() >= 19);

        let ips = pm.banned_ips().unwrap();
        assert_eq!(ips[0].reason, "spam");
        pm.unban_ip("10.0.0.7").unwrap();
        assert!(matches!(pm.unban_ip("10.0.0.7"), Err(PlayerError::NotListed(_))));
    }

    #[test]
    fn ops_validate_level_and_serialize_camel_case() {
        let (dir, pm) = manager();
        assert!(matches!(pm.add_op("Admin", 0, false), Err(PlayerError::InvalidLevel(0))));
        assert!(matches!(pm.add_op("Admin", 5, false), Err(PlayerError::InvalidLevel(5))));
        pm.add_op("Admin", 4, true).unwrap();

        let raw = fs::read_to_string(dir.path().join(OPS_FILE)).unwrap();
        assert!(raw.contains("\"bypassesPlayerLimit\": true"));
        assert_eq!(pm.ops().unwrap()[0].level, 4);
        pm.remove_op("admin").unwrap();
    }

    #[test]
    fn reads_files_written_by_the_server() {
        let (dir, pm) = manager();
        fs::write(
            dir.path().join(OPS_FILE),
            r#"[{"uuid":"853c80ef-3c37-49fd-aa49-938b674adae6","name":"jeb_","level":4,"bypassesPlayerLimit":false}]"#,
        )
        .unwrap();
        let ops = pm.ops().unwrap();
        assert_eq!(ops[0].name, "jeb_");
        assert!(matches!(pm.add_op("JEB_", 2, false), Err(PlayerError::AlreadyListed(_))));
    }

    #[test]
    fn malformed_file_is_not_overwritten() {
        let (dir, pm) = manager();
        let path = dir.path().join(WHITELIST_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(pm.add_to_whitelist("Steve", None), Err(PlayerError::Json { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn activity_from_console_lines() {
        let lines = [
            "[12:00:01] [Server thread/INFO]: Steve[/127.0.0.1:50312] logged in with entity id 42",
            "[12:00:05] [Server thread/INFO]: <Steve> hello",
            "[12:03:10] [Server thread/INFO]: Steve left the game",
        ];
        let events = extract_activity(lines.iter().copied());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].player, "Steve");
        assert_eq!(events[0].action, Activity::Join);
        assert_eq!(events[1].action, Activity::Left);
    }
}
