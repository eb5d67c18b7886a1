//! Configuration contracts.
//!
//! `configure()`/`configure_server()` are external collaborators in the
//! original design — only the fields they populate are specified. This
//! module defines those fields as typed structs plus a [`ConfigSource`]
//! trait; [`TomlConfigSource`] is a minimal concrete loader so the daemon
//! is runnable without a bespoke config format.

use crate::error::Error;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

/// Populated by `configure_server()`: daemon-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub server_pidfile: PathBuf,
    #[serde(default = "default_log_priority")]
    pub server_log_priority: String,
    #[serde(default = "default_session_timeout")]
    pub server_session_timeout: u64,
    pub server_gid: libc::gid_t,
}

fn default_log_priority() -> String {
    "info".to_string()
}

fn default_session_timeout() -> u64 {
    60
}

/// One entry of the `change_rlimit` table: names an `RLIMIT_*` resource
/// and its configured hard/soft ceilings.
#[derive(Debug, Clone, Deserialize)]
pub struct RlimitEntry {
    pub name: String,
    pub hard: Option<u64>,
    pub soft: Option<u64>,
}

/// Populated by `configure()`: per-caller limits and toggles applied by
/// a session server after privilege drop.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CallerConfig {
    pub change_uid1: Option<libc::uid_t>,
    pub change_uid2: Option<libc::uid_t>,
    pub change_gid1: Option<libc::gid_t>,
    pub change_gid2: Option<libc::gid_t>,
    #[serde(default)]
    pub change_umask: Option<u32>,
    #[serde(default)]
    pub change_nice: Option<i32>,
    #[serde(default)]
    pub change_rlimit: Vec<RlimitEntry>,
    #[serde(default)]
    pub share_caller_network: bool,
    #[serde(default)]
    pub share_ipc: bool,
    #[serde(default)]
    pub allowed_mountpoints: Vec<String>,
    #[serde(default)]
    pub chroot_prefix_list: Vec<PathBuf>,
    pub chroot_prefix_path: Option<PathBuf>,
    #[serde(default)]
    pub use_pty: bool,
    #[serde(default)]
    pub allow_tty_devices: bool,
    #[serde(default)]
    pub x11_enabled: bool,
    pub x11_display: Option<String>,
}

/// Loads broker configuration from an external source.
///
/// Only the contract matters to the rest of the broker: given a caller
/// uid, return the limits that apply to it. The storage format is an
/// external collaborator.
pub trait ConfigSource: Send + Sync {
    fn load_server(&self) -> Result<ServerConfig, Error>;
    fn load_caller(&self, caller_uid: libc::uid_t) -> Result<CallerConfig, Error>;
}

/// TOML-backed [`ConfigSource`]: one `[server]` table plus a
/// `[caller.<uid>]` table per configured caller, falling back to
/// `[caller.default]` when no uid-specific table exists.
pub struct TomlConfigSource {
    document: toml::Value,
}

impl TomlConfigSource {
    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::resource(format!("reading {}: {}", path.display(), err)))?;
        let document = text
            .parse::<toml::Value>()
            .map_err(|err| Error::validation(format!("parsing {}: {}", path.display(), err)))?;
        Ok(Self { document })
    }

    fn callers(&self) -> HashMap<String, toml::Value> {
        self.document
            .get("caller")
            .and_then(toml::Value::as_table)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect()
    }
}

impl ConfigSource for TomlConfigSource {
    fn load_server(&self) -> Result<ServerConfig, Error> {
        let table = self
            .document
            .get("server")
            .ok_or_else(|| Error::validation("missing [server] table"))?;
        table
            .clone()
            .try_into()
            .map_err(|err| Error::validation(format!("invalid [server] table: {}", err)))
    }

    fn load_caller(&self, caller_uid: libc::uid_t) -> Result<CallerConfig, Error> {
        let callers = self.callers();
        let table = callers
            .get(&caller_uid.to_string())
            .or_else(|| callers.get("default"));

        match table {
            Some(table) => table
                .clone()
                .try_into()
                .map_err(|err| Error::validation(format!("invalid [caller] table: {}", err))),
            None => Ok(CallerConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_server_and_default_caller_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hasher-priv.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            server_pidfile = "/run/hasher-privd.pid"
            server_gid = 34

            [caller.default]
            change_uid1 = 5001
            change_gid1 = 5001
            use_pty = true
            "#,
        )
        .unwrap();

        let source = TomlConfigSource::load(&path).unwrap();
        let server = source.load_server().unwrap();
        assert_eq!(server.server_gid, 34);
        assert_eq!(server.server_session_timeout, 60);

        let caller = source.load_caller(9999).unwrap();
        assert_eq!(caller.change_uid1, Some(5001));
        assert!(caller.use_pty);
    }

    #[test]
    fn missing_caller_table_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hasher-priv.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            server_pidfile = "/run/hasher-privd.pid"
            server_gid = 34
            "#,
        )
        .unwrap();

        let source = TomlConfigSource::load(&path).unwrap();
        let caller = source.load_caller(1000).unwrap();
        assert!(caller.change_rlimit.is_empty());
        assert!(!caller.use_pty);
    }
}
