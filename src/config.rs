//! The engine's typed configuration surface.
//!
//! This module only parses a TOML string into a `Config`; discovering the
//! config file's path on disk is the command layer's job, not this crate's.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_derive::Deserialize;

use crate::error::Result;

fn def_incremental_limit() -> u32 {
    2
}
fn def_differential_limit() -> u32 {
    4
}
fn def_full_limit() -> u32 {
    8
}
fn def_protect_times() -> Vec<u64> {
    vec![21600, 10080, 1440, 4320, 1440, 0, 4320, 1440]
}
fn def_backup_interval() -> u64 {
    3600
}
fn def_restore_timeout() -> u64 {
    30
}
fn def_backup_path() -> String {
    "./backups".to_string()
}
fn def_backup_needs() -> Vec<String> {
    vec!["world".to_string()]
}
fn def_backup_ignores() -> Vec<String> {
    vec!["session.lock".to_string()]
}
fn def_befor_backup() -> Vec<String> {
    vec!["save-off".to_string(), "save-all flush".to_string()]
}
fn def_after_backup() -> Vec<String> {
    vec!["save-on".to_string()]
}
fn def_trigger() -> String {
    r"Saved the (?:game|world)".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "def_incremental_limit")]
    pub incremental_backup_limit: u32,
    #[serde(default = "def_differential_limit")]
    pub differential_backup_limit: u32,
    #[serde(default = "def_full_limit")]
    pub full_backup_limit: u32,
    /// Cyclic schedule (minutes) assigning the outdate to each Full
    /// created while timed; `0` entries mean "unprotected".
    #[serde(default = "def_protect_times")]
    pub full_backup_protect_times: Vec<u64>,
    #[serde(default = "def_backup_interval")]
    pub backup_interval: u64,
    #[serde(default = "def_restore_timeout")]
    pub restore_timeout: u64,
    #[serde(default = "def_backup_path")]
    pub backup_path: String,
    #[serde(default = "def_backup_needs")]
    pub backup_needs: Vec<String>,
    #[serde(default = "def_backup_ignores")]
    pub backup_ignores: Vec<String>,
    #[serde(default = "def_befor_backup")]
    pub befor_backup: Vec<String>,
    #[serde(default = "def_after_backup")]
    pub after_backup: Vec<String>,
    #[serde(default = "def_trigger")]
    pub start_backup_trigger_info: String,

    /// Position in `full_backup_protect_times`, advanced on every call to
    /// [`Config::next_protect_time`]. Not (de)serialized; it's runtime
    /// state, not a configuration option.
    #[serde(skip, default)]
    protect_cursor: ProtectCursor,
}

#[derive(Debug, Default)]
struct ProtectCursor(AtomicUsize);

impl Config {
    /// Advance and return the next entry of `full_backup_protect_times`,
    /// cycling back to the start once exhausted. Mirrors
    /// `SMBConfig.get_next_protect_time`.
    pub fn next_protect_time(&self) -> u64 {
        if self.full_backup_protect_times.is_empty() {
            return 0;
        }
        let i = self.protect_cursor.0.fetch_add(1, Ordering::Relaxed) % self.full_backup_protect_times.len();
        self.full_backup_protect_times[i]
    }

    pub fn from_toml(s: &str) -> Result<Config> {
        Ok(toml::from_str(s)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            incremental_backup_limit: def_incremental_limit(),
            differential_backup_limit: def_differential_limit(),
            full_backup_limit: def_full_limit(),
            full_backup_protect_times: def_protect_times(),
            backup_interval: def_backup_interval(),
            restore_timeout: def_restore_timeout(),
            backup_path: def_backup_path(),
            backup_needs: def_backup_needs(),
            backup_ignores: def_backup_ignores(),
            befor_backup: def_befor_backup(),
            after_backup: def_after_backup(),
            start_backup_trigger_info: def_trigger(),
            protect_cursor: ProtectCursor::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_the_original_plugin() {
        let c = Config::default();
        assert_eq!(c.incremental_backup_limit, 2);
        assert_eq!(c.differential_backup_limit, 4);
        assert_eq!(c.full_backup_limit, 8);
        assert_eq!(c.backup_needs, vec!["world".to_string()]);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let c = Config::from_toml("full_backup_limit = 3\n").unwrap();
        assert_eq!(c.full_backup_limit, 3);
        assert_eq!(c.incremental_backup_limit, 2);
    }

    #[test]
    fn protect_time_cycles() {
        let c = Config {
            full_backup_protect_times: vec![10, 20, 30],
            ..Config::default()
        };
        assert_eq!(c.next_protect_time(), 10);
        assert_eq!(c.next_protect_time(), 20);
        assert_eq!(c.next_protect_time(), 30);
        assert_eq!(c.next_protect_time(), 10);
    }
}
