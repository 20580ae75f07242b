//! The crate's error type.
//!
//! Typed rather than opaque, because its callers (the in-game command
//! layer) need to tell "no such backup" apart from "the store is broken"
//! apart from "someone else is already running a job" to decide how to
//! respond.

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no backup with id {0}")]
    BackupNotFound(String),

    #[error("corrupt backup store at {path}: {reason}")]
    CorruptStore { path: Utf8PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed index or config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backup {0} is part of a broken chain: {1}")]
    ChainBroken(String, String),

    #[error("job \"{running}\" is already in progress")]
    JobBusy { running: &'static str },

    #[error("malformed ignore pattern {0:?}")]
    MalformedPattern(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
