//! The save-trigger protocol: a one-shot callback fired by an external log
//! adapter the first time a server log line fullmatches the configured
//! pattern.
//!
//! At most one registration can be pending at a time; a second registration
//! attempt while one is outstanding is an error rather than a silently
//! dropped callback.

use std::sync::Mutex;

use regex::Regex;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Compiles `start_backup_trigger_info` once; `test` fullmatches a log
/// line against it the way `SMBConfig.test_backup_trigger` does.
pub struct TriggerPattern(Regex);

impl TriggerPattern {
    pub fn compile(pattern: &str) -> Result<TriggerPattern> {
        if pattern.is_empty() {
            return Err(Error::MalformedPattern(pattern.to_owned()));
        }
        let anchored = format!("^(?:{pattern})$");
        Regex::new(&anchored)
            .map(TriggerPattern)
            .map_err(|_| Error::MalformedPattern(pattern.to_owned()))
    }

    pub fn test(&self, line: &str) -> bool {
        self.0.is_match(line)
    }
}

/// Holds at most one pending callback. The log adapter calls [`Registry::on_log_line`]
/// for every server log line it sees; when a callback is pending and the
/// line matches, it fires exactly once.
#[derive(Default)]
pub struct Registry {
    pending: Mutex<Option<(TriggerSlot, oneshot::Sender<()>)>>,
}

struct TriggerSlot {
    pattern: Regex,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register a one-shot waiter for the next log line matching `pattern`.
    /// Returns the receiver half; the caller awaits it to know the server
    /// has confirmed its save. Fails if a registration is already pending.
    pub fn register(&self, pattern: &TriggerPattern) -> Result<oneshot::Receiver<()>> {
        let mut slot = self.pending.lock().unwrap();
        if slot.is_some() {
            return Err(Error::CorruptStore {
                path: camino::Utf8PathBuf::new(),
                reason: "a save-trigger is already pending".into(),
            });
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some((
            TriggerSlot {
                pattern: pattern.0.clone(),
            },
            tx,
        ));
        Ok(rx)
    }

    /// Feed one server log line through the registry. If a callback is
    /// pending and this line fullmatches its pattern, fire it and clear
    /// the slot.
    pub fn on_log_line(&self, line: &str) {
        let mut slot = self.pending.lock().unwrap();
        let fire = matches!(&*slot, Some((t, _)) if t.pattern.is_match(line));
        if fire {
            let (_, tx) = slot.take().unwrap();
            trace!(%line, "save-trigger matched");
            if tx.send(()).is_err() {
                warn!("save-trigger fired but receiver was already dropped");
            }
        }
    }
}
