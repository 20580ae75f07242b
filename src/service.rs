//! `Service`: composes a [`Manager`], [`JobCoordinator`], save-trigger
//! [`Registry`], and [`Config`] into the engine's public API: create,
//! restore, remove, list, and query backups, plus cleaning up over-limit
//! Fulls.
//!
//! Mode is auto-selected via rolling counters when the caller doesn't pick
//! one explicitly, and a backup's creation can bracket the live server with
//! pre/post commands and a save-trigger wait before it snapshots anything.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use camino::Utf8Path;
use tracing::info;

use crate::backup::{Backup, BackupMode, OUTDATE_UNPROTECTED};
use crate::confirm::{ConfirmRegistry, Guarded};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::JobCoordinator;
use crate::manager::{now_minutes, Manager};
use crate::trigger::Registry;

/// Rolling counters used to auto-select a backup's mode, mirroring
/// `SMBConfig.cache`'s `incremental_count`/`differential_count`.
#[derive(Default)]
struct ModeCounters {
    incremental: AtomicU32,
    differential: AtomicU32,
}

pub struct Service {
    manager: Manager,
    jobs: JobCoordinator,
    triggers: Registry,
    config: Config,
    counters: ModeCounters,
    restore_confirms: ConfirmRegistry,
}

#[derive(Debug, Clone, Copy)]
pub struct BackupStatus {
    pub mode: BackupMode,
    pub outdate: u64,
    pub file_count: usize,
}

impl Service {
    pub fn new(store_path: impl AsRef<Utf8Path>, config: Config) -> Result<Service> {
        Ok(Service {
            manager: Manager::open(store_path.as_ref())?,
            jobs: JobCoordinator::new(),
            triggers: Registry::new(),
            config,
            counters: ModeCounters::default(),
            restore_confirms: ConfirmRegistry::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Feed one server log line to the save-trigger registry. The external
    /// log adapter is required to call this for every line it sees; a
    /// pending [`make_backup`](Self::make_backup) wait only ever resumes
    /// through this path.
    pub fn on_log_line(&self, line: &str) {
        self.triggers.on_log_line(line);
    }

    /// Choose the mode for the next backup when the caller didn't request
    /// one explicitly: walk incremental up to its limit, then differential
    /// up to its limit, then fall back to Full; reset the relevant counters
    /// whenever a higher tier fires.
    fn auto_select_mode(&self) -> BackupMode {
        if self.manager.get_last().ok().flatten().is_none() {
            return BackupMode::Full;
        }
        let incremental = self.counters.incremental.load(Ordering::Relaxed);
        if incremental < self.config.incremental_backup_limit {
            self.counters.incremental.fetch_add(1, Ordering::Relaxed);
            return BackupMode::Incremental;
        }
        let differential = self.counters.differential.load(Ordering::Relaxed);
        if differential < self.config.differential_backup_limit {
            self.counters.differential.fetch_add(1, Ordering::Relaxed);
            return BackupMode::Differential;
        }
        BackupMode::Full
    }

    fn reset_counters_for(&self, mode: BackupMode) {
        match mode {
            BackupMode::Full => {
                self.counters.incremental.store(0, Ordering::Relaxed);
                self.counters.differential.store(0, Ordering::Relaxed);
            }
            BackupMode::Differential => {
                self.counters.incremental.store(0, Ordering::Relaxed);
            }
            BackupMode::Incremental => {}
        }
    }

    /// Create and persist a backup.
    ///
    /// `timed` controls the outdate: an automatic/timed backup gets the
    /// next entry of `full_backup_protect_times` (converted to an absolute
    /// minute), everything else gets the "never protected" sentinel.
    /// `run_before`/`run_after` are invoked (synchronously, by the caller's
    /// adapter) to bracket the snapshot with the configured server
    /// commands; when a non-empty `start_backup_trigger_info` is
    /// configured, the snapshot waits for the registry to confirm the
    /// server has actually flushed before building the tree.
    pub fn make_backup(
        &self,
        comment: String,
        mode: Option<BackupMode>,
        live_base: &Utf8Path,
        timed: bool,
        wait_for_save: Option<crate::trigger::TriggerPattern>,
        mut run_before: impl FnMut() -> Result<()>,
        mut run_after: impl FnMut() -> Result<()>,
    ) -> Result<Arc<Backup>> {
        self.jobs.begin("make backup", false)?;
        let result = (|| {
            let mode = mode.unwrap_or_else(|| self.auto_select_mode());
            self.reset_counters_for(mode);

            let outdate = if timed {
                let minutes = self.config.next_protect_time();
                if minutes > 0 {
                    now_minutes() + minutes
                } else {
                    0
                }
            } else {
                OUTDATE_UNPROTECTED
            };

            if let Some(pattern) = wait_for_save {
                self.jobs.ping();
                let rx = self.triggers.register(&pattern)?;
                run_before()?;
                rx.blocking_recv().map_err(|_| Error::CorruptStore {
                    path: camino::Utf8PathBuf::new(),
                    reason: "save-trigger dropped before firing".into(),
                })?;
                self.jobs.after();
            } else {
                run_before()?;
            }

            let backup = self.manager.create(
                mode,
                comment,
                outdate,
                live_base,
                &self.config.backup_needs,
                &self.config.backup_ignores,
            )?;

            run_after()?;

            if mode == BackupMode::Full
                && self.config.full_backup_limit > 0
                && self.manager.list(None)?.iter().filter(|b| b.mode == BackupMode::Full).count()
                    > self.config.full_backup_limit as usize
            {
                info!("full backup count over limit, cleaning up");
                self.jobs.swap(|| {
                    self.jobs.take_over("clean up backup");
                    let result = self.clean_body();
                    self.jobs.after();
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "automatic clean up after backup failed");
                    }
                });
            }

            Ok(backup)
        })();
        self.jobs.after();
        result
    }

    /// Restore `id` into `target`, gated by an abortable one-second
    /// countdown of `config.restore_timeout` seconds. `actor` identifies
    /// who can cancel it via [`Service::abort_restore`] before it fires;
    /// `on_tick` is called once per remaining second so the caller's
    /// adapter can broadcast a countdown warning. Returns `Ok(false)`
    /// without touching `target` if aborted before the countdown reaches
    /// zero; `restore_timeout == 0` restores immediately with no countdown.
    pub fn restore_backup(
        &self,
        actor: &str,
        id: &str,
        target: &Utf8Path,
        mut on_tick: impl FnMut(u64),
    ) -> Result<bool> {
        self.jobs.begin("restore", true)?;
        let result = (|| {
            let backup = self.manager.load(id)?;
            let token = Guarded::new(&self.restore_confirms, self.restore_confirms.register(actor));

            let mut remaining = self.config.restore_timeout;
            while remaining > 0 {
                if token.is_aborted() {
                    return Ok(false);
                }
                on_tick(remaining);
                std::thread::sleep(std::time::Duration::from_secs(1));
                remaining -= 1;
            }
            if token.is_aborted() {
                return Ok(false);
            }

            self.restore(&backup, target)?;
            Ok(true)
        })();
        self.jobs.after();
        result
    }

    /// Abort a pending restore countdown registered for `actor`. Returns
    /// whether a countdown was actually pending.
    pub fn abort_restore(&self, actor: &str) -> bool {
        self.restore_confirms.abort(actor)
    }

    fn restore(&self, backup: &Backup, target: &Utf8Path) -> Result<()> {
        if !backup.is_saved() {
            return Err(Error::ChainBroken(
                backup.id.clone(),
                "backup was never saved".into(),
            ));
        }
        let filter = crate::filter::Filter::compile(&self.config.backup_ignores)?;
        for name in &self.config.backup_needs {
            let effective = self.manager.get_total_files(&backup.id, &[name])?;
            clear_tree_rel(target, name, &filter)?;
            for (path, entry) in effective {
                if let crate::entry::Entry::File { .. } = &entry {
                    entry.restore_file(&target.join(path))?;
                }
            }
        }
        Ok(())
    }

    pub fn remove_backup(&self, id: &str) -> Result<Vec<String>> {
        self.jobs.run("remove", || self.manager.remove(id))
    }

    /// Read-only, but still goes through the job coordinator (blocking
    /// until idle rather than rejecting) so a concurrent `clean` can't race
    /// a removal out from under an in-flight listing. A bare `ping()` would
    /// only join an *already-running* job and silently no-op when the
    /// coordinator is idle, which is exactly the common case for a
    /// standalone listing — so this blocks in via `begin` instead.
    pub fn list_backups(&self, limit: Option<usize>) -> Result<Vec<Arc<Backup>>> {
        self.jobs.begin("list backups", true)?;
        let result = self.manager.list(limit);
        self.jobs.after();
        result
    }

    pub fn query_backup(&self, id: &str) -> Result<BackupStatus> {
        self.jobs.begin("query backup", true)?;
        let result = (|| {
            let backup = self.manager.load(id)?;
            let file_count = self.manager.get_total_files(id, &[])?.len();
            Ok(BackupStatus {
                mode: backup.mode,
                outdate: backup.outdate,
                file_count,
            })
        })();
        self.jobs.after();
        result
    }

    /// Evict the oldest outdated Fulls until at most `full_backup_limit`
    /// remain. Refuses (without panicking) when the limit is less than one.
    pub fn clean(&self) -> Result<Vec<String>> {
        self.jobs.run("clean up backup", || self.clean_body())
    }

    /// The body of `clean`, factored out so the automatic clean up
    /// triggered from inside `make_backup` can run it after a `swap`
    /// hand-off instead of going through `run`'s own `begin`.
    fn clean_body(&self) -> Result<Vec<String>> {
        if self.config.full_backup_limit < 1 {
            return Err(Error::CorruptStore {
                path: camino::Utf8PathBuf::new(),
                reason: "full_backup_limit is less than one, cannot clean up".into(),
            });
        }
        let mut removed_total = Vec::new();
        loop {
            let fulln_count = {
                let index = self.manager.list(None)?;
                index.iter().filter(|b| b.mode == BackupMode::Full).count()
            };
            if fulln_count <= self.config.full_backup_limit as usize {
                break;
            }
            let Some(id) = self.oldest_outdated()? else {
                break;
            };
            removed_total.extend(self.manager.remove(&id)?);
        }
        Ok(removed_total)
    }

    fn oldest_outdated(&self) -> Result<Option<String>> {
        // The Manager owns the Index privately; re-derive the head id by
        // asking it to peek, via a minimal read-only accessor.
        self.manager.peek_outdated(now_minutes())
    }
}

fn clear_tree_rel(base: &Utf8Path, rel: &str, filter: &crate::filter::Filter) -> Result<()> {
    let dir = if rel.is_empty() {
        base.to_owned()
    } else {
        base.join(rel)
    };
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !filter.keep(rel, name) {
            continue;
        }
        let child_rel = if rel.is_empty() {
            name.to_owned()
        } else {
            format!("{rel}/{name}")
        };
        let path = entry.path();
        if path.is_dir() {
            clear_tree_rel(base, &child_rel, filter)?;
            let child_dir = base.join(&child_rel);
            if child_dir.read_dir().map(|mut d| d.next().is_none()).unwrap_or(false) {
                let _ = std::fs::remove_dir(&child_dir);
            }
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
