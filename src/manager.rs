//! `Manager`: owns a store directory and its [`Index`], and is the sole
//! path through which backups are created, loaded, listed, or removed.
//!
//! Loaded [`Backup`]s are cached by `std::sync::Weak` values keyed by id in
//! an `FxHashMap`, rather than `Rc` or a pinned `HashMap` that would keep
//! every historical snapshot resident for the life of the process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::FxHashMap;
use tracing::{debug, info, instrument};

use crate::backup::{Backup, BackupMode, OUTDATE_UNPROTECTED};
use crate::counters::{self, Op};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::index::Index;

pub struct Manager {
    store_path: Utf8PathBuf,
    index: Mutex<Index>,
    cache: Mutex<FxHashMap<String, Weak<Backup>>>,
}

impl Manager {
    pub fn open(store_path: impl Into<Utf8PathBuf>) -> Result<Manager> {
        let store_path = store_path.into();
        std::fs::create_dir_all(&store_path)?;
        let index = Index::load(&store_path)?;
        counters::bump(Op::IndexLoad);
        Ok(Manager {
            store_path,
            index: Mutex::new(index),
            cache: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn store_path(&self) -> &Utf8Path {
        &self.store_path
    }

    pub fn save_config(&self) -> Result<()> {
        self.index.lock().unwrap().save(&self.store_path)
    }

    /// Resolve a backup by id, consulting the weak cache before touching
    /// disk.
    #[instrument(skip(self))]
    pub fn load(&self, id: &str) -> Result<Arc<Backup>> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(weak) = cache.get(id) {
                if let Some(strong) = weak.upgrade() {
                    counters::bump(Op::BackupCacheHit);
                    return Ok(strong);
                }
                cache.remove(id);
                counters::bump(Op::BackupCacheEviction);
            }
        }
        counters::bump(Op::BackupCacheMiss);
        debug!(%id, "loading backup from disk");
        let backup = Arc::new(Backup::load(&self.store_path, id)?);
        self.cache
            .lock()
            .unwrap()
            .insert(id.to_owned(), Arc::downgrade(&backup));
        Ok(backup)
    }

    pub fn get_last(&self) -> Result<Option<Arc<Backup>>> {
        let last = self.index.lock().unwrap().last.clone();
        last.map(|id| self.load(&id)).transpose()
    }

    /// The id of the oldest protected Full whose protection has expired,
    /// if any, without removing it from the index.
    pub fn peek_outdated(&self, now_minutes: u64) -> Result<Option<String>> {
        Ok(self
            .index
            .lock()
            .unwrap()
            .peek_outdated(now_minutes)
            .map(str::to_owned))
    }

    pub fn list(&self, limit: Option<usize>) -> Result<Vec<Arc<Backup>>> {
        let ids = self.index.lock().unwrap().list.clone();
        let slice_start = match limit {
            Some(n) if n < ids.len() => ids.len() - n,
            _ => 0,
        };
        ids[slice_start..].iter().map(|id| self.load(id)).collect()
    }

    /// Walk predecessors from `start` (exclusive) up to and including the
    /// nearest Full, returning them innermost-first. Used both for
    /// Differential's diff base and for `z_index`.
    fn nearest_full(&self, start: &Backup) -> Result<Option<Arc<Backup>>> {
        let mut current = start.predecessor.clone();
        while let Some(id) = current {
            let b = self.load(&id)?;
            if b.mode == BackupMode::Full {
                return Ok(Some(b));
            }
            current = b.predecessor.clone();
        }
        Ok(None)
    }

    /// The chain-merged effective tree `backup` represents: `backup`'s own
    /// root applied on top of its predecessor's effective tree, recursively
    /// back to the nearest Full. Unlike `backup.root` alone, this carries
    /// forward names an intervening backup's own delta never mentions —
    /// the view the *next* backup in the chain needs to diff against.
    fn effective_tree(&self, backup: &Backup) -> Result<BTreeMap<String, crate::entry::Entry>> {
        let mut base = match (&backup.mode, &backup.predecessor) {
            (BackupMode::Full, _) | (_, None) => BTreeMap::new(),
            (_, Some(pred_id)) => {
                let pred = self.load(pred_id)?;
                self.effective_tree(&pred)?
            }
        };
        crate::entry::merge_tree(&mut base, &backup.root);
        Ok(base)
    }

    /// Build, save, and register a new backup. `mode` is coerced to Full
    /// when there is no existing backup to diff against.
    #[instrument(skip(self, live_base, needs, ignores))]
    pub fn create(
        &self,
        mode: BackupMode,
        comment: String,
        outdate: u64,
        live_base: &Utf8Path,
        needs: &[String],
        ignores: &[String],
    ) -> Result<Arc<Backup>> {
        let filter = Filter::compile(ignores)?;
        let predecessor = self.get_last()?;

        let mode = if predecessor.is_none() {
            BackupMode::Full
        } else {
            mode
        };

        let diff_base = match mode {
            BackupMode::Full => None,
            BackupMode::Incremental => predecessor.clone(),
            BackupMode::Differential => match predecessor.as_deref() {
                Some(p) if p.mode == BackupMode::Full => predecessor.clone(),
                Some(p) => self.nearest_full(p)?,
                None => None,
            },
        };

        // A Full is always chain-root: it never records a predecessor, even
        // when one exists in the store.
        let stored_predecessor = if mode == BackupMode::Full {
            None
        } else {
            predecessor.as_deref()
        };

        // The chain-merged effective tree of diff_base, not its own raw
        // `root` delta — a name diff_base's own recorded delta doesn't
        // mention must still be inherited (or tombstoned) from further
        // back in the chain.
        let previous_root = diff_base
            .as_deref()
            .map(|b| self.effective_tree(b))
            .transpose()?;

        let mut backup = Backup::create(
            mode,
            comment,
            outdate,
            live_base,
            needs,
            &filter,
            stored_predecessor,
            previous_root.as_ref(),
        )?;
        backup.save(&self.store_path)?;

        let is_full = backup.mode == BackupMode::Full;
        {
            let mut index = self.index.lock().unwrap();
            index.append(&backup.id, backup.predecessor.as_deref(), is_full, outdate);
            index.save(&self.store_path)?;
        }

        let arc = Arc::new(backup);
        self.cache
            .lock()
            .unwrap()
            .insert(arc.id.clone(), Arc::downgrade(&arc));
        info!(id = %arc.id, "registered backup");
        Ok(arc)
    }

    /// Remove a backup and every transitive descendant that chains
    /// through it.
    #[instrument(skip(self))]
    pub fn remove(&self, id: &str) -> Result<Vec<String>> {
        // Pull the whole chain of predecessor links once so the "is this
        // id a descendant of that one" check the index needs doesn't have
        // to hit disk repeatedly.
        let mut predecessors: BTreeMap<String, Option<String>> = BTreeMap::new();
        {
            let ids = self.index.lock().unwrap().list.clone();
            for existing in ids {
                let b = self.load(&existing)?;
                predecessors.insert(existing, b.predecessor.clone());
            }
        }
        let is_descendant = |candidate: &str, ancestor: &str| -> bool {
            let mut cur = candidate.to_owned();
            loop {
                match predecessors.get(&cur) {
                    Some(Some(p)) if p == ancestor => return true,
                    Some(Some(p)) => cur = p.clone(),
                    _ => return false,
                }
            }
        };

        let removed = {
            let mut index = self.index.lock().unwrap();
            let removed = index.remove(id, is_descendant);
            index.save(&self.store_path)?;
            removed
        };

        if removed.is_empty() {
            return Err(Error::BackupNotFound(id.to_owned()));
        }

        let mut cache = self.cache.lock().unwrap();
        for removed_id in &removed {
            cache.remove(removed_id);
        }
        drop(cache);

        for removed_id in &removed {
            let dir = self.store_path.join(removed_id);
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        info!(count = removed.len(), "removed backup chain");
        Ok(removed)
    }

    /// Resolve an entry at `path` in backup `id`, following the
    /// predecessor chain as needed (respecting tombstones).
    pub fn get(&self, id: &str, path: &[&str]) -> Result<Option<crate::entry::Entry>> {
        let backup = self.load(id)?;
        self.get_in(&backup, path)
    }

    fn get_in(&self, backup: &Backup, path: &[&str]) -> Result<Option<crate::entry::Entry>> {
        if let Some(entry) = backup.get_local(path) {
            return Ok(Some(entry.clone()));
        }
        if backup.mode == BackupMode::Full {
            return Ok(None);
        }
        match &backup.predecessor {
            Some(pred_id) => {
                let pred = self.load(pred_id)?;
                self.get_in(&pred, path)
            }
            None => Ok(None),
        }
    }

    /// The full effective file set reachable from `id` under `prefix`,
    /// unioned with ancestors and tombstones applied.
    pub fn get_total_files(
        &self,
        id: &str,
        prefix: &[&str],
    ) -> Result<BTreeMap<Utf8PathBuf, crate::entry::Entry>> {
        let backup = self.load(id)?;
        self.total_files_in(&backup, prefix)
    }

    fn total_files_in(
        &self,
        backup: &Backup,
        prefix: &[&str],
    ) -> Result<BTreeMap<Utf8PathBuf, crate::entry::Entry>> {
        let mut files = if backup.mode != BackupMode::Full {
            match &backup.predecessor {
                Some(pred_id) => {
                    let pred = self.load(pred_id)?;
                    self.total_files_in(&pred, prefix)?
                }
                None => BTreeMap::new(),
            }
        } else {
            BTreeMap::new()
        };

        for (path, entry) in backup.local_total_files(prefix) {
            files.insert(path, entry);
        }

        // Apply tombstones recorded directly on this backup: any path this
        // backup marks Remove must not appear, even if an ancestor has it.
        self.strip_tombstones(backup, prefix, &mut files);

        Ok(files)
    }

    fn strip_tombstones(
        &self,
        backup: &Backup,
        prefix: &[&str],
        files: &mut BTreeMap<Utf8PathBuf, crate::entry::Entry>,
    ) {
        use crate::entry::{Entry, Marker};

        fn walk(
            path: Utf8PathBuf,
            entry: &Entry,
            files: &mut BTreeMap<Utf8PathBuf, Entry>,
        ) {
            match entry {
                Entry::File {
                    marker: Marker::Remove,
                    ..
                } => {
                    files.remove(&path);
                }
                Entry::Directory {
                    marker: Marker::Remove,
                    ..
                } => {
                    files.retain(|p, _| !p.starts_with(&path));
                }
                Entry::Directory { children, .. } => {
                    for (name, child) in children {
                        walk(path.join(name), child, files);
                    }
                }
                Entry::File { .. } => {}
            }
        }

        let roots: Vec<(Utf8PathBuf, &Entry)> = if prefix.is_empty() {
            backup
                .root
                .iter()
                .map(|(n, e)| (Utf8PathBuf::from(n), e))
                .collect()
        } else {
            match backup.get_local(prefix) {
                Some(e) => vec![(Utf8PathBuf::from(prefix.join("/")), e)],
                None => vec![],
            }
        };
        for (path, entry) in roots {
            walk(path, entry, files);
        }
    }
}

pub fn now_minutes() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
        / 60
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_tree(live: &Utf8Path, contents: &[(&str, &str)]) {
        for (path, data) in contents {
            let full = live.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, data).unwrap();
        }
    }

    #[test]
    fn create_first_backup_is_coerced_to_full() {
        let tmp = tempdir().unwrap();
        let live: Utf8PathBuf = tmp.path().join("live").try_into().unwrap();
        write_tree(&live, &[("world/a.txt", "hi")]);
        let store: Utf8PathBuf = tmp.path().join("store").try_into().unwrap();

        let mgr = Manager::open(&store).unwrap();
        let b = mgr
            .create(
                BackupMode::Incremental,
                "first".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();
        assert_eq!(b.mode, BackupMode::Full);
    }

    #[test]
    fn chain_and_remove_cascades() {
        let tmp = tempdir().unwrap();
        let live: Utf8PathBuf = tmp.path().join("live").try_into().unwrap();
        write_tree(&live, &[("world/a.txt", "hi")]);
        let store: Utf8PathBuf = tmp.path().join("store").try_into().unwrap();

        let mgr = Manager::open(&store).unwrap();
        let full = mgr
            .create(
                BackupMode::Full,
                "f1".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();
        write_tree(&live, &[("world/a.txt", "ho")]);
        let _incr = mgr
            .create(
                BackupMode::Incremental,
                "i1".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();

        let removed = mgr.remove(&full.id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(mgr.get_last().unwrap().is_none());
    }

    #[test]
    fn get_total_files_follows_chain_and_tombstones() {
        let tmp = tempdir().unwrap();
        let live: Utf8PathBuf = tmp.path().join("live").try_into().unwrap();
        write_tree(&live, &[("world/a.txt", "hi"), ("world/b.txt", "yo")]);
        let store: Utf8PathBuf = tmp.path().join("store").try_into().unwrap();

        let mgr = Manager::open(&store).unwrap();
        let _full = mgr
            .create(
                BackupMode::Full,
                "f1".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();

        fs::remove_file(live.join("world").join("b.txt")).unwrap();
        let incr = mgr
            .create(
                BackupMode::Incremental,
                "i1".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();

        let files = mgr.get_total_files(&incr.id, &[]).unwrap();
        let paths: Vec<_> = files.keys().map(|p| p.as_str().to_owned()).collect();
        assert!(paths.contains(&"world/a.txt".to_string()));
        assert!(!paths.contains(&"world/b.txt".to_string()));
    }

    #[test]
    fn tombstone_survives_an_intermediate_incremental_that_does_not_mention_it() {
        // world/{a,b} in the Full; i1 only touches a; i2 deletes b. i2's own
        // predecessor (i1) never recorded b at all, so b's tombstone has to
        // come from merging all the way back to the Full, not from i1 alone.
        let tmp = tempdir().unwrap();
        let live: Utf8PathBuf = tmp.path().join("live").try_into().unwrap();
        write_tree(&live, &[("world/a.txt", "hi"), ("world/b.txt", "yo")]);
        let store: Utf8PathBuf = tmp.path().join("store").try_into().unwrap();

        let mgr = Manager::open(&store).unwrap();
        let _full = mgr
            .create(
                BackupMode::Full,
                "f1".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();

        write_tree(&live, &[("world/a.txt", "ho")]);
        let _i1 = mgr
            .create(
                BackupMode::Incremental,
                "i1".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();

        fs::remove_file(live.join("world").join("b.txt")).unwrap();
        let i2 = mgr
            .create(
                BackupMode::Incremental,
                "i2".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();

        let files = mgr.get_total_files(&i2.id, &[]).unwrap();
        let paths: Vec<_> = files.keys().map(|p| p.as_str().to_owned()).collect();
        assert!(paths.contains(&"world/a.txt".to_string()));
        assert!(!paths.contains(&"world/b.txt".to_string()));
    }

    #[test]
    fn a_second_full_never_records_a_predecessor() {
        let tmp = tempdir().unwrap();
        let live: Utf8PathBuf = tmp.path().join("live").try_into().unwrap();
        write_tree(&live, &[("world/a.txt", "hi")]);
        let store: Utf8PathBuf = tmp.path().join("store").try_into().unwrap();

        let mgr = Manager::open(&store).unwrap();
        let _first = mgr
            .create(
                BackupMode::Full,
                "f1".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();
        let second = mgr
            .create(
                BackupMode::Full,
                "f2".into(),
                OUTDATE_UNPROTECTED,
                &live,
                &["world".to_string()],
                &[],
            )
            .unwrap();

        assert!(second.predecessor.is_none());
    }
}
