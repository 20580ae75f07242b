//! `Backup`: a single persisted snapshot and its save/load/restore/remove
//! operations.
//!
//! A backup is written to its own directory; any failure partway through a
//! write rolls the whole directory back rather than leaving a half-written
//! snapshot on disk.

use std::collections::BTreeMap;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, instrument};

use crate::entry::{Entry, Marker};
use crate::error::{Error, Result};
use crate::filter::Filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Incremental,
    Differential,
}

impl BackupMode {
    fn to_byte(self) -> u8 {
        match self {
            BackupMode::Full => 0,
            BackupMode::Incremental => 1,
            BackupMode::Differential => 2,
        }
    }

    fn from_byte(b: u8, path: &Utf8Path) -> Result<BackupMode> {
        match b {
            0 => Ok(BackupMode::Full),
            1 => Ok(BackupMode::Incremental),
            2 => Ok(BackupMode::Differential),
            other => Err(Error::CorruptStore {
                path: path.to_owned(),
                reason: format!("unknown backup mode byte {other}"),
            }),
        }
    }
}

/// The sentinel meaning "this Full is never protected, and is cleanup
/// eligible as soon as anything else needs its slot". Sorts before every
/// real timestamp, so an unprotected Full always sits at the head of the
/// outdate rotation.
pub const OUTDATE_UNPROTECTED: u64 = 0;

#[derive(Debug, Clone)]
pub struct Backup {
    pub id: String,
    pub mode: BackupMode,
    pub comment: String,
    pub outdate: u64,
    pub predecessor: Option<String>,
    pub root: BTreeMap<String, Entry>,
    saved: bool,
}

pub fn new_id() -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64;
    ms_to_id(ms)
}

pub fn ms_to_id(ms: u64) -> String {
    format!("0x{ms:x}")
}

pub fn id_to_ms(id: &str) -> Result<u64> {
    let hex = id.strip_prefix("0x").unwrap_or(id);
    u64::from_str_radix(hex, 16).map_err(|_| Error::CorruptStore {
        path: Utf8PathBuf::new(),
        reason: format!("backup id {id:?} isn't hex"),
    })
}

impl Backup {
    /// Build a new backup from the live filesystem.
    ///
    /// `predecessor` is the immediate prior backup (`index.last`), stored
    /// as this backup's predecessor pointer and used as the chain anchor;
    /// it is `None` for a Full backup. `previous_root` is what entries are
    /// actually diffed against — not just the prior backup's own recorded
    /// delta, but the chain-merged effective tree (the caller's job to
    /// resolve, since only it can walk the chain across the store):
    /// `predecessor`'s effective tree for Incremental, the nearest Full
    /// ancestor's for Differential (trivially that Full's own root, since a
    /// Full has no ancestors to merge), and unused for Full. The caller
    /// (`Manager`) is also responsible for coercing the mode to Full when
    /// there is no existing backup to diff against.
    #[instrument(skip(live_base, needs, filter, predecessor, previous_root))]
    pub fn create(
        mode: BackupMode,
        comment: String,
        outdate: u64,
        live_base: &Utf8Path,
        needs: &[String],
        filter: &Filter,
        predecessor: Option<&Backup>,
        previous_root: Option<&BTreeMap<String, Entry>>,
    ) -> Result<Backup> {
        let id = new_id();
        if let Some(pred) = predecessor {
            if pred.id == id {
                return Err(Error::CorruptStore {
                    path: Utf8PathBuf::new(),
                    reason: "new backup id collided with its predecessor".into(),
                });
            }
        }

        let prev_root: Option<&BTreeMap<String, Entry>> = if mode == BackupMode::Full {
            None
        } else {
            previous_root
        };

        let mut root = BTreeMap::new();
        for name in needs {
            if !filter.keep("", name) {
                continue;
            }
            let live_path = live_base.join(name);
            let prev_entry = prev_root.and_then(|r| r.get(name));
            if let Some(entry) = Entry::create(&live_path, filter, "", name, prev_entry)? {
                root.insert(name.clone(), entry);
            }
        }

        info!(%id, ?mode, entries = root.len(), "built backup");

        Ok(Backup {
            id,
            mode,
            comment,
            outdate,
            predecessor: predecessor.map(|p| p.id.clone()),
            root,
            saved: false,
        })
    }

    pub fn z_index(&self, ancestors: &[Backup]) -> u32 {
        // `ancestors` is the chain from self's immediate predecessor up to
        // (and including) the nearest Full, in that order, as resolved by
        // the Manager.
        let mut depth = 0;
        for a in ancestors {
            if a.mode == BackupMode::Full {
                break;
            }
            depth += 1;
        }
        depth
    }

    /// Persist this backup under `store_path/{id}/`. On any write failure
    /// the partial directory is removed before the error propagates.
    #[instrument(skip(self, store_path), fields(id = %self.id))]
    pub fn save(&mut self, store_path: &Utf8Path) -> Result<()> {
        let dir = store_path.join(&self.id);
        if let Err(e) = self.write_unchecked(&dir) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        self.saved = true;
        debug!(path = %dir, "backup saved");
        Ok(())
    }

    fn write_unchecked(&self, dir: &Utf8Path) -> Result<()> {
        fs::create_dir(dir)?;

        let header_path = dir.join("0");
        let mut header = Vec::new();
        header.push(self.mode.to_byte());
        let pred_ms = self
            .predecessor
            .as_deref()
            .map(id_to_ms)
            .transpose()?
            .unwrap_or(0);
        header.extend_from_slice(&pred_ms.to_be_bytes());
        header.extend_from_slice(&self.outdate.to_be_bytes());
        let comment_bytes = self.comment.as_bytes();
        let clen: u16 = comment_bytes
            .len()
            .try_into()
            .map_err(|_| Error::CorruptStore {
                path: dir.to_owned(),
                reason: "comment too long".into(),
            })?;
        header.extend_from_slice(&clen.to_be_bytes());
        header.extend_from_slice(comment_bytes);
        fs::write(&header_path, header)?;

        for (name, entry) in &self.root {
            entry.save(dir, name)?;
        }
        Ok(())
    }

    /// Load a backup (and its full entry tree) from `store_path/{id}/`.
    #[instrument(skip(store_path))]
    pub fn load(store_path: &Utf8Path, id: &str) -> Result<Backup> {
        let dir = store_path.join(id);
        if !dir.is_dir() {
            return Err(Error::BackupNotFound(id.to_owned()));
        }
        let header_path = dir.join("0");
        let header = fs::read(&header_path)?;
        if header.len() < 1 + 8 + 8 + 2 {
            return Err(Error::CorruptStore {
                path: header_path,
                reason: "truncated backup header".into(),
            });
        }
        let mode = BackupMode::from_byte(header[0], &header_path)?;
        let pred_ms = u64::from_be_bytes(header[1..9].try_into().unwrap());
        let outdate = u64::from_be_bytes(header[9..17].try_into().unwrap());
        let clen = u16::from_be_bytes([header[17], header[18]]) as usize;
        let comment_bytes = header
            .get(19..19 + clen)
            .ok_or_else(|| Error::CorruptStore {
                path: header_path.clone(),
                reason: "truncated comment".into(),
            })?;
        let comment =
            String::from_utf8(comment_bytes.to_vec()).map_err(|_| Error::CorruptStore {
                path: header_path.clone(),
                reason: "comment isn't valid UTF-8".into(),
            })?;
        let predecessor = if pred_ms == 0 {
            None
        } else {
            Some(ms_to_id(pred_ms))
        };
        let mut root = BTreeMap::new();
        for dirent in fs::read_dir(&dir)? {
            let dirent = dirent?;
            let fname = dirent.file_name();
            let Some(fname) = fname.to_str() else {
                continue;
            };
            if fname == "0" {
                continue;
            }
            let entry_path: Utf8PathBuf =
                dirent.path().try_into().map_err(|_| Error::CorruptStore {
                    path: dir.clone(),
                    reason: "non-UTF-8 path in store".into(),
                })?;
            if let Some(stem) = fname.strip_suffix(".F") {
                root.insert(stem.to_owned(), Entry::load_file(&entry_path)?);
            } else if let Some(stem) = fname.strip_suffix(".D") {
                root.insert(stem.to_owned(), Entry::load_dir(&entry_path)?);
            }
        }

        Ok(Backup {
            id: id.to_owned(),
            mode,
            comment,
            outdate,
            predecessor,
            root,
            saved: true,
        })
    }

    pub fn remove(&self, store_path: &Utf8Path) -> Result<()> {
        let dir = store_path.join(&self.id);
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Resolve a path within this backup's own tree (not following
    /// predecessors). `None` if absent.
    pub fn get_local<'a>(&'a self, path: &[&str]) -> Option<&'a Entry> {
        let (first, rest) = path.split_first()?;
        let mut entry = self.root.get(*first)?;
        for component in rest {
            entry = entry.child(component)?;
        }
        Some(entry)
    }

    /// Collect every live (non-tombstoned) file under `prefix` in this
    /// backup's own tree, without consulting ancestors. Returned paths are
    /// relative to the backup root.
    pub fn local_total_files(&self, prefix: &[&str]) -> BTreeMap<Utf8PathBuf, Entry> {
        let mut out = BTreeMap::new();
        let start: Vec<(Utf8PathBuf, &Entry)> = if prefix.is_empty() {
            self.root
                .iter()
                .map(|(n, e)| (Utf8PathBuf::from(n), e))
                .collect()
        } else {
            match self.get_local(prefix) {
                Some(e) => vec![(Utf8PathBuf::from(prefix.join("/")), e)],
                None => vec![],
            }
        };
        let mut stack = start;
        while let Some((path, entry)) = stack.pop() {
            match entry {
                Entry::File {
                    marker: Marker::Update,
                    ..
                } => {
                    out.insert(path, entry.clone());
                }
                Entry::Directory {
                    marker: Marker::Update,
                    children,
                    ..
                } => {
                    for (name, child) in children {
                        stack.push((path.join(name), child));
                    }
                }
                _ => {}
            }
        }
        out
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }
}
