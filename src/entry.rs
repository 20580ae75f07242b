//! Entries: the nodes of a backup's snapshot tree.
//!
//! An entry is either a `File` or a `Directory`, each carrying a
//! modification marker (`Update` or `Remove`) relative to whatever ancestor
//! snapshot it's layered on top of. A `Remove` marker is a tombstone: a
//! `File` marked `Remove` has no hash or content; a `Directory` marked
//! `Remove` has no children.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, Write};

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::{Error, Result};
use crate::filter::Filter;

pub const HASH_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Update,
    Remove,
}

impl Marker {
    fn to_byte(self) -> u8 {
        match self {
            Marker::Update => 1,
            Marker::Remove => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Marker> {
        match b {
            1 => Ok(Marker::Update),
            2 => Ok(Marker::Remove),
            other => Err(Error::CorruptStore {
                path: Utf8PathBuf::new(),
                reason: format!("unknown entry marker byte {other}"),
            }),
        }
    }
}

/// Where a file entry's bytes actually live before it's saved, or after
/// it's loaded back from the store.
#[derive(Debug, Clone)]
pub enum Content {
    /// Bytes captured in memory at build time, not yet written to disk.
    Memory(Vec<u8>),
    /// Bytes already on disk: the `.F` file, and the byte offset where
    /// content begins (past the marker, mode, and hash).
    Stored { path: Utf8PathBuf, offset: u64 },
    /// A tombstone; no bytes.
    None,
}

#[derive(Debug, Clone)]
pub enum Entry {
    File {
        mode: u16,
        marker: Marker,
        hash: Option<[u8; HASH_LEN]>,
        content: Content,
    },
    Directory {
        mode: u16,
        marker: Marker,
        children: BTreeMap<String, Entry>,
    },
}

impl Entry {
    pub fn marker(&self) -> Marker {
        match self {
            Entry::File { marker, .. } => *marker,
            Entry::Directory { marker, .. } => *marker,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory { .. })
    }

    /// Look up a single path component among this entry's children.
    /// Only meaningful on `Directory` entries; `File`s have none.
    pub fn child(&self, name: &str) -> Option<&Entry> {
        match self {
            Entry::Directory { children, .. } => children.get(name),
            Entry::File { .. } => None,
        }
    }

    /// Build an entry for `live_path` (which may not exist), diffed against
    /// `previous`, the entry that occupied this logical position in the
    /// predecessor snapshot. Returns `Ok(None)` when the entry is unchanged
    /// and should be inherited from the ancestor chain rather than stored.
    pub fn create(
        live_path: &Utf8Path,
        filter: &Filter,
        dir_rel: &str,
        name: &str,
        previous: Option<&Entry>,
    ) -> Result<Option<Entry>> {
        let meta = match fs::symlink_metadata(live_path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(match previous {
                    Some(_) => Some(Entry::File {
                        mode: 0,
                        marker: Marker::Remove,
                        hash: None,
                        content: Content::None,
                    }),
                    None => None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            Self::create_dir(live_path, filter, dir_rel, name, previous, &meta)
        } else {
            Self::create_file(live_path, previous, &meta)
        }
    }

    fn create_file(
        live_path: &Utf8Path,
        previous: Option<&Entry>,
        meta: &fs::Metadata,
    ) -> Result<Option<Entry>> {
        let mode = unix_mode(meta);

        if let Some(Entry::File {
            mode: prev_mode,
            marker: Marker::Update,
            hash: Some(prev_hash),
            ..
        }) = previous
        {
            if *prev_mode == mode {
                let hash = hash_file(live_path)?;
                if hash == *prev_hash {
                    trace!(%live_path, "unchanged file, inheriting");
                    return Ok(None);
                }
            }
        }

        let mut f = fs::File::open(live_path)?;
        let mut buf = Vec::with_capacity(meta.len() as usize);
        f.read_to_end(&mut buf)?;
        let hash = Sha256::digest(&buf).into();

        Ok(Some(Entry::File {
            mode,
            marker: Marker::Update,
            hash: Some(hash),
            content: Content::Memory(buf),
        }))
    }

    fn create_dir(
        live_path: &Utf8Path,
        filter: &Filter,
        dir_rel: &str,
        name: &str,
        previous: Option<&Entry>,
        meta: &fs::Metadata,
    ) -> Result<Option<Entry>> {
        let mode = unix_mode(meta);
        let prev_children: Option<&BTreeMap<String, Entry>> = match previous {
            Some(Entry::Directory { children, .. }) => Some(children),
            _ => None,
        };

        let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        if live_path.is_dir() {
            for entry in fs::read_dir(live_path)? {
                let entry = entry?;
                let fname = entry.file_name();
                if let Some(s) = fname.to_str() {
                    names.insert(s.to_owned());
                }
            }
        }
        if let Some(children) = prev_children {
            names.extend(children.keys().cloned());
        }

        let child_dir_rel = if dir_rel.is_empty() {
            name.to_owned()
        } else {
            format!("{dir_rel}/{name}")
        };

        let mut children = BTreeMap::new();
        for child_name in &names {
            if !filter.keep(&child_dir_rel, child_name) {
                continue;
            }
            let child_prev = prev_children.and_then(|c| c.get(child_name));
            let child_live = live_path.join(child_name);
            if let Some(child_entry) =
                Entry::create(&child_live, filter, &child_dir_rel, child_name, child_prev)?
            {
                children.insert(child_name.clone(), child_entry);
            }
        }

        if children.is_empty() && prev_children.is_some() {
            trace!(%live_path, "unchanged directory, inheriting");
            return Ok(None);
        }

        Ok(Some(Entry::Directory {
            mode,
            marker: Marker::Update,
            children,
        }))
    }

    /// Write this entry under `parent_dir` as `{name}.F` or `{name}.D`.
    pub fn save(&self, parent_dir: &Utf8Path, name: &str) -> Result<()> {
        match self {
            Entry::File {
                mode,
                marker,
                hash,
                content,
            } => {
                let path = parent_dir.join(format!("{name}.F"));
                let mut f = fs::File::create(&path)?;
                f.write_all(&[marker.to_byte()])?;
                if *marker != Marker::Remove {
                    f.write_all(&mode.to_be_bytes())?;
                    f.write_all(hash.as_ref().expect("Update file entry must carry a hash"))?;
                    match content {
                        Content::Memory(bytes) => f.write_all(bytes)?,
                        Content::Stored { path: src, offset } => {
                            let mut src_file = fs::File::open(src)?;
                            src_file.seek_relative(*offset as i64)?;
                            std::io::copy(&mut src_file, &mut f)?;
                        }
                        Content::None => unreachable!("Update file entry with no content"),
                    }
                }
                Ok(())
            }
            Entry::Directory {
                mode,
                marker,
                children,
            } => {
                let path = parent_dir.join(format!("{name}.D"));
                if *marker == Marker::Remove {
                    let mut f = fs::File::create(&path)?;
                    f.write_all(&[Marker::Remove.to_byte()])?;
                } else {
                    fs::create_dir(&path)?;
                    let mut header = fs::File::create(path.join("0"))?;
                    header.write_all(&[Marker::Update.to_byte()])?;
                    header.write_all(&mode.to_be_bytes())?;
                    for (child_name, child) in children {
                        child.save(&path, child_name)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Load a `.F` file as a `File` entry.
    pub fn load_file(path: &Utf8Path) -> Result<Entry> {
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Err(Error::CorruptStore {
                path: path.to_owned(),
                reason: "empty file entry".into(),
            });
        }
        let marker = Marker::from_byte(bytes[0])?;
        if marker == Marker::Remove {
            return Ok(Entry::File {
                mode: 0,
                marker,
                hash: None,
                content: Content::None,
            });
        }
        if bytes.len() < 1 + 2 + HASH_LEN {
            return Err(Error::CorruptStore {
                path: path.to_owned(),
                reason: "truncated file entry header".into(),
            });
        }
        let mode = u16::from_be_bytes([bytes[1], bytes[2]]);
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&bytes[3..3 + HASH_LEN]);
        Ok(Entry::File {
            mode,
            marker,
            hash: Some(hash),
            content: Content::Stored {
                path: path.to_owned(),
                offset: (3 + HASH_LEN) as u64,
            },
        })
    }

    /// Load a `.D` entry: either a tombstone file or a real directory.
    pub fn load_dir(path: &Utf8Path) -> Result<Entry> {
        if path.is_dir() {
            let header = fs::read(path.join("0"))?;
            if header.len() < 3 {
                return Err(Error::CorruptStore {
                    path: path.to_owned(),
                    reason: "truncated directory header".into(),
                });
            }
            let marker = Marker::from_byte(header[0])?;
            let mode = u16::from_be_bytes([header[1], header[2]]);
            let mut children = BTreeMap::new();
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                let fname = entry.file_name();
                let Some(fname) = fname.to_str() else {
                    continue;
                };
                if fname == "0" {
                    continue;
                }
                if let Some(stem) = fname.strip_suffix(".F") {
                    children.insert(stem.to_owned(), Entry::load_file(&entry.path().try_into().map_err(|_| Error::CorruptStore{path: path.to_owned(), reason: "non-UTF-8 path".into()})?)?);
                } else if let Some(stem) = fname.strip_suffix(".D") {
                    let child_path: Utf8PathBuf = entry.path().try_into().map_err(|_| Error::CorruptStore{path: path.to_owned(), reason: "non-UTF-8 path".into()})?;
                    children.insert(stem.to_owned(), Entry::load_dir(&child_path)?);
                }
            }
            Ok(Entry::Directory {
                mode,
                marker,
                children,
            })
        } else {
            let bytes = fs::read(path)?;
            let marker = Marker::from_byte(*bytes.first().ok_or_else(|| Error::CorruptStore {
                path: path.to_owned(),
                reason: "empty directory tombstone".into(),
            })?)?;
            Ok(Entry::Directory {
                mode: 0,
                marker,
                children: BTreeMap::new(),
            })
        }
    }

    /// Materialize a `File` entry's content onto `target_path`.
    /// Directories are handled by the caller (backup.rs), which owns the
    /// full-tree restore algorithm.
    pub fn restore_file(&self, target_path: &Utf8Path) -> Result<()> {
        let Entry::File {
            mode,
            marker,
            content,
            ..
        } = self
        else {
            panic!("restore_file called on a Directory entry");
        };
        if *marker == Marker::Remove {
            return Ok(());
        }
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(target_path)?;
        match content {
            Content::Memory(bytes) => out.write_all(bytes)?,
            Content::Stored { path, offset } => {
                let mut src = fs::File::open(path)?;
                src.seek_relative(*offset as i64)?;
                std::io::copy(&mut src, &mut out)?;
            }
            Content::None => {}
        }
        set_unix_mode(target_path, *mode)?;
        Ok(())
    }
}

#[cfg(unix)]
fn unix_mode(meta: &fs::Metadata) -> u16 {
    use std::os::unix::fs::PermissionsExt;
    (meta.permissions().mode() & 0o777) as u16
}

#[cfg(not(unix))]
fn unix_mode(_meta: &fs::Metadata) -> u16 {
    0o644
}

#[cfg(unix)]
fn set_unix_mode(path: &Utf8Path, mode: u16) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode as u32))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_unix_mode(_path: &Utf8Path, _mode: u16) -> Result<()> {
    Ok(())
}

/// Apply `overlay` (a single backup's own recorded delta) onto `base` (an
/// ancestor's already-merged effective tree), in place. A `Remove` marker
/// drops the name from `base` entirely; an `Update` file replaces it
/// wholesale; an `Update` directory merges its children onto whatever
/// directory (if any) already occupied that name in `base`, so names the
/// overlay doesn't mention are inherited from further back in the chain.
///
/// This is what makes `previous` in [`Entry::create`] the chain-merged
/// effective tree rather than just the immediate predecessor's own delta —
/// a deletion recorded two backups back must still tombstone when a later
/// Incremental doesn't touch that name at all.
pub(crate) fn merge_tree(base: &mut BTreeMap<String, Entry>, overlay: &BTreeMap<String, Entry>) {
    for (name, entry) in overlay {
        match entry {
            Entry::File {
                marker: Marker::Remove,
                ..
            }
            | Entry::Directory {
                marker: Marker::Remove,
                ..
            } => {
                base.remove(name);
            }
            Entry::File { .. } => {
                base.insert(name.clone(), entry.clone());
            }
            Entry::Directory { mode, children, .. } => {
                let mut merged_children = match base.remove(name) {
                    Some(Entry::Directory {
                        children: existing, ..
                    }) => existing,
                    _ => BTreeMap::new(),
                };
                merge_tree(&mut merged_children, children);
                base.insert(
                    name.clone(),
                    Entry::Directory {
                        mode: *mode,
                        marker: Marker::Update,
                        children: merged_children,
                    },
                );
            }
        }
    }
}

fn hash_file(path: &Utf8Path) -> Result<[u8; HASH_LEN]> {
    let mut f = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher)?;
    Ok(hasher.finalize().into())
}
