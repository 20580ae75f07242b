//! The store's catalogue: which backups exist, which begin a new chain
//! segment, which are Fulls, and which Fulls are still protected from
//! cleanup.
//!
//! Persisted as plain JSON, written to a temp file in the store directory
//! and renamed into place, so a crash mid-write never corrupts the live
//! index.

use std::fs;
use std::io::Write;

use camino::Utf8Path;
use serde_derive::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::Result;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Index {
    pub last: Option<String>,
    pub list: Vec<String>,
    pub nodes: Vec<String>,
    pub fulln: Vec<String>,
    /// (id, outdate) pairs for every Full, kept sorted ascending by outdate;
    /// ties break in insertion order. Unprotected Fulls carry
    /// `OUTDATE_UNPROTECTED` (0), which sorts first, so they're always the
    /// first candidates `peek_outdated` offers up.
    pub outdates: Vec<(String, u64)>,
}

impl Index {
    pub fn load(store_path: &Utf8Path) -> Result<Index> {
        let path = store_path.join(INDEX_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Index::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, store_path: &Utf8Path) -> Result<()> {
        let path = store_path.join(INDEX_FILE);
        let mut tmp = NamedTempFile::new_in(store_path)?;
        tmp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(path = %path, "index saved");
        Ok(())
    }

    /// Record a newly-saved backup. `is_full` and `outdate` describe the
    /// backup being appended; `predecessor` is its stored predecessor id
    /// (`None` for Full).
    pub fn append(&mut self, id: &str, predecessor: Option<&str>, is_full: bool, outdate: u64) {
        let starts_new_node = is_full || self.last.as_deref() != predecessor;
        if starts_new_node {
            self.nodes.push(id.to_owned());
        }
        if is_full {
            self.fulln.push(id.to_owned());
            self.insert_outdate(id.to_owned(), outdate);
        }
        self.list.push(id.to_owned());
        self.last = Some(id.to_owned());
    }

    fn insert_outdate(&mut self, id: String, outdate: u64) {
        let pos = self
            .outdates
            .iter()
            .position(|(_, o)| *o > outdate)
            .unwrap_or(self.outdates.len());
        self.outdates.insert(pos, (id, outdate));
    }

    /// Returns the id of the Full at the head of `outdates` if its outdate
    /// has passed (`outdate <= now_minutes`), without removing it.
    pub fn peek_outdated(&self, now_minutes: u64) -> Option<&str> {
        let (id, outdate) = self.outdates.first()?;
        (*outdate <= now_minutes).then_some(id.as_str())
    }

    /// Drop the id referenced by `backup_id` (and its transitive chain
    /// descendants still recorded in `nodes`) from every index field, and
    /// return the full slice of `list` that was removed so the caller can
    /// erase those directories on disk.
    ///
    /// Find where `backup_id`'s chain segment begins among `nodes`, then
    /// scan forward through `nodes` for the next entry that is NOT a
    /// descendant of `backup_id` (via `is_descendant`); everything between
    /// those two points in `list` is the removed range.
    pub fn remove(
        &mut self,
        backup_id: &str,
        is_descendant: impl Fn(&str, &str) -> bool,
    ) -> Vec<String> {
        let Some(list_start) = self.list.iter().position(|id| id == backup_id) else {
            return Vec::new();
        };

        let node_start = self
            .nodes
            .iter()
            .position(|id| id == backup_id || is_descendant(id, backup_id))
            .unwrap_or(self.nodes.len());

        let mut list_end = self.list.len();
        for node in self.nodes.iter().skip(node_start + 1) {
            if node == backup_id || is_descendant(node, backup_id) {
                continue;
            }
            list_end = self
                .list
                .iter()
                .position(|id| id == node)
                .expect("node id must be present in list");
            break;
        }

        let removed: Vec<String> = self.list[list_start..list_end].to_vec();
        let removed_set: std::collections::HashSet<&str> =
            removed.iter().map(String::as_str).collect();

        self.list.drain(list_start..list_end);
        self.nodes.retain(|id| !removed_set.contains(id.as_str()));
        self.fulln.retain(|id| !removed_set.contains(id.as_str()));
        self.outdates
            .retain(|(id, _)| !removed_set.contains(id.as_str()));

        if self
            .last
            .as_deref()
            .map(|last| removed_set.contains(last))
            .unwrap_or(false)
        {
            self.last = self.list.last().cloned();
        }

        removed
    }
}
