//! Ignore patterns: compile a list of user-supplied patterns into a
//! predicate over a (directory path, base name) pair.
//!
//! Grammar:
//!   - leading `/`           -> anchored: directory path must equal the rest exactly
//!   - `/` anywhere else     -> directory path must end with the pattern
//!   - leading `*`           -> base name must end with the rest
//!   - anything else         -> base name must equal the pattern exactly

use camino::Utf8Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Rule {
    Anchored(String),
    DirSuffix(String),
    BaseSuffix(String),
    BaseEqual(String),
}

impl Rule {
    fn compile(pattern: &str) -> Result<Rule> {
        if pattern.is_empty() {
            return Err(Error::MalformedPattern(pattern.to_owned()));
        }
        if let Some(rest) = pattern.strip_prefix('/') {
            if rest.is_empty() {
                return Err(Error::MalformedPattern(pattern.to_owned()));
            }
            return Ok(Rule::Anchored(rest.to_owned()));
        }
        if pattern.contains('/') {
            return Ok(Rule::DirSuffix(pattern.to_owned()));
        }
        if let Some(rest) = pattern.strip_prefix('*') {
            if rest.is_empty() {
                return Err(Error::MalformedPattern(pattern.to_owned()));
            }
            return Ok(Rule::BaseSuffix(rest.to_owned()));
        }
        Ok(Rule::BaseEqual(pattern.to_owned()))
    }

    fn matches(&self, dir: &str, base: &str) -> bool {
        match self {
            // Anchored patterns name a full path from the backup root, so
            // compare against dir+"/"+base, not the directory alone.
            Rule::Anchored(p) => {
                if dir.is_empty() {
                    base == p
                } else {
                    p.strip_prefix(dir)
                        .and_then(|rest| rest.strip_prefix('/'))
                        .is_some_and(|rest| rest == base)
                }
            }
            Rule::DirSuffix(p) => dir.ends_with(p.as_str()),
            Rule::BaseSuffix(p) => base.ends_with(p.as_str()),
            Rule::BaseEqual(p) => base == p,
        }
    }
}

/// A compiled set of ignore rules. Call [`Filter::keep`] with the directory
/// path (relative to the backup root, no trailing slash) and base name of a
/// candidate entry; returns `false` if any rule matches (i.e., it's ignored).
pub struct Filter {
    rules: Vec<Rule>,
}

impl Filter {
    pub fn compile(patterns: &[String]) -> Result<Filter> {
        let rules = patterns
            .iter()
            .map(|p| Rule::compile(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Filter { rules })
    }

    /// `dir` is the parent directory path relative to the backup root (empty
    /// string at the top level); `base` is the file or directory name.
    pub fn keep(&self, dir: &str, base: &str) -> bool {
        !self.rules.iter().any(|r| r.matches(dir, base))
    }

    /// Convenience wrapper over a full relative path.
    pub fn keep_path(&self, relative: &Utf8Path) -> bool {
        let base = relative.file_name().unwrap_or("");
        let dir = relative.parent().map(|p| p.as_str()).unwrap_or("");
        self.keep(dir, base)
    }
}
