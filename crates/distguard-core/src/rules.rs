//! Per-OS-version classification lists.
//!
//! Each OS version has up to six plain-text lists under
//! `<rules_dir>/<os_version>/`: `config`, `never`, `no-recurse`, `optional`,
//! `prelink` and `user`. One exact path per line; blank lines and lines
//! starting with `#` are ignored. Path lines are taken verbatim, trailing
//! whitespace included.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::manifest::EntryType;

/// The six classification lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleKind {
    /// Host-specific configuration files.
    Config,
    /// Paths a correctly built template must never contain.
    Never,
    /// Directories whose contents are not checked.
    NoRecurse,
    /// Paths that may be absent on a host.
    Optional,
    /// Binaries relocated by `prelink`.
    Prelink,
    /// Roots of user-owned data.
    User,
}

impl RuleKind {
    /// All kinds, in file-name order.
    pub const ALL: [Self; 6] = [
        Self::Config,
        Self::Never,
        Self::NoRecurse,
        Self::Optional,
        Self::Prelink,
        Self::User,
    ];

    /// Name of the list file.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Never => "never",
            Self::NoRecurse => "no-recurse",
            Self::Optional => "optional",
            Self::Prelink => "prelink",
            Self::User => "user",
        }
    }

    /// Whether membership decides the [`EntryType`] of a path.
    #[must_use]
    pub const fn determines_type(self) -> bool {
        matches!(
            self,
            Self::Config | Self::NoRecurse | Self::Prelink | Self::User
        )
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Errors loading classification lists.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuleError {
    /// A list file exists but could not be read.
    #[error("failed to read rule list {}: {source}", path.display())]
    Io {
        /// List file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The same path appears twice in one list.
    #[error("duplicate path {entry:?} in {kind} list for {os_version} (line {line})")]
    Duplicate {
        /// OS version.
        os_version: String,
        /// List containing the duplicate.
        kind: RuleKind,
        /// Duplicated path.
        entry: String,
        /// 1-based line of the second occurrence.
        line: usize,
    },

    /// A path appears in lists whose meanings conflict.
    #[error("path {entry:?} for {os_version} is listed in conflicting lists: {kinds:?}")]
    Overlap {
        /// OS version.
        os_version: String,
        /// Offending path.
        entry: String,
        /// Lists the path appears in.
        kinds: Vec<RuleKind>,
    },

    /// A non-comment line is not an absolute path.
    #[error("malformed line {line} in {kind} list for {os_version}: {content:?}")]
    Malformed {
        /// OS version.
        os_version: String,
        /// List containing the line.
        kind: RuleKind,
        /// 1-based line number.
        line: usize,
        /// Raw line.
        content: String,
    },
}

/// Parses one list file's content.
///
/// # Errors
///
/// Returns [`RuleError::Duplicate`] or [`RuleError::Malformed`].
pub fn parse_list(
    content: &str,
    os_version: &str,
    kind: RuleKind,
) -> Result<BTreeSet<String>, RuleError> {
    let mut paths = BTreeSet::new();
    for (idx, line) in content.lines().enumerate() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !line.starts_with('/') {
            return Err(RuleError::Malformed {
                os_version: os_version.to_string(),
                kind,
                line: idx + 1,
                content: line.to_string(),
            });
        }
        if !paths.insert(line.to_string()) {
            return Err(RuleError::Duplicate {
                os_version: os_version.to_string(),
                kind,
                entry: line.to_string(),
                line: idx + 1,
            });
        }
    }
    Ok(paths)
}

/// The six lists for one OS version.
#[derive(Debug, Default)]
pub struct RuleSet {
    os_version: String,
    lists: BTreeMap<RuleKind, BTreeSet<String>>,
    matched: Mutex<HashSet<(RuleKind, String)>>,
}

impl RuleSet {
    /// Builds a rule set from already-parsed lists, rejecting conflicts.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Overlap`] if a path is in more than one
    /// type-determining list, or in `never` and any other list.
    pub fn from_lists(
        os_version: impl Into<String>,
        lists: BTreeMap<RuleKind, BTreeSet<String>>,
    ) -> Result<Self, RuleError> {
        let os_version = os_version.into();
        let mut membership: BTreeMap<&str, Vec<RuleKind>> = BTreeMap::new();
        for (kind, paths) in &lists {
            for path in paths {
                membership.entry(path.as_str()).or_default().push(*kind);
            }
        }
        for (path, kinds) in membership {
            let typed = kinds.iter().filter(|k| k.determines_type()).count();
            let never = kinds.contains(&RuleKind::Never);
            if typed > 1 || (never && kinds.len() > 1) {
                return Err(RuleError::Overlap {
                    os_version,
                    entry: path.to_string(),
                    kinds,
                });
            }
        }
        Ok(Self {
            os_version,
            lists,
            matched: Mutex::new(HashSet::new()),
        })
    }

    /// OS version these rules belong to.
    #[must_use]
    pub fn os_version(&self) -> &str {
        &self.os_version
    }

    /// Paths in one list.
    pub fn list(&self, kind: RuleKind) -> impl Iterator<Item = &str> {
        self.lists
            .get(&kind)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Whether `path` is in the given list.
    #[must_use]
    pub fn contains(&self, kind: RuleKind, path: &str) -> bool {
        self.lists.get(&kind).is_some_and(|set| set.contains(path))
    }

    /// Classifies `path`: user, then no-recurse, then config, then prelink,
    /// else system.
    #[must_use]
    pub fn classify(&self, path: &str) -> EntryType {
        const PRIORITY: [(RuleKind, EntryType); 4] = [
            (RuleKind::User, EntryType::User),
            (RuleKind::NoRecurse, EntryType::NoRecurse),
            (RuleKind::Config, EntryType::Config),
            (RuleKind::Prelink, EntryType::Prelink),
        ];
        for (kind, entry_type) in PRIORITY {
            if self.contains(kind, path) {
                self.mark_matched(kind, path);
                return entry_type;
            }
        }
        EntryType::System
    }

    /// Whether `path` is optional; records the match.
    #[must_use]
    pub fn is_optional(&self, path: &str) -> bool {
        let optional = self.contains(RuleKind::Optional, path);
        if optional {
            self.mark_matched(RuleKind::Optional, path);
        }
        optional
    }

    fn mark_matched(&self, kind: RuleKind, path: &str) {
        self.matched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((kind, path.to_string()));
    }

    /// List entries never matched by [`Self::classify`] or
    /// [`Self::is_optional`] since the set was loaded. `never` entries are
    /// excluded; they are expected not to match.
    #[must_use]
    pub fn unmatched(&self) -> Vec<(RuleKind, String)> {
        let matched = self
            .matched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.lists
            .iter()
            .filter(|(kind, _)| **kind != RuleKind::Never)
            .flat_map(|(kind, paths)| paths.iter().map(move |p| (*kind, p)))
            .filter(|(kind, p)| !matched.contains(&(*kind, (*p).clone())))
            .map(|(kind, p)| (kind, p.clone()))
            .collect()
    }
}

/// Loads rule sets from a directory tree.
#[derive(Debug, Clone)]
pub struct RuleStore {
    root: PathBuf,
}

impl RuleStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the lists for `os_version`.
    #[must_use]
    pub fn version_dir(&self, os_version: &str) -> PathBuf {
        self.root.join(os_version)
    }

    /// Loads the lists for `os_version`. Missing list files are empty.
    ///
    /// # Errors
    ///
    /// Fails on unreadable lists, duplicates, malformed lines and conflicts.
    pub fn load(&self, os_version: &str) -> Result<RuleSet, RuleError> {
        let dir = self.version_dir(os_version);
        let mut lists = BTreeMap::new();
        for kind in RuleKind::ALL {
            let path = dir.join(kind.file_name());
            let content = match read_optional(&path) {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(source) => return Err(RuleError::Io { path, source }),
            };
            lists.insert(kind, parse_list(&content, os_version, kind)?);
        }
        tracing::debug!(
            os_version,
            dir = %dir.display(),
            lists = lists.len(),
            "loaded classification lists"
        );
        RuleSet::from_lists(os_version, lists)
    }
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
