//! Reference records describing what each path of an OS template looks like.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest256;

/// Separator between acceptable symlink targets in [`ManifestEntry::link_target`].
pub const SYMLINK_TARGET_DELIMITER: char = '|';

/// File-type bits of `st_mode`.
pub const S_IFMT: u32 = 0o170_000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link type bits.
pub const S_IFLNK: u32 = 0o120_000;
/// Permission bits including set-id and sticky bits.
pub const PERMISSION_BITS: u32 = 0o7777;
/// Set-user-ID bit.
pub const S_ISUID: u32 = 0o4000;
/// Set-group-ID bit.
pub const S_ISGID: u32 = 0o2000;

/// Classification of a manifest path.
///
/// Decides whether content is hashed and whether traversal continues below a
/// directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// Distribution-owned path; content is verified exactly.
    System,
    /// Configuration file expected to vary per host; content is not checked.
    Config,
    /// User data root; contents are checked under the relaxed user policy.
    User,
    /// Boundary below which nothing is checked.
    NoRecurse,
    /// Executable relocated at install time; hashed after unprelinking.
    Prelink,
}

/// What a walker does at a directory of a given [`EntryType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recursion {
    /// Descend with the strict manifest policy.
    Strict,
    /// Descend with the relaxed user-directory policy.
    Relaxed,
    /// Do not descend.
    Stop,
}

impl EntryType {
    /// All classifications, in storage order.
    pub const ALL: [Self; 5] = [
        Self::System,
        Self::Config,
        Self::User,
        Self::NoRecurse,
        Self::Prelink,
    ];

    /// Stable name used in storage and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Config => "CONFIG",
            Self::User => "USER",
            Self::NoRecurse => "NO_RECURSE",
            Self::Prelink => "PRELINK",
        }
    }

    /// Whether regular files of this type carry an exact length and digest.
    #[must_use]
    pub const fn hashes_content(self) -> bool {
        match self {
            Self::System | Self::Prelink => true,
            Self::Config | Self::User | Self::NoRecurse => false,
        }
    }

    /// Traversal behaviour at a directory of this type.
    #[must_use]
    pub const fn recursion(self) -> Recursion {
        match self {
            Self::System | Self::Config | Self::Prelink => Recursion::Strict,
            Self::User => Recursion::Relaxed,
            Self::NoRecurse => Recursion::Stop,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unknown entry type name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown entry type: {0}")]
pub struct UnknownEntryType(pub String);

impl FromStr for EntryType {
    type Err = UnknownEntryType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEntryType(s.to_string()))
    }
}

/// Coarse file type derived from `st_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Directory.
    Directory,
    /// Regular file.
    Regular,
    /// Symbolic link.
    Symlink,
    /// Device, FIFO or socket.
    Special,
}

impl FileKind {
    /// Classifies the type bits of a raw mode.
    #[must_use]
    pub const fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFREG => Self::Regular,
            S_IFLNK => Self::Symlink,
            _ => Self::Special,
        }
    }
}

/// Formats permission bits the way reports and `chmod` suggestions expect.
#[must_use]
pub fn format_permissions(mode: u32) -> String {
    format!("{:o}", mode & PERMISSION_BITS)
}

/// One reference record, keyed by `(path, os_version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute path relative to the template root (`/` for the root).
    pub path: String,
    /// OS version the template belongs to.
    pub os_version: String,
    /// Classification.
    pub entry_type: EntryType,
    /// Full `st_mode`, type and permission bits.
    pub mode: u32,
    /// Owner account name.
    pub owner: String,
    /// Group name.
    pub group: String,
    /// The path may legitimately be absent on a host.
    #[serde(default)]
    pub optional: bool,
    /// Exact length for hashed regular files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Content digest for hashed regular files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest256>,
    /// Acceptable symlink targets, separated by [`SYMLINK_TARGET_DELIMITER`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl ManifestEntry {
    /// The ordering the verifier's snapshot is sorted and searched by.
    #[must_use]
    pub fn key_cmp(&self, other: &Self) -> Ordering {
        compare_key(&self.path, &self.os_version, &other.path, &other.os_version)
    }

    /// Coarse type of the recorded mode.
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Iterates the acceptable symlink targets.
    pub fn link_alternatives(&self) -> impl Iterator<Item = &str> {
        self.link_target
            .as_deref()
            .into_iter()
            .flat_map(|t| t.split(SYMLINK_TARGET_DELIMITER))
    }
}

/// Compares two `(path, os_version)` keys byte-wise.
#[must_use]
pub fn compare_key(path_a: &str, os_a: &str, path_b: &str, os_b: &str) -> Ordering {
    path_a
        .as_bytes()
        .cmp(path_b.as_bytes())
        .then_with(|| os_a.as_bytes().cmp(os_b.as_bytes()))
}

/// Returns true if `path` lies strictly below `ancestor`.
#[must_use]
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Joins a manifest directory path and a child name.
#[must_use]
pub fn join_manifest_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
