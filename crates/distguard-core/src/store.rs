//! Manifest persistence.
//!
//! The compiler replaces the rows of each OS version it built in one atomic
//! unit; the verifier reads every row of one version. [`SqliteManifestStore`]
//! is the production backend, [`MemoryManifestStore`] serves tests and
//! one-shot pipelines.

// SQLite stores integers as i64; modes and sizes are always non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Connection, OpenFlags, Row, params};
use thiserror::Error;

use crate::ErrorClass;
use crate::digest::{Digest256, DigestParseError};
use crate::manifest::{EntryType, ManifestEntry, UnknownEntryType};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from manifest storage.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row does not decode into a manifest entry.
    #[error("corrupt manifest row {path:?} ({os_version}): {reason}")]
    CorruptRow {
        /// Row path.
        path: String,
        /// Row OS version.
        os_version: String,
        /// What failed to decode.
        reason: String,
    },

    /// An entry handed to `replace_versions` belongs to another version.
    #[error("entry {path:?} has os_version {found}, expected {expected}")]
    VersionMismatch {
        /// Entry path.
        path: String,
        /// Version the batch was for.
        expected: String,
        /// Version on the entry.
        found: String,
    },
}

impl StoreError {
    /// Category used for exit codes.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Database(_) => ErrorClass::Io,
            Self::CorruptRow { .. } | Self::VersionMismatch { .. } => ErrorClass::Data,
        }
    }
}

/// Read/write contract of the manifest store.
pub trait ManifestStore: Send + Sync {
    /// Atomically replaces all rows of every listed OS version.
    ///
    /// Either every version is replaced or none is.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; no version is modified then.
    fn replace_versions(&self, batches: &[(String, Vec<ManifestEntry>)]) -> Result<(), StoreError>;

    /// Reads every row for `os_version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a row is corrupt.
    fn load_version(&self, os_version: &str) -> Result<Vec<ManifestEntry>, StoreError>;
}

fn check_versions(batches: &[(String, Vec<ManifestEntry>)]) -> Result<(), StoreError> {
    for (os_version, entries) in batches {
        if let Some(bad) = entries.iter().find(|e| &e.os_version != os_version) {
            return Err(StoreError::VersionMismatch {
                path: bad.path.clone(),
                expected: os_version.clone(),
                found: bad.os_version.clone(),
            });
        }
    }
    Ok(())
}

/// `SQLite`-backed manifest store using WAL mode.
pub struct SqliteManifestStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteManifestStore {
    /// Opens or creates a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens a store that must already exist at `path`.
    ///
    /// Readers use this so a mistyped path fails instead of yielding a
    /// fresh, empty database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no database exists at `path` or it
    /// cannot be opened.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// OS versions with at least one stored row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn versions(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt =
            conn.prepare("SELECT DISTINCT os_version FROM manifest_entries ORDER BY os_version")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

impl ManifestStore for SqliteManifestStore {
    fn replace_versions(&self, batches: &[(String, Vec<ManifestEntry>)]) -> Result<(), StoreError> {
        check_versions(batches)?;
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        {
            let mut delete = tx.prepare("DELETE FROM manifest_entries WHERE os_version = ?1")?;
            let mut insert = tx.prepare(
                "INSERT INTO manifest_entries
                 (path, os_version, entry_type, mode, owner, grp, optional, size, digest, link_target)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for (os_version, entries) in batches {
                let removed = delete.execute(params![os_version])?;
                for entry in entries {
                    insert.execute(params![
                        entry.path,
                        entry.os_version,
                        entry.entry_type.as_str(),
                        i64::from(entry.mode),
                        entry.owner,
                        entry.group,
                        entry.optional,
                        entry.size.map(|s| s as i64),
                        entry.digest.map(|d| d.as_bytes().to_vec()),
                        entry.link_target,
                    ])?;
                }
                tracing::info!(
                    os_version = %os_version,
                    removed,
                    inserted = entries.len(),
                    "replacing manifest rows"
                );
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_version(&self, os_version: &str) -> Result<Vec<ManifestEntry>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT path, os_version, entry_type, mode, owner, grp, optional, size, digest, link_target
             FROM manifest_entries WHERE os_version = ?1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![os_version], RawRow::from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.decode()?);
        }
        Ok(entries)
    }
}

/// Undecoded column values of one row.
struct RawRow {
    path: String,
    os_version: String,
    entry_type: String,
    mode: i64,
    owner: String,
    group: String,
    optional: bool,
    size: Option<i64>,
    digest: Option<Vec<u8>>,
    link_target: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(0)?,
            os_version: row.get(1)?,
            entry_type: row.get(2)?,
            mode: row.get(3)?,
            owner: row.get(4)?,
            group: row.get(5)?,
            optional: row.get(6)?,
            size: row.get(7)?,
            digest: row.get(8)?,
            link_target: row.get(9)?,
        })
    }

    fn decode(self) -> Result<ManifestEntry, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRow {
            path: self.path.clone(),
            os_version: self.os_version.clone(),
            reason,
        };
        let entry_type: EntryType = self
            .entry_type
            .parse()
            .map_err(|e: UnknownEntryType| corrupt(e.to_string()))?;
        let mode = u32::try_from(self.mode).map_err(|e| corrupt(format!("mode: {e}")))?;
        let digest = self
            .digest
            .as_deref()
            .map(Digest256::try_from_slice)
            .transpose()
            .map_err(|e: DigestParseError| corrupt(e.to_string()))?;
        Ok(ManifestEntry {
            path: self.path,
            os_version: self.os_version,
            entry_type,
            mode,
            owner: self.owner,
            group: self.group,
            optional: self.optional,
            size: self.size.map(|s| s as u64),
            digest,
            link_target: self.link_target,
        })
    }
}

/// Manifest store held in memory.
#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    versions: Mutex<HashMap<String, Vec<ManifestEntry>>>,
}

impl MemoryManifestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManifestStore for MemoryManifestStore {
    fn replace_versions(&self, batches: &[(String, Vec<ManifestEntry>)]) -> Result<(), StoreError> {
        check_versions(batches)?;
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        for (os_version, entries) in batches {
            versions.insert(os_version.clone(), entries.clone());
        }
        Ok(())
    }

    fn load_version(&self, os_version: &str) -> Result<Vec<ManifestEntry>, StoreError> {
        let versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(versions.get(os_version).cloned().unwrap_or_default())
    }
}
