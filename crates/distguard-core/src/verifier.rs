//! Live-host verifier.
//!
//! Walks a host's filesystem from its root and compares every path with an
//! immutable snapshot of the manifest for the host's OS version. The walk is
//! single-threaded and recursive; user directories switch to a relaxed
//! policy that checks ownership sanity instead of manifest equality.
//!
//! Per-entry I/O failures are logged and counted in
//! [`ScanStats::skipped`]; the run continues. Cancellation aborts the run
//! without a report.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::io;
use std::ops::Range;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ErrorClass;
use crate::accounts::AccountDirectory;
use crate::digest::sha256_file;
use crate::manifest::{
    EntryType, FileKind, ManifestEntry, PERMISSION_BITS, Recursion, S_IFMT, S_ISGID, S_ISUID,
    compare_key, format_permissions, is_descendant, join_manifest_path,
};
use crate::prelink::Unprelinker;
use crate::report::{DiscrepancyKind, DiscrepancyRecord, ScanStats, VerifyReport, shell_quote};
use crate::store::{ManifestStore, StoreError};

/// Placeholder that stands for the host name in manifest paths.
pub const DEFAULT_HOSTNAME_PLACEHOLDER: &str = "@HOSTNAME@";

/// Child count above which a directory is reported as BIG_DIRECTORY.
pub const DEFAULT_BIG_DIRECTORY_THRESHOLD: usize = 10_000;

/// Highest uid/gid of the reserved system range.
pub const DEFAULT_SYSTEM_ID_MAX: u32 = 999;

/// Directory nesting at which the walk stops descending.
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Fraction of hashing time spent sleeping afterwards.
pub const DEFAULT_THROTTLE_FACTOR: f64 = 0.5;

/// Upper bound of a single throttle sleep.
pub const DEFAULT_THROTTLE_MAX: Duration = Duration::from_secs(5);

/// Mailing-list wrapper scripts are installed set-gid by the list software.
pub const MAILMAN_WRAPPER_PATTERN: &str = r"^/home/([^/]+)/mailman/lists/[^/]+/wrapper$";

static MAILMAN_WRAPPER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(MAILMAN_WRAPPER_PATTERN).expect("wrapper regex is valid"));

/// Errors that abort a verification run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerifyError {
    /// The run was cancelled.
    #[error("verification interrupted")]
    Interrupted,

    /// The manifest could not be loaded.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No manifest rows exist for the host's OS version.
    #[error("no manifest entries for os version {os_version}")]
    EmptyManifest {
        /// OS version.
        os_version: String,
    },

    /// The host root itself could not be examined.
    #[error("cannot read host root {}: {source}", path.display())]
    RootUnreadable {
        /// Root directory.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Scan counters do not add up.
    #[error(
        "scan counters inconsistent: scanned {scanned} != system {system} + user {user} + \
         no-recurse {no_recurse}"
    )]
    CountMismatch {
        /// Entries scanned.
        scanned: u64,
        /// System entries.
        system: u64,
        /// User entries.
        user: u64,
        /// Boundary entries.
        no_recurse: u64,
    },
}

impl VerifyError {
    /// Category used for exit codes.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Interrupted => ErrorClass::Interrupted,
            Self::Store(err) => err.class(),
            Self::RootUnreadable { .. } => ErrorClass::Io,
            Self::EmptyManifest { .. } => ErrorClass::Data,
            Self::CountMismatch { .. } => ErrorClass::Internal,
        }
    }
}

/// The host being verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// Host name, substituted by the placeholder on lookup misses.
    pub hostname: String,
    /// OS version whose manifest applies.
    pub os_version: String,
    /// Filesystem directory that stands for `/`.
    pub root: PathBuf,
}

/// Sleep proportional to hashing time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttle {
    /// Sleep time as a fraction of the preceding operation's time.
    pub factor: f64,
    /// Cap on one sleep.
    pub max: Duration,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            factor: DEFAULT_THROTTLE_FACTOR,
            max: DEFAULT_THROTTLE_MAX,
        }
    }
}

impl Throttle {
    /// A throttle that never sleeps.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            factor: 0.0,
            max: Duration::ZERO,
        }
    }

    /// Sleep owed after an operation that took `elapsed`.
    #[must_use]
    pub fn pause_for(&self, elapsed: Duration) -> Duration {
        if self.factor <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(elapsed.as_secs_f64() * self.factor)
            .map_or(self.max, |pause| pause.min(self.max))
    }
}

/// A set-id file under a user directory that is accepted as legitimate.
#[derive(Debug, Clone)]
pub struct SetuidException {
    /// Pattern the path must match.
    pub pattern: Regex,
    /// Exact permission bits, including set-id bits.
    pub mode: u32,
    /// Expected owner; may reference pattern captures (`$1`).
    pub owner: String,
    /// Expected group name.
    pub group: String,
}

impl SetuidException {
    /// Compiles an exception.
    ///
    /// # Errors
    ///
    /// Returns the regex error if `pattern` is invalid.
    pub fn new(
        pattern: &str,
        mode: u32,
        owner: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            mode,
            owner: owner.into(),
            group: group.into(),
        })
    }

    /// The mailing-list wrapper: mode `02755`, owned by the list's account,
    /// group `mail`.
    #[must_use]
    pub fn mailman_wrapper() -> Self {
        Self {
            pattern: MAILMAN_WRAPPER.clone(),
            mode: 0o2755,
            owner: "$1".to_string(),
            group: "mail".to_string(),
        }
    }

    /// Whether a live entry is covered by this exception.
    fn matches(&self, path: &str, meta: &Metadata, accounts: &dyn AccountDirectory) -> bool {
        let Some(caps) = self.pattern.captures(path) else {
            return false;
        };
        let mut owner = String::new();
        caps.expand(&self.owner, &mut owner);
        meta.mode() & PERMISSION_BITS == self.mode
            && accounts.uid_of(&owner) == Some(meta.uid())
            && accounts.gid_of(&self.group) == Some(meta.gid())
    }
}

/// Tunables of one verification run.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Walk USER directories with the relaxed policy.
    pub include_user_dirs: bool,
    /// Token that replaces the host name in manifest paths.
    pub hostname_placeholder: String,
    /// BIG_DIRECTORY threshold.
    pub big_directory_threshold: usize,
    /// Post-hash sleep.
    pub throttle: Throttle,
    /// Highest id of the system range.
    pub system_id_max: u32,
    /// Directories nested deeper than this are skipped, not listed.
    pub max_depth: usize,
    /// Accepted set-id files under user directories.
    pub setuid_exceptions: Vec<SetuidException>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            include_user_dirs: true,
            hostname_placeholder: DEFAULT_HOSTNAME_PLACEHOLDER.to_string(),
            big_directory_threshold: DEFAULT_BIG_DIRECTORY_THRESHOLD,
            throttle: Throttle::default(),
            system_id_max: DEFAULT_SYSTEM_ID_MAX,
            max_depth: DEFAULT_MAX_DEPTH,
            setuid_exceptions: vec![SetuidException::mailman_wrapper()],
        }
    }
}

/// Shared cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one verifier needs, passed in explicitly.
pub struct VerifierContext {
    /// Host description.
    pub server: Server,
    /// Host account directory.
    pub accounts: Arc<dyn AccountDirectory>,
    /// Unprelink collaborator.
    pub unprelinker: Arc<dyn Unprelinker>,
    /// Run options.
    pub options: VerifyOptions,
    /// Cancellation signal.
    pub cancel: CancelFlag,
}

/// Immutable manifest of one OS version, sorted by [`ManifestEntry::key_cmp`].
#[derive(Debug, Clone)]
pub struct ManifestSnapshot {
    os_version: String,
    entries: Vec<ManifestEntry>,
}

impl ManifestSnapshot {
    /// Builds a snapshot; rows of other versions are dropped.
    #[must_use]
    pub fn from_entries(os_version: impl Into<String>, entries: Vec<ManifestEntry>) -> Self {
        let os_version = os_version.into();
        let mut entries: Vec<_> = entries
            .into_iter()
            .filter(|e| e.os_version == os_version)
            .collect();
        entries.sort_by(ManifestEntry::key_cmp);
        Self {
            os_version,
            entries,
        }
    }

    /// Loads the snapshot of `os_version` from a store.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn load(store: &dyn ManifestStore, os_version: &str) -> Result<Self, StoreError> {
        Ok(Self::from_entries(os_version, store.load_version(os_version)?))
    }

    /// OS version.
    #[must_use]
    pub fn os_version(&self) -> &str {
        &self.os_version
    }

    /// Entries in lookup order.
    #[must_use]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the entry for `path`.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<usize> {
        self.entries
            .binary_search_by(|e| compare_key(&e.path, &e.os_version, path, &self.os_version))
            .ok()
    }

    /// Index range of the entries strictly below `path`.
    ///
    /// Descendants of `/a` sort after `/a/` but not directly after `/a`,
    /// since names such as `/a-b` fall in between.
    #[must_use]
    pub fn descendants(&self, path: &str) -> Range<usize> {
        let lower = if path == "/" { "/".to_string() } else { format!("{path}/") };
        let start = self
            .entries
            .partition_point(|e| e.path.as_bytes() < lower.as_bytes());
        let below = &self.entries[start..];
        let skip = below.iter().take_while(|e| e.path == path).count();
        let len = below[skip..]
            .iter()
            .take_while(|e| is_descendant(&e.path, path))
            .count();
        start + skip..start + skip + len
    }
}

/// Whether a file name is disguised in directory listings.
#[must_use]
pub fn is_hidden_name(name: &str) -> bool {
    if name.starts_with("...") {
        return true;
    }
    if let Some(rest) = name.strip_prefix("..") {
        if rest.starts_with(char::is_whitespace) {
            return true;
        }
    }
    !name.is_empty() && name.chars().all(char::is_whitespace)
}

/// Compares live hosts with their manifest.
pub struct Verifier {
    ctx: VerifierContext,
}

impl Verifier {
    /// Creates a verifier.
    #[must_use]
    pub const fn new(ctx: VerifierContext) -> Self {
        Self { ctx }
    }

    /// The context this verifier was built with.
    #[must_use]
    pub const fn context(&self) -> &VerifierContext {
        &self.ctx
    }

    /// Loads the manifest for the host's OS version and verifies.
    ///
    /// # Errors
    ///
    /// See [`VerifyError`]; an empty manifest is
    /// [`VerifyError::EmptyManifest`].
    pub fn verify_server(&self, store: &dyn ManifestStore) -> Result<VerifyReport, VerifyError> {
        let os_version = &self.ctx.server.os_version;
        let snapshot = ManifestSnapshot::load(store, os_version)?;
        if snapshot.is_empty() {
            return Err(VerifyError::EmptyManifest {
                os_version: os_version.clone(),
            });
        }
        self.verify(&snapshot)
    }

    /// Verifies the host against `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Interrupted`] on cancellation,
    /// [`VerifyError::RootUnreadable`] if the root cannot be examined, and
    /// [`VerifyError::CountMismatch`] if the counters are inconsistent.
    pub fn verify(&self, snapshot: &ManifestSnapshot) -> Result<VerifyReport, VerifyError> {
        let server = &self.ctx.server;
        info!(
            hostname = %server.hostname,
            os_version = %server.os_version,
            root = %server.root.display(),
            entries = snapshot.len(),
            user_dirs = self.ctx.options.include_user_dirs,
            "verification started"
        );
        let root_meta =
            fs::symlink_metadata(&server.root).map_err(|source| VerifyError::RootUnreadable {
                path: server.root.clone(),
                source,
            })?;

        let mut walk = Walk {
            ctx: &self.ctx,
            snapshot,
            seen: vec![false; snapshot.len()],
            depth: 0,
            stats: ScanStats {
                started_at: Some(Utc::now()),
                ..ScanStats::default()
            },
            discrepancies: Vec::new(),
        };
        walk.visit_strict("/", &server.root, root_meta)?;
        walk.report_missing();
        walk.stats.finished_at = Some(Utc::now());

        let stats = walk.stats;
        if !stats.is_consistent() {
            return Err(VerifyError::CountMismatch {
                scanned: stats.scanned,
                system: stats.system_count,
                user: stats.user_count,
                no_recurse: stats.no_recurse_count,
            });
        }
        info!(
            hostname = %server.hostname,
            discrepancies = walk.discrepancies.len(),
            scanned = stats.scanned,
            skipped = stats.skipped,
            "verification finished"
        );
        Ok(VerifyReport {
            hostname: server.hostname.clone(),
            os_version: server.os_version.clone(),
            discrepancies: walk.discrepancies,
            stats,
        })
    }
}

/// State of one run.
struct Walk<'a> {
    ctx: &'a VerifierContext,
    snapshot: &'a ManifestSnapshot,
    seen: Vec<bool>,
    depth: usize,
    stats: ScanStats,
    discrepancies: Vec<DiscrepancyRecord>,
}

impl<'a> Walk<'a> {
    fn check_cancel(&self) -> Result<(), VerifyError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(VerifyError::Interrupted);
        }
        Ok(())
    }

    fn record(&mut self, record: DiscrepancyRecord) {
        debug!(kind = %record.kind, path = %record.path, "discrepancy");
        self.discrepancies.push(record);
    }

    fn skip(&mut self, path: &str, what: &str, err: &io::Error) {
        warn!(path = %path, error = %err, "skipping entry: {what} failed");
        self.stats.skipped += 1;
    }

    fn check_hidden(&mut self, path: &str) {
        let name = path.rsplit('/').next().unwrap_or_default();
        if is_hidden_name(name) {
            self.record(DiscrepancyRecord::new(
                DiscrepancyKind::Hidden,
                path,
                format!("{name:?}"),
                "visible name",
            ));
        }
    }

    /// Exact lookup, then with the host name replaced by the placeholder.
    fn lookup(&self, path: &str) -> Option<usize> {
        self.snapshot.find(path).or_else(|| {
            let hostname = &self.ctx.server.hostname;
            if hostname.is_empty() || !path.contains(hostname.as_str()) {
                return None;
            }
            let generic = path.replace(hostname.as_str(), &self.ctx.options.hostname_placeholder);
            self.snapshot.find(&generic)
        })
    }

    /// Reads metadata for a child; `None` if it was skipped.
    fn child_metadata(&mut self, path: &str, fs_path: &Path) -> Option<Metadata> {
        match fs::symlink_metadata(fs_path) {
            Ok(meta) => Some(meta),
            Err(err) => {
                self.skip(path, "stat", &err);
                if let Some(index) = self.lookup(path) {
                    self.seen[index] = true;
                }
                self.mark_below(path);
                None
            },
        }
    }

    /// Marks every manifest entry below `path` as seen. Used when a subtree
    /// cannot be inspected, so its entries are not claimed MISSING.
    fn mark_below(&mut self, path: &str) {
        let snapshot: &'a ManifestSnapshot = self.snapshot;
        let prefix = self
            .lookup(path)
            .map_or(path, |index| snapshot.entries()[index].path.as_str());
        for index in snapshot.descendants(prefix) {
            self.seen[index] = true;
        }
    }

    /// Enters a directory unless the nesting limit is reached.
    fn enter(&mut self, path: &str) -> bool {
        let limit = self.ctx.options.max_depth;
        if self.depth >= limit {
            warn!(path = %path, limit, "skipping entry: directory nesting limit reached");
            self.stats.skipped += 1;
            self.mark_below(path);
            return false;
        }
        self.depth += 1;
        true
    }

    fn visit_strict(&mut self, path: &str, fs_path: &Path, meta: Metadata) -> Result<(), VerifyError> {
        self.check_cancel()?;
        self.check_hidden(path);
        self.stats.scanned += 1;

        let snapshot: &'a ManifestSnapshot = self.snapshot;
        let Some(index) = self.lookup(path) else {
            self.stats.system_count += 1;
            let kind = FileKind::from_mode(meta.mode());
            let removal = if kind == FileKind::Directory { "rm -rf" } else { "rm -f" };
            self.record(
                DiscrepancyRecord::new(DiscrepancyKind::Extra, path, describe(kind), "absent")
                    .suggest(format!("{removal} {}", shell_quote(path))),
            );
            return Ok(());
        };
        self.seen[index] = true;
        let entry = &snapshot.entries()[index];

        let recursion = entry.entry_type.recursion();
        match recursion {
            Recursion::Strict => self.stats.system_count += 1,
            Recursion::Relaxed => self.stats.user_count += 1,
            Recursion::Stop => self.stats.no_recurse_count += 1,
        }

        let live_kind = FileKind::from_mode(meta.mode());
        let types_match = self.compare_attributes(path, &meta, entry);
        if !types_match {
            return Ok(());
        }
        match live_kind {
            FileKind::Symlink => self.check_symlink(path, fs_path, entry),
            FileKind::Regular => self.check_content(path, fs_path, &meta, entry),
            FileKind::Directory => match recursion {
                Recursion::Strict => self.descend_strict(path, fs_path)?,
                Recursion::Relaxed if self.ctx.options.include_user_dirs => {
                    self.descend_relaxed(path, fs_path)?;
                },
                Recursion::Relaxed | Recursion::Stop => {},
            },
            FileKind::Special => {},
        }
        Ok(())
    }

    /// Owner, group, type and permission checks. Returns whether the file
    /// types agree.
    fn compare_attributes(&mut self, path: &str, meta: &Metadata, entry: &ManifestEntry) -> bool {
        let ctx: &'a VerifierContext = self.ctx;
        let accounts = ctx.accounts.as_ref();
        let quoted = shell_quote(path);
        let is_link = FileKind::from_mode(meta.mode()) == FileKind::Symlink;
        let no_deref = if is_link { "-h " } else { "" };

        if accounts.uid_of(&entry.owner) != Some(meta.uid()) {
            let observed = accounts
                .user_name(meta.uid())
                .unwrap_or_else(|| meta.uid().to_string());
            self.record(
                DiscrepancyRecord::new(DiscrepancyKind::OwnerMismatch, path, observed, &entry.owner)
                    .suggest(format!("chown {no_deref}{} {quoted}", entry.owner)),
            );
        }
        if accounts.gid_of(&entry.group) != Some(meta.gid()) {
            let observed = accounts
                .group_name(meta.gid())
                .unwrap_or_else(|| meta.gid().to_string());
            self.record(
                DiscrepancyRecord::new(DiscrepancyKind::GroupMismatch, path, observed, &entry.group)
                    .suggest(format!("chgrp {no_deref}{} {quoted}", entry.group)),
            );
        }
        if meta.mode() & S_IFMT != entry.mode & S_IFMT {
            self.record(DiscrepancyRecord::new(
                DiscrepancyKind::Type,
                path,
                describe(FileKind::from_mode(meta.mode())),
                describe(entry.kind()),
            ));
            return false;
        }
        // Symlink permissions are meaningless on Linux.
        if !is_link && meta.mode() & PERMISSION_BITS != entry.mode & PERMISSION_BITS {
            let expected = format_permissions(entry.mode);
            self.record(
                DiscrepancyRecord::new(
                    DiscrepancyKind::Permissions,
                    path,
                    format_permissions(meta.mode()),
                    expected.clone(),
                )
                .suggest(format!("chmod {expected} {quoted}")),
            );
        }
        true
    }

    fn check_symlink(&mut self, path: &str, fs_path: &Path, entry: &ManifestEntry) {
        let Some(expected) = entry.link_target.as_deref() else {
            return;
        };
        let target = match fs::read_link(fs_path) {
            Ok(target) => target.to_string_lossy().into_owned(),
            Err(err) => return self.skip(path, "readlink", &err),
        };
        if entry.link_alternatives().any(|alt| alt == target) {
            return;
        }
        let first = entry.link_alternatives().next().unwrap_or(expected);
        self.record(
            DiscrepancyRecord::new(DiscrepancyKind::Symlink, path, target, expected).suggest(format!(
                "ln -sfn {} {}",
                shell_quote(first),
                shell_quote(path)
            )),
        );
    }

    fn check_content(&mut self, path: &str, fs_path: &Path, meta: &Metadata, entry: &ManifestEntry) {
        let (Some(size), Some(digest)) = (entry.size, entry.digest) else {
            return;
        };
        let started = Instant::now();
        let observed = match entry.entry_type {
            EntryType::System => {
                if meta.len() != size {
                    self.length_mismatch(path, meta.len(), size);
                    return;
                }
                match sha256_file(fs_path) {
                    Ok((digest, len)) => {
                        self.stats.sha256_files += 1;
                        self.stats.sha256_bytes += len;
                        digest
                    },
                    Err(err) => return self.skip(path, "hashing", &err),
                }
            },
            EntryType::Prelink => match self.ctx.unprelinker.unprelinked_digest(fs_path) {
                Ok((digest, len)) => {
                    self.stats.prelink_files += 1;
                    self.stats.prelink_bytes += len;
                    if len != size {
                        self.length_mismatch(path, len, size);
                        self.throttle(started.elapsed());
                        return;
                    }
                    digest
                },
                Err(err) => return self.skip(path, "unprelinking", &err),
            },
            EntryType::Config | EntryType::User | EntryType::NoRecurse => return,
        };
        if observed != digest {
            self.record(DiscrepancyRecord::new(
                DiscrepancyKind::Digest,
                path,
                observed.to_string(),
                digest.to_string(),
            ));
        }
        self.throttle(started.elapsed());
    }

    fn length_mismatch(&mut self, path: &str, observed: u64, expected: u64) {
        self.record(DiscrepancyRecord::new(
            DiscrepancyKind::Length,
            path,
            observed.to_string(),
            expected.to_string(),
        ));
    }

    fn throttle(&self, elapsed: Duration) {
        let pause = self.ctx.options.throttle.pause_for(elapsed);
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }

    /// Sorted `(manifest path, filesystem path)` children of a directory.
    fn children(&mut self, path: &str, fs_path: &Path) -> Option<Vec<(String, PathBuf)>> {
        let listing = fs::read_dir(fs_path).and_then(|dir| {
            dir.map(|dirent| dirent.map(|d| d.file_name()))
                .collect::<io::Result<Vec<OsString>>>()
        });
        let mut names = match listing {
            Ok(names) => names,
            Err(err) => {
                self.skip(path, "listing", &err);
                self.mark_below(path);
                return None;
            },
        };
        names.sort_unstable();
        Some(
            names
                .into_iter()
                .map(|name| {
                    let child = join_manifest_path(path, &name.to_string_lossy());
                    (child, fs_path.join(name))
                })
                .collect(),
        )
    }

    fn descend_strict(&mut self, path: &str, fs_path: &Path) -> Result<(), VerifyError> {
        if !self.enter(path) {
            return Ok(());
        }
        let Some(children) = self.children(path, fs_path) else {
            self.depth -= 1;
            return Ok(());
        };
        let threshold = self.ctx.options.big_directory_threshold;
        if children.len() > threshold {
            self.record(DiscrepancyRecord::new(
                DiscrepancyKind::BigDirectory,
                path,
                children.len().to_string(),
                format!("at most {threshold} entries"),
            ));
        }
        for (child, child_fs) in children {
            self.check_cancel()?;
            if let Some(meta) = self.child_metadata(&child, &child_fs) {
                self.visit_strict(&child, &child_fs, meta)?;
            }
        }
        self.depth -= 1;
        Ok(())
    }

    fn descend_relaxed(&mut self, path: &str, fs_path: &Path) -> Result<(), VerifyError> {
        if !self.enter(path) {
            return Ok(());
        }
        let Some(children) = self.children(path, fs_path) else {
            self.depth -= 1;
            return Ok(());
        };
        for (child, child_fs) in children {
            self.check_cancel()?;
            if let Some(meta) = self.child_metadata(&child, &child_fs) {
                self.visit_relaxed(&child, &child_fs, &meta)?;
            }
        }
        self.depth -= 1;
        Ok(())
    }

    fn visit_relaxed(&mut self, path: &str, fs_path: &Path, meta: &Metadata) -> Result<(), VerifyError> {
        self.check_cancel()?;
        self.check_hidden(path);
        self.stats.scanned += 1;
        self.stats.user_count += 1;

        let ctx: &'a VerifierContext = self.ctx;
        let accounts = ctx.accounts.as_ref();
        if !accounts.user_exists(meta.uid()) {
            self.record(DiscrepancyRecord::new(
                DiscrepancyKind::NoOwner,
                path,
                meta.uid().to_string(),
                "known account",
            ));
        }
        if !accounts.group_exists(meta.gid()) {
            self.record(DiscrepancyRecord::new(
                DiscrepancyKind::NoGroup,
                path,
                meta.gid().to_string(),
                "known group",
            ));
        }

        let kind = FileKind::from_mode(meta.mode());
        if kind != FileKind::Directory && self.is_suspicious_setid(path, meta) {
            self.record(
                DiscrepancyRecord::new(
                    DiscrepancyKind::Setuid,
                    path,
                    format_permissions(meta.mode()),
                    "no set-id bits",
                )
                .suggest(format!("chmod ug-s {}", shell_quote(path))),
            );
        }
        if kind == FileKind::Directory {
            self.descend_relaxed(path, fs_path)?;
        }
        Ok(())
    }

    fn is_suspicious_setid(&self, path: &str, meta: &Metadata) -> bool {
        let options = &self.ctx.options;
        if meta.mode() & (S_ISUID | S_ISGID) == 0 {
            return false;
        }
        if meta.uid() <= options.system_id_max && meta.gid() <= options.system_id_max {
            return false;
        }
        let accounts = self.ctx.accounts.as_ref();
        !options
            .setuid_exceptions
            .iter()
            .any(|exception| exception.matches(path, meta, accounts))
    }

    /// Reports unseen mandatory entries, once per absent subtree.
    fn report_missing(&mut self) {
        let snapshot: &'a ManifestSnapshot = self.snapshot;
        let mut absent: HashSet<&str> = HashSet::new();
        let mut missing = Vec::new();
        for (entry, seen) in snapshot.entries().iter().zip(&self.seen) {
            if *seen {
                continue;
            }
            let covered = ancestors(&entry.path).any(|a| absent.contains(a));
            absent.insert(&entry.path);
            if covered || entry.optional {
                continue;
            }
            missing.push(DiscrepancyRecord::new(
                DiscrepancyKind::Missing,
                &entry.path,
                "absent",
                format!("{} {}", entry.entry_type, describe(entry.kind())),
            ));
        }
        for record in missing {
            self.record(record);
        }
    }
}

/// Proper ancestors of a manifest path, nearest first.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut rest = path;
    std::iter::from_fn(move || {
        if rest == "/" || rest.is_empty() {
            return None;
        }
        let cut = rest.rfind('/')?;
        rest = if cut == 0 { "/" } else { &rest[..cut] };
        Some(rest)
    })
}

const fn describe(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Directory => "directory",
        FileKind::Regular => "regular file",
        FileKind::Symlink => "symlink",
        FileKind::Special => "special file",
    }
}
