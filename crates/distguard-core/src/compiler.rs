//! Manifest compiler.
//!
//! Walks the template tree of each requested OS version and produces one
//! [`ManifestEntry`] per path. The run is all-or-nothing: any I/O error,
//! configuration conflict or `never` path aborts it and nothing is
//! committed.
//!
//! # Layout
//!
//! `<template_root>/<os_version>/` is the `/` of that version's template.
//! Owner and group names come from the template's own `etc/passwd` and
//! `etc/group`, loaded once per version.
//!
//! # Concurrency
//!
//! A pool of workers pulls paths from one [`WorkQueue`]. Visiting a
//! directory pushes its sorted children back onto the queue. Hashing and
//! name resolution run outside the queue lock; emitted entries go through a
//! second lock so the optional JSON-lines stream gets one record per line.
//! The first fatal error cancels the queue and is returned once all workers
//! have been joined.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ErrorClass;
use crate::accounts::{AccountDirectory, AccountError, PasswdFiles};
use crate::digest::sha256_file;
use crate::manifest::{EntryType, FileKind, ManifestEntry, Recursion, join_manifest_path};
use crate::prelink::Unprelinker;
use crate::rules::{RuleError, RuleKind, RuleSet, RuleStore};
use crate::store::{ManifestStore, StoreError};

/// Lower bound on the default worker count.
pub const MIN_DEFAULT_WORKERS: usize = 4;

/// Default worker count: `max(4, 2 × logical cores)`.
#[must_use]
pub fn default_concurrency() -> usize {
    let cores = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    MIN_DEFAULT_WORKERS.max(cores * 2)
}

/// Errors that abort a compiler run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompileError {
    /// Classification lists are unreadable, duplicated or conflicting.
    #[error(transparent)]
    Rules(#[from] RuleError),

    /// A template's account databases could not be read.
    #[error(transparent)]
    Accounts(#[from] AccountError),

    /// Paths from `never` lists exist in their templates.
    #[error("never-listed paths present in templates: {}", format_offenders(.offenders))]
    NeverPathsPresent {
        /// Offending paths per OS version.
        offenders: BTreeMap<String, Vec<String>>,
    },

    /// The walk reached a `never`-listed path.
    #[error("walk reached never-listed path {path} in {os_version}")]
    NeverPathEncountered {
        /// OS version.
        os_version: String,
        /// Offending path.
        path: String,
    },

    /// A template path could not be read.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Filesystem path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Bytes hashed differ from the size reported by `stat`.
    #[error("{} changed while hashing: stat reported {expected} bytes, read {actual}", path.display())]
    LengthChanged {
        /// Filesystem path.
        path: PathBuf,
        /// Length from metadata.
        expected: u64,
        /// Bytes actually read.
        actual: u64,
    },

    /// A template file name is not valid UTF-8.
    #[error("non UTF-8 file name in {}: {name:?}", parent.display())]
    NonUtf8Name {
        /// Directory containing the name.
        parent: PathBuf,
        /// Raw name.
        name: OsString,
    },

    /// Writing the JSON-lines stream failed.
    #[error("failed to emit manifest record: {0}")]
    Emit(#[source] io::Error),

    /// Committing the manifest failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A worker thread panicked.
    #[error("compiler worker panicked")]
    WorkerPanicked,
}

impl CompileError {
    /// Category used for exit codes.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Rules(RuleError::Io { .. })
            | Self::Accounts(_)
            | Self::Io { .. }
            | Self::LengthChanged { .. }
            | Self::Emit(_)
            | Self::Store(StoreError::Database(_)) => ErrorClass::Io,
            Self::Rules(RuleError::Malformed { .. }) | Self::WorkerPanicked => {
                ErrorClass::Internal
            },
            _ => ErrorClass::Data,
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn format_offenders(offenders: &BTreeMap<String, Vec<String>>) -> String {
    offenders
        .iter()
        .map(|(os, paths)| format!("{os}: {}", paths.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything a compiler run needs, owned explicitly instead of through
/// process-wide state.
pub struct CompilerContext {
    template_root: PathBuf,
    rules: RuleStore,
    unprelinker: Arc<dyn Unprelinker>,
    names: Mutex<HashMap<String, Arc<PasswdFiles>>>,
}

impl CompilerContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        template_root: impl Into<PathBuf>,
        rules: RuleStore,
        unprelinker: Arc<dyn Unprelinker>,
    ) -> Self {
        Self {
            template_root: template_root.into(),
            rules,
            unprelinker,
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Root of one version's template.
    #[must_use]
    pub fn version_root(&self, os_version: &str) -> PathBuf {
        self.template_root.join(os_version)
    }

    /// Name tables of one version's template, loaded on first use.
    fn names(&self, os_version: &str) -> Result<Arc<PasswdFiles>, CompileError> {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = names.get(os_version) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(PasswdFiles::load(&self.version_root(os_version))?);
        names.insert(os_version.to_string(), Arc::clone(&table));
        Ok(table)
    }
}

/// Manifest of one OS version produced by a successful run.
#[derive(Debug, Clone)]
pub struct CompiledVersion {
    /// OS version.
    pub os_version: String,
    /// Entries sorted by [`ManifestEntry::key_cmp`].
    pub entries: Vec<ManifestEntry>,
    /// List entries that matched no template path.
    pub stale_rules: Vec<(RuleKind, String)>,
}

/// Result of a successful compiler run.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    /// One manifest per requested version, in request order.
    pub versions: Vec<CompiledVersion>,
}

impl CompileOutput {
    /// Total number of entries across versions.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.versions.iter().map(|v| v.entries.len()).sum()
    }

    /// Batches in the shape [`ManifestStore::replace_versions`] takes.
    #[must_use]
    pub fn into_batches(self) -> Vec<(String, Vec<ManifestEntry>)> {
        self.versions
            .into_iter()
            .map(|v| (v.os_version, v.entries))
            .collect()
    }
}

/// Shared traversal state: pending paths plus the number being visited.
struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

struct QueueState {
    pending: Vec<String>,
    in_flight: usize,
    cancelled: bool,
}

impl WorkQueue {
    fn new(root: String) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: vec![root],
                in_flight: 0,
                cancelled: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next path to visit, or `None` once the walk is finished or cancelled.
    fn next(&self) -> Option<String> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return None;
            }
            if let Some(path) = state.pending.pop() {
                state.in_flight += 1;
                return Some(path);
            }
            if state.in_flight == 0 {
                return None;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Finishes one visit, queueing `children` (already sorted ascending).
    fn complete(&self, children: Vec<String>) {
        let mut state = self.lock();
        // LIFO: push in reverse so the smallest name is visited first.
        state.pending.extend(children.into_iter().rev());
        state.in_flight -= 1;
        drop(state);
        self.ready.notify_all();
    }

    fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        state.in_flight -= 1;
        drop(state);
        self.ready.notify_all();
    }
}

/// Cancels the walk if a visit unwinds before reporting back, so idle
/// workers waiting on its children wake up and exit.
struct VisitGuard<'q> {
    queue: &'q WorkQueue,
    settled: bool,
}

impl Drop for VisitGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.cancel();
        }
    }
}

/// Serialized output of a run: collected entries plus the optional stream.
struct Emitter<'w> {
    entries: Vec<ManifestEntry>,
    stream: Option<&'w mut (dyn Write + Send)>,
}

impl Emitter<'_> {
    fn emit(&mut self, entry: ManifestEntry) -> Result<(), CompileError> {
        if let Some(stream) = self.stream.as_mut() {
            let line = serde_json::to_string(&entry).map_err(|e| CompileError::Emit(e.into()))?;
            writeln!(stream, "{line}").map_err(CompileError::Emit)?;
        }
        self.entries.push(entry);
        Ok(())
    }
}

/// Per-version state shared by the workers of one walk.
struct VersionWalk<'a> {
    os_version: &'a str,
    root: PathBuf,
    rules: &'a RuleSet,
    names: Arc<PasswdFiles>,
    unprelinker: &'a dyn Unprelinker,
}

/// Builds manifests from template trees.
pub struct ManifestCompiler {
    ctx: CompilerContext,
}

impl ManifestCompiler {
    /// Creates a compiler over `ctx`.
    #[must_use]
    pub const fn new(ctx: CompilerContext) -> Self {
        Self { ctx }
    }

    /// The context this compiler was built with.
    #[must_use]
    pub const fn context(&self) -> &CompilerContext {
        &self.ctx
    }

    /// Compiles the manifests of `os_versions` with `concurrency` workers.
    ///
    /// When `stream` is given, every entry is also written to it as one
    /// JSON line as soon as it is produced.
    ///
    /// # Errors
    ///
    /// Any error aborts the whole run; see [`CompileError`].
    pub fn compile(
        &self,
        os_versions: &[String],
        concurrency: usize,
        mut stream: Option<&mut (dyn Write + Send)>,
    ) -> Result<CompileOutput, CompileError> {
        let rule_sets = os_versions
            .iter()
            .map(|v| self.ctx.rules.load(v))
            .collect::<Result<Vec<_>, _>>()?;

        self.check_never_paths(&rule_sets)?;

        let mut output = CompileOutput::default();
        for rules in &rule_sets {
            let os_version = rules.os_version();
            let walk = VersionWalk {
                os_version,
                root: self.ctx.version_root(os_version),
                rules,
                names: self.ctx.names(os_version)?,
                unprelinker: self.ctx.unprelinker.as_ref(),
            };
            info!(os_version, root = %walk.root.display(), concurrency, "compiling manifest");
            let mut entries = run_walk(
                &walk,
                concurrency.max(1),
                stream.as_mut().map(|s| &mut **s as &mut (dyn Write + Send)),
            )?;
            entries.sort_by(ManifestEntry::key_cmp);

            let stale_rules = rules.unmatched();
            for (kind, path) in &stale_rules {
                warn!(os_version, list = %kind, path = %path, "classification entry matched no template path");
            }
            info!(os_version, entries = entries.len(), stale = stale_rules.len(), "manifest compiled");
            output.versions.push(CompiledVersion {
                os_version: os_version.to_string(),
                entries,
                stale_rules,
            });
        }
        Ok(output)
    }

    /// Compiles and atomically replaces the stored manifests of every
    /// version. Nothing is written unless all versions compiled.
    ///
    /// # Errors
    ///
    /// Returns compile errors, or [`CompileError::Store`] if the commit fails.
    pub fn compile_into_store(
        &self,
        store: &dyn ManifestStore,
        os_versions: &[String],
        concurrency: usize,
        stream: Option<&mut (dyn Write + Send)>,
    ) -> Result<CompileOutput, CompileError> {
        let output = self.compile(os_versions, concurrency, stream)?;
        let batches: Vec<_> = output
            .versions
            .iter()
            .map(|v| (v.os_version.clone(), v.entries.clone()))
            .collect();
        store.replace_versions(&batches)?;
        Ok(output)
    }

    /// Fails if any `never` path of any targeted version exists.
    fn check_never_paths(&self, rule_sets: &[RuleSet]) -> Result<(), CompileError> {
        let mut offenders: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for rules in rule_sets {
            let root = self.ctx.version_root(rules.os_version());
            for path in rules.list(RuleKind::Never) {
                let fs_path = fs_path_of(&root, path);
                match fs::symlink_metadata(&fs_path) {
                    Ok(_) => offenders
                        .entry(rules.os_version().to_string())
                        .or_default()
                        .push(path.to_string()),
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                        ) => {},
                    Err(e) => return Err(CompileError::io(&fs_path, e)),
                }
            }
        }
        if offenders.is_empty() {
            Ok(())
        } else {
            Err(CompileError::NeverPathsPresent { offenders })
        }
    }
}

/// Maps a manifest path onto a filesystem root.
fn fs_path_of(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

fn run_walk(
    walk: &VersionWalk<'_>,
    workers: usize,
    stream: Option<&mut (dyn Write + Send)>,
) -> Result<Vec<ManifestEntry>, CompileError> {
    let queue = WorkQueue::new("/".to_string());
    let emitter = Mutex::new(Emitter {
        entries: Vec::new(),
        stream,
    });
    let failure: Mutex<Option<CompileError>> = Mutex::new(None);

    let panicked = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| scope.spawn(|| worker(walk, &queue, &emitter, &failure)))
            .collect();
        handles
            .into_iter()
            .map(thread::ScopedJoinHandle::join)
            .filter(Result::is_err)
            .count()
    });

    if let Some(err) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
        return Err(err);
    }
    if panicked > 0 {
        return Err(CompileError::WorkerPanicked);
    }
    Ok(emitter
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .entries)
}

fn worker(
    walk: &VersionWalk<'_>,
    queue: &WorkQueue,
    emitter: &Mutex<Emitter<'_>>,
    failure: &Mutex<Option<CompileError>>,
) {
    while let Some(path) = queue.next() {
        let mut guard = VisitGuard {
            queue,
            settled: false,
        };
        let result = visit(walk, &path).and_then(|(entry, children)| {
            emitter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .emit(entry)?;
            Ok(children)
        });
        guard.settled = true;
        match result {
            Ok(children) => queue.complete(children),
            Err(err) => {
                debug!(os_version = walk.os_version, path = %path, error = %err, "cancelling walk");
                failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert(err);
                queue.cancel();
                return;
            },
        }
    }
}

/// Builds the entry for `path` and lists its children if the walk descends.
fn visit(walk: &VersionWalk<'_>, path: &str) -> Result<(ManifestEntry, Vec<String>), CompileError> {
    if walk.rules.contains(RuleKind::Never, path) {
        return Err(CompileError::NeverPathEncountered {
            os_version: walk.os_version.to_string(),
            path: path.to_string(),
        });
    }
    let fs_path = fs_path_of(&walk.root, path);
    let meta = fs::symlink_metadata(&fs_path).map_err(|e| CompileError::io(&fs_path, e))?;
    let entry_type = walk.rules.classify(path);

    let mut entry = ManifestEntry {
        path: path.to_string(),
        os_version: walk.os_version.to_string(),
        entry_type,
        mode: meta.mode(),
        owner: walk
            .names
            .user_name(meta.uid())
            .unwrap_or_else(|| meta.uid().to_string()),
        group: walk
            .names
            .group_name(meta.gid())
            .unwrap_or_else(|| meta.gid().to_string()),
        optional: walk.rules.is_optional(path),
        size: None,
        digest: None,
        link_target: None,
    };

    let mut children = Vec::new();
    match FileKind::from_mode(meta.mode()) {
        FileKind::Regular => capture_content(walk, &fs_path, &meta, &mut entry)?,
        FileKind::Symlink => {
            let target = fs::read_link(&fs_path).map_err(|e| CompileError::io(&fs_path, e))?;
            entry.link_target = Some(target.to_string_lossy().into_owned());
        },
        FileKind::Directory => {
            if entry_type.recursion() == Recursion::Strict {
                children = list_children(&fs_path, path)?;
            }
        },
        FileKind::Special => {},
    }
    Ok((entry, children))
}

fn capture_content(
    walk: &VersionWalk<'_>,
    fs_path: &Path,
    meta: &Metadata,
    entry: &mut ManifestEntry,
) -> Result<(), CompileError> {
    let (digest, len) = match entry.entry_type {
        EntryType::System => {
            let (digest, read) = sha256_file(fs_path).map_err(|e| CompileError::io(fs_path, e))?;
            if read != meta.len() {
                return Err(CompileError::LengthChanged {
                    path: fs_path.to_path_buf(),
                    expected: meta.len(),
                    actual: read,
                });
            }
            (digest, read)
        },
        EntryType::Prelink => walk
            .unprelinker
            .unprelinked_digest(fs_path)
            .map_err(|e| CompileError::io(fs_path, e))?,
        EntryType::Config | EntryType::User | EntryType::NoRecurse => return Ok(()),
    };
    entry.size = Some(len);
    entry.digest = Some(digest);
    Ok(())
}

/// Child manifest paths of a directory, sorted lexicographically.
fn list_children(fs_path: &Path, path: &str) -> Result<Vec<String>, CompileError> {
    let mut names = Vec::new();
    for dirent in fs::read_dir(fs_path).map_err(|e| CompileError::io(fs_path, e))? {
        let dirent = dirent.map_err(|e| CompileError::io(fs_path, e))?;
        let name = dirent
            .file_name()
            .into_string()
            .map_err(|name| CompileError::NonUtf8Name {
                parent: fs_path.to_path_buf(),
                name,
            })?;
        names.push(name);
    }
    names.sort_unstable();
    Ok(names
        .iter()
        .map(|name| join_manifest_path(path, name))
        .collect())
}
