//! distguard-core - distribution integrity checking
//!
//! Builds a reference manifest of every path in an operating-system template
//! and verifies live hosts against it.
//!
//! # Modules
//!
//! - [`compiler`]: walks template trees and produces [`manifest::ManifestEntry`]
//!   records
//! - [`verifier`]: walks a live host and reports deviations from the manifest
//! - [`rules`]: per-OS-version classification lists
//! - [`store`]: manifest persistence (`SQLite`)
//! - [`digest`]: SHA-256 content digests shared by both phases
//! - [`prelink`]: canonical hashing of prelinked executables
//! - [`accounts`]: account and group directory lookups
//! - [`schedule`]: when a verification run is due
//! - [`config`]: TOML configuration
//! - [`persist`]: atomic file replacement

pub mod accounts;
pub mod compiler;
pub mod config;
pub mod digest;
pub mod manifest;
pub mod persist;
pub mod prelink;
pub mod report;
pub mod rules;
pub mod schedule;
pub mod store;
pub mod verifier;

pub use compiler::{CompileError, CompileOutput, CompilerContext, ManifestCompiler};
pub use manifest::{EntryType, ManifestEntry};
pub use report::{DiscrepancyKind, DiscrepancyRecord, ScanStats, VerifyReport};
pub use verifier::{CancelFlag, ManifestSnapshot, Server, VerifyError, Verifier, VerifierContext};

/// Broad category of a fatal error, used to pick process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Filesystem, process or database I/O failed.
    Io,
    /// Input data or configuration is invalid.
    Data,
    /// An internal invariant was violated.
    Internal,
    /// The run was cancelled.
    Interrupted,
}
