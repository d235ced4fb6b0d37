//! Verification output: discrepancies and scan statistics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of deviation between a live host and its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyKind {
    /// Manifested path absent on the host.
    Missing,
    /// Host path absent from the manifest.
    Extra,
    /// Owner differs.
    OwnerMismatch,
    /// Group differs.
    GroupMismatch,
    /// File type differs.
    Type,
    /// Permission bits differ.
    Permissions,
    /// Symlink target matches no accepted alternative.
    Symlink,
    /// Content length differs.
    Length,
    /// Content digest differs.
    Digest,
    /// Name is disguised in directory listings.
    Hidden,
    /// Owner uid is unknown to the host.
    NoOwner,
    /// Group gid is unknown to the host.
    NoGroup,
    /// Set-id bits on a file owned outside the system id range.
    Setuid,
    /// Directory has more children than the configured threshold.
    BigDirectory,
}

impl DiscrepancyKind {
    /// Stable report name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "MISSING",
            Self::Extra => "EXTRA",
            Self::OwnerMismatch => "OWNER_MISMATCH",
            Self::GroupMismatch => "GROUP_MISMATCH",
            Self::Type => "TYPE",
            Self::Permissions => "PERMISSIONS",
            Self::Symlink => "SYMLINK",
            Self::Length => "LENGTH",
            Self::Digest => "DIGEST",
            Self::Hidden => "HIDDEN",
            Self::NoOwner => "NO_OWNER",
            Self::NoGroup => "NO_GROUP",
            Self::Setuid => "SETUID",
            Self::BigDirectory => "BIG_DIRECTORY",
        }
    }
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deviation found by the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscrepancyRecord {
    /// What kind of deviation.
    pub kind: DiscrepancyKind,
    /// Host path.
    pub path: String,
    /// Value found on the host.
    pub observed: String,
    /// Value the manifest expects.
    pub expected: String,
    /// Shell command that would correct the deviation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl DiscrepancyRecord {
    /// Creates a record without a suggestion.
    #[must_use]
    pub fn new(
        kind: DiscrepancyKind,
        path: impl Into<String>,
        observed: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            observed: observed.into(),
            expected: expected.into(),
            suggestion: None,
        }
    }

    /// Attaches a corrective command (builder pattern).
    #[must_use]
    pub fn suggest(mut self, command: impl Into<String>) -> Self {
        self.suggestion = Some(command.into());
        self
    }
}

impl fmt::Display for DiscrepancyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<14} {} (observed: {}, expected: {})",
            self.kind.as_str(),
            self.path,
            self.observed,
            self.expected
        )?;
        if let Some(cmd) = &self.suggestion {
            write!(f, "\n{:<14} fix: {cmd}", "")?;
        }
        Ok(())
    }
}

/// Quotes a path for inclusion in a suggested shell command.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Counters collected during one verification run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    /// Entries examined.
    pub scanned: u64,
    /// Entries examined under the strict manifest policy.
    pub system_count: u64,
    /// Entries examined under the relaxed user policy.
    pub user_count: u64,
    /// Boundary directories counted but not descended.
    pub no_recurse_count: u64,
    /// Prelinked files hashed.
    pub prelink_files: u64,
    /// Bytes hashed through the unprelinker.
    pub prelink_bytes: u64,
    /// Regular files hashed directly.
    pub sha256_files: u64,
    /// Bytes hashed directly.
    pub sha256_bytes: u64,
    /// Entries skipped because of I/O errors.
    pub skipped: u64,
    /// Run start.
    pub started_at: Option<DateTime<Utc>>,
    /// Run end.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanStats {
    /// Wall-clock duration of the run, if finished.
    #[must_use]
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Whether every scanned entry was attributed to exactly one policy.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.scanned == self.system_count + self.user_count + self.no_recurse_count
    }
}

/// Result of one verification run, handed to the reporting sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Host name.
    pub hostname: String,
    /// OS version the host was checked against.
    pub os_version: String,
    /// Discrepancies in discovery order, MISSING records last.
    pub discrepancies: Vec<DiscrepancyRecord>,
    /// Counters.
    pub stats: ScanStats,
}

impl VerifyReport {
    /// Number of records of the given kind.
    #[must_use]
    pub fn count(&self, kind: DiscrepancyKind) -> usize {
        self.discrepancies.iter().filter(|d| d.kind == kind).count()
    }

    /// Human-readable summary: timing, counts and bytes hashed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self) -> String {
        let s = &self.stats;
        let elapsed = s
            .elapsed()
            .map_or_else(|| "?".to_string(), |d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0));
        let mut out = format!(
            "host {} (os {}): {} discrepancies in {elapsed}\n\
             scanned {} entries: {} system, {} user, {} no-recurse, {} skipped\n\
             hashed {} files / {} bytes directly, {} prelinked files / {} bytes\n",
            self.hostname,
            self.os_version,
            self.discrepancies.len(),
            s.scanned,
            s.system_count,
            s.user_count,
            s.no_recurse_count,
            s.skipped,
            s.sha256_files,
            s.sha256_bytes,
            s.prelink_files,
            s.prelink_bytes,
        );
        for record in &self.discrepancies {
            out.push_str(&record.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_as_report_names() {
        let json = serde_json::to_string(&DiscrepancyKind::OwnerMismatch).unwrap();
        assert_eq!(json, "\"OWNER_MISMATCH\"");
        assert_eq!(DiscrepancyKind::BigDirectory.to_string(), "BIG_DIRECTORY");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn record_display_includes_fix() {
        let record = DiscrepancyRecord::new(DiscrepancyKind::Permissions, "/etc/hosts", "600", "644")
            .suggest("chmod 644 '/etc/hosts'");
        let text = record.to_string();
        assert!(text.starts_with("PERMISSIONS"));
        assert!(text.contains("fix: chmod 644 '/etc/hosts'"));
    }

    #[test]
    fn consistency_checks_policy_counts() {
        let mut stats = ScanStats {
            scanned: 5,
            system_count: 3,
            user_count: 1,
            no_recurse_count: 1,
            ..ScanStats::default()
        };
        assert!(stats.is_consistent());
        stats.scanned += 1;
        assert!(!stats.is_consistent());
    }
}
