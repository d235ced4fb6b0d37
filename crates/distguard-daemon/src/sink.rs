//! Report delivery.
//!
//! A [`ReportSink`] receives every completed verification report. The
//! daemon writes each report as a JSON file for the central collector and
//! also logs it.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use distguard_core::VerifyReport;
use distguard_core::persist::atomic_write;
use thiserror::Error;
use tracing::{info, warn};

/// Report delivery errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The report file could not be written.
    #[error("failed to write report {}: {source}", path.display())]
    Io {
        /// Report file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The report could not be serialized.
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Receives completed reports.
pub trait ReportSink: Send + Sync {
    /// Delivers one report.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if delivery fails.
    fn deliver(&self, report: &VerifyReport) -> Result<(), SinkError>;
}

/// Writes `<dir>/<host>-<timestamp>.json` atomically.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    /// Creates a sink writing into `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File a report is written to.
    #[must_use]
    pub fn report_path(&self, report: &VerifyReport) -> PathBuf {
        let finished = report.stats.finished_at.unwrap_or_else(Utc::now);
        self.dir.join(format!(
            "{}-{}.json",
            sanitize(&report.hostname),
            finished.format("%Y%m%dT%H%M%SZ")
        ))
    }

    /// Report directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Keeps host names from escaping the report directory.
fn sanitize(hostname: &str) -> String {
    hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

impl ReportSink for JsonFileSink {
    fn deliver(&self, report: &VerifyReport) -> Result<(), SinkError> {
        let path = self.report_path(report);
        let json = serde_json::to_vec_pretty(report)?;
        atomic_write(&path, &json).map_err(|source| SinkError::Io {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), discrepancies = report.discrepancies.len(), "report written");
        Ok(())
    }
}

/// Logs the summary and every discrepancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn deliver(&self, report: &VerifyReport) -> Result<(), SinkError> {
        let stats = &report.stats;
        info!(
            hostname = %report.hostname,
            os_version = %report.os_version,
            discrepancies = report.discrepancies.len(),
            scanned = stats.scanned,
            system = stats.system_count,
            user = stats.user_count,
            no_recurse = stats.no_recurse_count,
            skipped = stats.skipped,
            sha256_bytes = stats.sha256_bytes,
            prelink_bytes = stats.prelink_bytes,
            "verification report"
        );
        for record in &report.discrepancies {
            warn!(
                kind = %record.kind,
                path = %record.path,
                observed = %record.observed,
                expected = %record.expected,
                suggestion = record.suggestion.as_deref().unwrap_or(""),
                "discrepancy"
            );
        }
        Ok(())
    }
}
