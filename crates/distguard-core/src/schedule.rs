//! When a verification run is due.
//!
//! A run happens when it is forced, or when the minimum interval since the
//! last successful run has elapsed and the local hour is the configured run
//! hour. The last-run timestamp is persisted before a report is handed off so
//! a crash during delivery does not make the host look freshly verified
//! forever, nor skip the next window.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persist::atomic_write;

/// Default minimum time between scheduled runs.
pub const DEFAULT_MIN_INTERVAL_HOURS: i64 = 12;

/// Externally supplied run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    /// Run on the next wake regardless of schedule.
    pub forced: bool,
    /// Walk user directories on this run.
    pub include_user_dirs: bool,
}

/// Why a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    /// A force flag was present.
    Forced,
    /// The schedule window is open.
    Scheduled,
}

/// Outcome of [`RunSchedule::should_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDecision {
    /// Start a run now.
    Run {
        /// Why.
        reason: RunReason,
        /// Walk user directories.
        include_user_dirs: bool,
    },
    /// Nothing to do on this wake.
    Wait,
}

/// Daily run window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSchedule {
    /// Local hour (0-23) in which scheduled runs start.
    pub run_hour: u32,
    /// Minimum time since the last successful run.
    pub min_interval: Duration,
}

impl RunSchedule {
    /// Creates a schedule with the default 12 hour interval.
    #[must_use]
    pub fn new(run_hour: u32) -> Self {
        Self {
            run_hour,
            min_interval: Duration::hours(DEFAULT_MIN_INTERVAL_HOURS),
        }
    }

    /// Decides whether to run at `now`, a time in the host's local zone.
    #[must_use]
    pub fn should_run<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
        last_run: Option<DateTime<Utc>>,
        trigger: Trigger,
    ) -> RunDecision {
        let run = |reason| RunDecision::Run {
            reason,
            include_user_dirs: trigger.include_user_dirs,
        };
        if trigger.forced {
            return run(RunReason::Forced);
        }
        let interval_passed =
            last_run.is_none_or(|last| now.with_timezone(&Utc) - last >= self.min_interval);
        if interval_passed && now.hour() == self.run_hour {
            run(RunReason::Scheduled)
        } else {
            RunDecision::Wait
        }
    }
}

/// Errors loading or saving [`RunState`].
#[derive(Debug, Error)]
pub enum StateError {
    /// The state file could not be read or written.
    #[error("state file {}: {source}", path.display())]
    Io {
        /// State file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The state file is not valid JSON.
    #[error("state file {} is corrupt: {source}", path.display())]
    Corrupt {
        /// State file.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Completion time of the last successful run.
    pub last_run: Option<DateTime<Utc>>,
}

impl RunState {
    /// Loads the state; a missing file is the empty state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the file exists but is unreadable or corrupt.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            },
        };
        serde_json::from_slice(&content).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Atomically replaces the state file.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] on write failure.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_vec_pretty(self).map_err(|e| io_err(e.into()))?;
        atomic_write(path, &json).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;

    use super::*;

    const IDLE: Trigger = Trigger {
        forced: false,
        include_user_dirs: true,
    };

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, 30, 0).unwrap()
    }

    #[test]
    fn first_run_waits_for_run_hour() {
        let schedule = RunSchedule::new(3);
        assert_eq!(schedule.should_run(&at(2), None, IDLE), RunDecision::Wait);
        assert_eq!(
            schedule.should_run(&at(3), None, IDLE),
            RunDecision::Run {
                reason: RunReason::Scheduled,
                include_user_dirs: true
            }
        );
    }

    #[test]
    fn recent_run_blocks_window() {
        let schedule = RunSchedule::new(3);
        let last = at(3) - Duration::hours(11);
        assert_eq!(schedule.should_run(&at(3), Some(last), IDLE), RunDecision::Wait);
        let last = at(3) - Duration::hours(12);
        assert!(matches!(
            schedule.should_run(&at(3), Some(last), IDLE),
            RunDecision::Run { .. }
        ));
    }

    #[test]
    fn force_overrides_schedule() {
        let schedule = RunSchedule::new(3);
        let trigger = Trigger {
            forced: true,
            include_user_dirs: false,
        };
        assert_eq!(
            schedule.should_run(&at(15), Some(at(14)), trigger),
            RunDecision::Run {
                reason: RunReason::Forced,
                include_user_dirs: false
            }
        );
    }

    #[test]
    fn run_hour_is_local() {
        let schedule = RunSchedule::new(3);
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        // 01:30 UTC is 03:30 at UTC+2.
        let now = at(1).with_timezone(&tz);
        assert!(matches!(schedule.should_run(&now, None, IDLE), RunDecision::Run { .. }));
    }

    #[test]
    fn state_round_trips_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert_eq!(RunState::load(&path).unwrap(), RunState::default());

        let state = RunState {
            last_run: Some(at(4)),
        };
        state.save(&path).unwrap();
        assert_eq!(RunState::load(&path).unwrap(), state);

        fs::write(&path, "not json").unwrap();
        assert!(matches!(RunState::load(&path), Err(StateError::Corrupt { .. })));
    }
}
