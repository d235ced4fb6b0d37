//! Flag files that request runs.
//!
//! `force` makes the next wake run regardless of schedule. `no-user-dirs`
//! limits the next run to system paths. Both are one-shot: they are removed
//! when a run starts.

use std::fs;
use std::io;
use std::path::PathBuf;

use distguard_core::schedule::Trigger;
use tracing::debug;

/// Locations of the flag files.
#[derive(Debug, Clone)]
pub struct TriggerFiles {
    /// Force flag.
    pub force_file: PathBuf,
    /// System-only flag.
    pub no_user_dirs_file: PathBuf,
    /// Whether runs include user directories when no flag says otherwise.
    pub include_user_dirs: bool,
}

impl TriggerFiles {
    /// Current trigger state.
    ///
    /// # Errors
    ///
    /// Returns an error if a flag's presence cannot be determined.
    pub fn read(&self) -> io::Result<Trigger> {
        let forced = self.force_file.try_exists()?;
        let system_only = self.no_user_dirs_file.try_exists()?;
        Ok(Trigger {
            forced,
            include_user_dirs: self.include_user_dirs && !system_only,
        })
    }

    /// Removes both flags; absent flags are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing flag cannot be removed.
    pub fn consume(&self) -> io::Result<()> {
        for path in [&self.force_file, &self.no_user_dirs_file] {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "consumed trigger flag"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Requests a forced run, optionally limited to system paths.
    ///
    /// # Errors
    ///
    /// Returns an error if a flag cannot be created.
    pub fn request(&self, include_user_dirs: bool) -> io::Result<()> {
        if !include_user_dirs {
            fs::write(&self.no_user_dirs_file, b"")?;
        }
        fs::write(&self.force_file, b"")
    }
}
