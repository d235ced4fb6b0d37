//! Subcommand implementations.
//!
//! Each command returns its process exit code. Fatal errors are printed to
//! stderr and mapped through [`exit_code_for`]; discrepancies found by a
//! verification are output, not errors.

use std::path::Path;

use distguard_core::ErrorClass;
use distguard_core::config::{ConfigError, DistguardConfig};
use serde::Serialize;

pub mod compile;
pub mod force;
pub mod manifest;
pub mod verify;

/// Exit codes for distguard commands.
pub mod exit_codes {
    /// Success exit code.
    pub const SUCCESS: u8 = 0;
    /// Filesystem, process or database I/O failed.
    pub const IO_ERROR: u8 = 1;
    /// Invalid input, configuration or manifest data.
    pub const DATA_ERROR: u8 = 2;
    /// Internal consistency check failed.
    pub const INTERNAL_ERROR: u8 = 3;
    /// Interrupted by a signal.
    pub const INTERRUPTED: u8 = 130;
}

/// Exit code for an error class.
#[must_use]
pub const fn exit_code_for(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::Io => exit_codes::IO_ERROR,
        ErrorClass::Data => exit_codes::DATA_ERROR,
        ErrorClass::Internal => exit_codes::INTERNAL_ERROR,
        ErrorClass::Interrupted => exit_codes::INTERRUPTED,
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    class: &'a str,
    message: &'a str,
}

/// Prints an error in the requested format and returns its exit code.
pub fn output_error(json_output: bool, class: ErrorClass, message: &str) -> u8 {
    if json_output {
        let error = ErrorResponse {
            class: match class {
                ErrorClass::Io => "io",
                ErrorClass::Data => "data",
                ErrorClass::Internal => "internal",
                ErrorClass::Interrupted => "interrupted",
            },
            message,
        };
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&error).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        eprintln!("Error: {message}");
    }
    exit_code_for(class)
}

/// Loads the configuration file; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<DistguardConfig, ConfigError> {
    if path.exists() {
        DistguardConfig::from_file(path)
    } else {
        tracing::debug!(path = %path.display(), "no configuration file, using defaults");
        Ok(DistguardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_map_to_distinct_codes() {
        let codes = [
            exit_code_for(ErrorClass::Io),
            exit_code_for(ErrorClass::Data),
            exit_code_for(ErrorClass::Internal),
            exit_code_for(ErrorClass::Interrupted),
        ];
        assert_eq!(codes, [1, 2, 3, 130]);
    }

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.verify.run_hour, 3);
    }

    #[test]
    fn invalid_config_is_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("distguard.toml");
        std::fs::write(&path, "[verify]\nrun_hour = 99\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert_eq!(exit_code_for(err.class()), exit_codes::DATA_ERROR);
    }
}
