//! `distguard force`: ask the daemon to run on its next wake.

use clap::Args;
use distguard_core::ErrorClass;
use distguard_core::config::DistguardConfig;
use distguard_daemon::TriggerFiles;

use super::{exit_codes, output_error};

/// Arguments of `distguard force`.
#[derive(Debug, Args)]
pub struct ForceArgs {
    /// Limit the forced run to system paths
    #[arg(long)]
    pub no_user_dirs: bool,
}

/// Executes `distguard force`.
pub fn run(config: &DistguardConfig, args: &ForceArgs) -> u8 {
    let triggers = TriggerFiles {
        force_file: config.daemon.force_file.clone(),
        no_user_dirs_file: config.daemon.no_user_dirs_file.clone(),
        include_user_dirs: config.verify.include_user_dirs,
    };
    if let Err(e) = triggers.request(!args.no_user_dirs) {
        return output_error(
            false,
            ErrorClass::Io,
            &format!("cannot write {}: {e}", triggers.force_file.display()),
        );
    }
    let scope = if args.no_user_dirs { "system-only" } else { "full" };
    println!("{scope} verification requested; distguardd runs it on its next wake");
    exit_codes::SUCCESS
}
