//! `distguard verify`: one verification of this host, right now.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use distguard_core::accounts::{AccountDirectory, NssAccounts, PasswdFiles};
use distguard_core::config::DistguardConfig;
use distguard_core::store::SqliteManifestStore;
use distguard_core::verifier::Throttle;
use distguard_core::{CancelFlag, ErrorClass, Verifier, VerifierContext};

use super::{exit_codes, output_error};

/// Arguments of `distguard verify`.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Directory standing for `/` (defaults to `host.root`)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// OS version whose manifest applies (defaults to `host.os_version`)
    #[arg(long)]
    pub os_version: Option<String>,

    /// Host name used for placeholder substitution
    #[arg(long)]
    pub hostname: Option<String>,

    /// Skip user directories (system-only run)
    #[arg(long)]
    pub no_user_dirs: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Do not sleep after hashing
    #[arg(long)]
    pub no_throttle: bool,
}

/// Executes `distguard verify`.
pub fn run(config: DistguardConfig, args: &VerifyArgs) -> u8 {
    let mut config = config;
    if let Some(root) = &args.root {
        config.host.root.clone_from(root);
    }
    if let Some(os_version) = &args.os_version {
        config.host.os_version = Some(os_version.clone());
    }
    if let Some(hostname) = &args.hostname {
        config.host.hostname = Some(hostname.clone());
    }

    let server = match config.server() {
        Ok(server) => server,
        Err(e) => return output_error(args.json, e.class(), &e.to_string()),
    };
    let mut options = match config
        .verify
        .options(config.verify.include_user_dirs && !args.no_user_dirs)
    {
        Ok(options) => options,
        Err(e) => return output_error(args.json, e.class(), &e.to_string()),
    };
    if args.no_throttle {
        options.throttle = Throttle::disabled();
    }

    // A mounted tree is checked against its own account databases.
    let accounts: Arc<dyn AccountDirectory> = if server.root == std::path::Path::new("/") {
        Arc::new(NssAccounts)
    } else {
        match PasswdFiles::load(&server.root) {
            Ok(files) => Arc::new(files),
            Err(e) => return output_error(args.json, ErrorClass::Io, &e.to_string()),
        }
    };

    let store = match SqliteManifestStore::open_existing(&config.store.db_path) {
        Ok(store) => store,
        Err(e) => {
            return output_error(
                args.json,
                e.class(),
                &format!("cannot open {}: {e}", config.store.db_path.display()),
            );
        },
    };

    let verifier = Verifier::new(VerifierContext {
        server,
        accounts,
        unprelinker: Arc::new(config.compile.prelink_tool()),
        options,
        cancel: CancelFlag::new(),
    });
    let report = match verifier.verify_server(&store) {
        Ok(report) => report,
        Err(e) => return output_error(args.json, e.class(), &e.to_string()),
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => return output_error(true, ErrorClass::Internal, &e.to_string()),
        }
    } else {
        print!("{}", report.summary());
    }
    exit_codes::SUCCESS
}
