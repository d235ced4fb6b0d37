//! `distguard manifest`: inspect stored manifests.

use std::fmt::Write as _;

use clap::{Args, Subcommand};
use distguard_core::config::DistguardConfig;
use distguard_core::manifest::format_permissions;
use distguard_core::store::SqliteManifestStore;
use distguard_core::{ErrorClass, ManifestEntry, ManifestSnapshot};

use super::{exit_codes, output_error};

/// Manifest command group.
#[derive(Debug, Args)]
pub struct ManifestCommand {
    /// Print entries as JSON.
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub subcommand: ManifestSubcommand,
}

/// Manifest subcommands.
#[derive(Debug, Subcommand)]
pub enum ManifestSubcommand {
    /// Print the stored entries of one OS version.
    Show(ShowArgs),
}

/// Arguments for `distguard manifest show`.
#[derive(Debug, Args)]
pub struct ShowArgs {
    /// OS version.
    #[arg(long = "os")]
    pub os_version: String,

    /// Print only this path.
    #[arg(long)]
    pub path: Option<String>,
}

/// Executes a manifest subcommand.
pub fn run(config: &DistguardConfig, cmd: &ManifestCommand) -> u8 {
    match &cmd.subcommand {
        ManifestSubcommand::Show(args) => run_show(config, args, cmd.json),
    }
}

fn run_show(config: &DistguardConfig, args: &ShowArgs, json_output: bool) -> u8 {
    let store = match SqliteManifestStore::open_existing(&config.store.db_path) {
        Ok(store) => store,
        Err(e) => {
            return output_error(
                json_output,
                e.class(),
                &format!("cannot open {}: {e}", config.store.db_path.display()),
            );
        },
    };
    let snapshot = match ManifestSnapshot::load(&store, &args.os_version) {
        Ok(snapshot) => snapshot,
        Err(e) => return output_error(json_output, e.class(), &e.to_string()),
    };

    let entries: &[ManifestEntry] = match &args.path {
        Some(path) => match snapshot.find(path) {
            Some(index) => std::slice::from_ref(&snapshot.entries()[index]),
            None => {
                return output_error(
                    json_output,
                    ErrorClass::Data,
                    &format!("{path} is not in the {} manifest", args.os_version),
                );
            },
        },
        None => snapshot.entries(),
    };

    if json_output {
        match serde_json::to_string_pretty(entries) {
            Ok(json) => println!("{json}"),
            Err(e) => return output_error(true, ErrorClass::Internal, &e.to_string()),
        }
    } else {
        for entry in entries {
            println!("{}", format_entry(entry));
        }
    }
    exit_codes::SUCCESS
}

/// One line per entry: type, permissions, ownership, path and content.
fn format_entry(entry: &ManifestEntry) -> String {
    let mut line = format!(
        "{:<10} {:>4} {}:{} {}",
        entry.entry_type.as_str(),
        format_permissions(entry.mode),
        entry.owner,
        entry.group,
        entry.path
    );
    if entry.optional {
        line.push_str(" (optional)");
    }
    if let (Some(size), Some(digest)) = (entry.size, entry.digest) {
        let _ = write!(line, " size={size} sha256={digest}");
    }
    if let Some(target) = &entry.link_target {
        let _ = write!(line, " -> {target}");
    }
    line
}
