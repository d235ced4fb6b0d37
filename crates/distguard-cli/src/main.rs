//! distguard - distribution integrity operator CLI
//!
//! Compiles reference manifests from OS templates, inspects them, and runs
//! ad-hoc verifications of this host.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use distguard_core::config::DEFAULT_CONFIG_PATH;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::compile::CompileArgs;
use commands::force::ForceArgs;
use commands::manifest::ManifestCommand;
use commands::verify::VerifyArgs;

/// distguard - distribution integrity checks
#[derive(Parser, Debug)]
#[command(name = "distguard")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify this host against its manifest now
    Verify(VerifyArgs),

    /// Compile manifests from template trees and commit them
    Compile(CompileArgs),

    /// Inspect stored manifests
    Manifest(ManifestCommand),

    /// Ask distguardd to run on its next wake
    Force(ForceArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match commands::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            let code = commands::output_error(false, e.class(), &e.to_string());
            std::process::exit(i32::from(code));
        },
    };

    let exit_code = match &cli.command {
        Commands::Verify(args) => commands::verify::run(config, args),
        Commands::Compile(args) => commands::compile::run(&config, args),
        Commands::Manifest(cmd) => commands::manifest::run(&config, cmd),
        Commands::Force(args) => commands::force::run(&config, args),
    };
    std::process::exit(i32::from(exit_code));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compile_with_repeated_versions() {
        let cli = Cli::try_parse_from([
            "distguard", "compile", "--os", "7", "--os", "8", "--jobs", "2", "--jsonl", "/tmp/m.jsonl",
        ])
        .unwrap();
        let Commands::Compile(args) = cli.command else {
            panic!("expected compile");
        };
        assert_eq!(args.os_versions, vec!["7", "8"]);
        assert_eq!(args.jobs, Some(2));
    }

    #[test]
    fn compile_requires_a_version() {
        assert!(Cli::try_parse_from(["distguard", "compile"]).is_err());
    }

    #[test]
    fn parses_verify_flags() {
        let cli = Cli::try_parse_from([
            "distguard", "verify", "--root", "/mnt/h", "--os-version", "8", "--no-user-dirs", "--json",
            "--no-throttle",
        ])
        .unwrap();
        let Commands::Verify(args) = cli.command else {
            panic!("expected verify");
        };
        assert!(args.no_user_dirs && args.json && args.no_throttle);
        assert_eq!(args.root, Some(PathBuf::from("/mnt/h")));
    }

    #[test]
    fn parses_manifest_show() {
        let cli =
            Cli::try_parse_from(["distguard", "manifest", "show", "--os", "8", "--path", "/etc"])
                .unwrap();
        assert!(matches!(cli.command, Commands::Manifest(_)));
    }
}
