//! `distguard compile`: rebuild and commit manifests from template trees.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use distguard_core::config::DistguardConfig;
use distguard_core::rules::RuleStore;
use distguard_core::store::SqliteManifestStore;
use distguard_core::{CompilerContext, ErrorClass, ManifestCompiler};

use super::{exit_codes, output_error};

/// Arguments of `distguard compile`.
#[derive(Debug, Args)]
pub struct CompileArgs {
    /// OS versions to compile (repeatable)
    #[arg(long = "os", required = true, num_args = 1..)]
    pub os_versions: Vec<String>,

    /// Template root (defaults to `compile.template_root`)
    #[arg(long)]
    pub templates: Option<PathBuf>,

    /// Classification list directory (defaults to `rules.dir`)
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Worker threads (defaults to `compile.concurrency`)
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Also write every entry as one JSON line to this file
    #[arg(long)]
    pub jsonl: Option<PathBuf>,
}

/// Executes `distguard compile`.
pub fn run(config: &DistguardConfig, args: &CompileArgs) -> u8 {
    let templates = args
        .templates
        .clone()
        .unwrap_or_else(|| config.compile.template_root.clone());
    let rules = args.rules.clone().unwrap_or_else(|| config.rules.dir.clone());
    let workers = args.jobs.unwrap_or_else(|| config.compile.workers());
    if workers == 0 {
        return output_error(false, ErrorClass::Data, "--jobs must be positive");
    }

    let store = match SqliteManifestStore::open(&config.store.db_path) {
        Ok(store) => store,
        Err(e) => {
            return output_error(
                false,
                e.class(),
                &format!("cannot open {}: {e}", config.store.db_path.display()),
            );
        },
    };
    let mut jsonl = match args.jsonl.as_ref().map(File::create).transpose() {
        Ok(file) => file.map(BufWriter::new),
        Err(e) => return output_error(false, ErrorClass::Io, &format!("cannot create JSONL output: {e}")),
    };

    let compiler = ManifestCompiler::new(CompilerContext::new(
        templates,
        RuleStore::new(rules),
        Arc::new(config.compile.prelink_tool()),
    ));
    let stream = jsonl.as_mut().map(|w| w as &mut (dyn Write + Send));
    let output = match compiler.compile_into_store(&store, &args.os_versions, workers, stream) {
        Ok(output) => output,
        Err(e) => return output_error(false, e.class(), &e.to_string()),
    };
    if let Some(writer) = jsonl.as_mut() {
        if let Err(e) = writer.flush() {
            return output_error(false, ErrorClass::Io, &format!("cannot flush JSONL output: {e}"));
        }
    }

    for version in &output.versions {
        println!("{}: {} entries", version.os_version, version.entries.len());
        for (kind, path) in &version.stale_rules {
            println!("  warning: {kind} entry {path} matched nothing");
        }
    }
    exit_codes::SUCCESS
}
