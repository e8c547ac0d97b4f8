//! Thin CLI shell over the core library (§13): argument parsing, logger
//! init, and mapping errors to a process exit code. No business logic.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use itertools::Itertools;
use log::info;

use mobilecombackup::{
    cancel::CancellationToken,
    config::Config,
    orchestrator::{coalesce, manifest, open_repository, validate, Repository},
};

#[derive(Parser)]
#[command(name = "mobilecombackup", version, about = "Phone backup XML ingestion and repository tooling")]
struct Cli {
    /// Repository root (overrides MOBILECOMBACKUP_REPO_ROOT).
    #[arg(long, global = true)]
    repo_root: Option<PathBuf>,

    /// Raise logging to debug.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Manifest generator identifier (overrides MOBILECOMBACKUP_GENERATOR_ID).
    #[arg(long, global = true)]
    generator_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one or more archive files into the repository.
    Import {
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },
    /// Check every year file's declared count and year consistency.
    Validate,
    /// Rebuild files.yaml and its checksum sidecar.
    Manifest,
    /// Create a new, empty repository at the configured root.
    Init,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::resolve(cli.repo_root, cli.verbose, cli.generator_id);
    let cancel = CancellationToken::new();

    match cli.command {
        Command::Init => {
            Repository::init(&config.repo_root)
                .with_context(|| format!("initializing repository at {}", config.repo_root.display()))?;
            info!("initialized repository at {}", config.repo_root.display());
        }
        Command::Import { archives } => {
            let repo = open_repository(&config.repo_root)
                .with_context(|| format!("opening repository at {}", config.repo_root.display()))?;
            let report = coalesce(&repo, &archives, &cancel).context("ingesting archives")?;
            info!(
                "ingested {} archive(s): {} new, {} duplicate, {} rejected",
                archives.iter().map(|p| p.display().to_string()).join(", "),
                report.new,
                report.duplicate,
                report.rejected,
            );
        }
        Command::Validate => {
            let repo = open_repository(&config.repo_root)
                .with_context(|| format!("opening repository at {}", config.repo_root.display()))?;
            let report = validate(&repo, &cancel).context("validating repository")?;
            info!(
                "checked {} file(s): {} count mismatch(es), {} year mismatch(es)",
                report.files_checked,
                report.count_mismatches.len(),
                report.year_mismatches.len(),
            );
            if !report.is_clean() {
                anyhow::bail!("repository validation found inconsistencies");
            }
        }
        Command::Manifest => {
            let repo = open_repository(&config.repo_root)
                .with_context(|| format!("opening repository at {}", config.repo_root.display()))?;
            let built = manifest(&repo, &config.generator_id).context("building manifest")?;
            info!("wrote manifest with {} file(s)", built.files.len());
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("error: {err:?}");
            ExitCode::from(1)
        }
    }
}
