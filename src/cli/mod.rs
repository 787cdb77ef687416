//! Command-line interface.
//!
//! One module per subcommand, each with its clap `Args` and a `run`
//! function returning whether the command finished without reporting
//! errors.

use crate::cache::Cache;
use crate::config::Config;
use crate::helpers::{Location, Statistics};
use crate::key::{InteractivePassphrase, Key};
use crate::logging::LogFormat;
use crate::manifest::Manifest;
use crate::repository::Repository;
use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub mod change_passphrase;
pub mod check;
pub mod create;
pub mod delete;
pub mod extract;
pub mod info;
pub mod init;
pub mod list;
pub mod mount;
pub mod prune;

/// burrow - deduplicating, encrypting backup archiver
#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Deduplicating, encrypting backup archiver")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Configuration file
    #[arg(long, global = true, env = "BURROW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize an empty repository
    Init(init::InitArgs),
    /// Check repository consistency
    Check(check::CheckArgs),
    /// Change repository key file passphrase
    ChangePassphrase(change_passphrase::ChangePassphraseArgs),
    /// Create new archive
    Create(create::CreateArgs),
    /// Extract archive contents
    Extract(extract::ExtractArgs),
    /// Delete an archive
    Delete(delete::DeleteArgs),
    /// List archive or repository contents
    List(list::ListArgs),
    /// Show archive details such as disk space
    Info(info::InfoArgs),
    /// Mount archive or an entire repository as a FUSE filesystem
    Mount(mount::MountArgs),
    /// Prune repository archives according to specified rules
    Prune(prune::PruneArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// State shared by all commands
pub struct Context {
    pub config: Config,
}

impl Context {
    pub fn open_repository(&self, location: &Location, exclusive: bool) -> anyhow::Result<Repository> {
        Repository::open(&location.path, exclusive, self.config.lock_wait())
            .with_context(|| format!("cannot open repository {}", location.path.display()))
    }

    /// Load the manifest, asking for the passphrase when needed
    pub fn load_manifest(&self, repository: &mut Repository) -> anyhow::Result<(Manifest, Key)> {
        let (manifest, key) =
            Manifest::load(repository, &self.config.paths.keys_dir, &mut InteractivePassphrase)?;
        Ok((manifest, key))
    }

    pub fn open_cache(&self, repository: &mut Repository, key: &Key, manifest: &Manifest) -> anyhow::Result<Cache> {
        Ok(Cache::open(
            &self.config.paths.cache_dir,
            repository,
            key,
            manifest,
            self.config.lock_wait(),
        )?)
    }
}

/// Archive name of a `REPO::ARCHIVE` location
pub fn require_archive(location: &Location) -> anyhow::Result<&str> {
    location
        .archive
        .as_deref()
        .ok_or_else(|| anyhow!("{}: an archive name is required (REPOSITORY::ARCHIVE)", location))
}

/// Sizes over every chunk in the repository
pub fn totals(cache: &Cache) -> Statistics {
    let (total_size, total_csize, _, unique_csize, _, _) = cache.chunks().summarize();
    Statistics {
        original_size: total_size as i64,
        compressed_size: total_csize as i64,
        deduplicated_size: unique_csize as i64,
        nfiles: 0,
    }
}

pub fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let context = Context { config };
    match cli.command {
        Commands::Init(args) => init::run(args, &context),
        Commands::Check(args) => check::run(args, &context),
        Commands::ChangePassphrase(args) => change_passphrase::run(args, &context),
        Commands::Create(args) => create::run(args, &context),
        Commands::Extract(args) => extract::run(args, &context),
        Commands::Delete(args) => delete::run(args, &context),
        Commands::List(args) => list::run(args, &context),
        Commands::Info(args) => info::run(args, &context),
        Commands::Mount(args) => mount::run(args, &context),
        Commands::Prune(args) => prune::run(args, &context),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "burrow", "-v", "create", "--stats", "-e", "*.tmp", "/backup::monday", "/home", "/etc",
        ])
        .expect("valid command line");
        assert!(cli.verbose);
        match cli.command {
            Commands::Create(args) => {
                assert!(args.stats);
                assert_eq!(args.archive.archive.as_deref(), Some("monday"));
                assert_eq!(args.paths.len(), 2);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_remote_location_rejected() {
        assert!(Cli::try_parse_from(["burrow", "list", "host:/backup"]).is_err());
    }
}
