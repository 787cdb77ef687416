//! `burrow init`

use super::Context;
use crate::cache::Cache;
use crate::helpers::Location;
use crate::key::{Compression, InteractivePassphrase, Key, KeyMode};
use crate::manifest::{Manifest, ManifestConfig};
use crate::repository::Repository;
use anyhow::bail;
use clap::Args;
use tracing::{info, warn};

#[derive(Args)]
pub struct InitArgs {
    /// Repository to create
    pub repository: Location,

    /// Encryption mode: none, passphrase or keyfile
    #[arg(short, long)]
    pub encryption: Option<KeyMode>,

    /// Compression: none, zlib[,N] or zstd[,N]
    #[arg(short = 'C', long)]
    pub compression: Option<Compression>,
}

pub fn run(args: InitArgs, context: &Context) -> anyhow::Result<bool> {
    if args.repository.archive.is_some() {
        bail!("{}: init expects a repository, not an archive", args.repository);
    }
    let config = &context.config;
    let mode = args.encryption.unwrap_or(config.repository.encryption);
    let compression = match args.compression {
        Some(compression) => compression,
        None => config.compression()?,
    };

    info!("Initializing repository at \"{}\"", args.repository.path.display());
    let mut repository = Repository::create(&args.repository.path, config.lock_wait())?;
    let key = Key::create(
        &repository,
        mode,
        compression,
        &config.paths.keys_dir,
        &mut InteractivePassphrase,
    )?;
    if mode == KeyMode::None {
        warn!("Repository is not encrypted");
    }
    let mut manifest = Manifest::new(ManifestConfig { chunker: config.chunker });
    manifest.write(&mut repository, &key)?;
    repository.commit()?;
    Cache::open(&config.paths.cache_dir, &mut repository, &key, &manifest, config.lock_wait())?;
    Ok(true)
}
