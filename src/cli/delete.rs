//! `burrow delete`

use super::{require_archive, totals, Context};
use crate::archive::Archive;
use crate::helpers::{Location, Statistics};
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct DeleteArgs {
    /// Print statistics for the deleted archive
    #[arg(short, long)]
    pub stats: bool,

    /// Archive to delete
    pub archive: Location,
}

pub fn run(args: DeleteArgs, context: &Context) -> anyhow::Result<bool> {
    let name = require_archive(&args.archive)?;
    let mut repository = context.open_repository(&args.archive, true)?;
    let (mut manifest, key) = context.load_manifest(&mut repository)?;
    let mut cache = context.open_cache(&mut repository, &key, &manifest)?;

    let mut stats = Statistics::default();
    let mut archive = Archive::open(&mut repository, &key, &mut manifest, Some(&mut cache), name)?;
    archive.delete(&mut stats)?;
    drop(archive);
    manifest.write(&mut repository, &key)?;
    repository.commit()?;
    cache.commit(&manifest)?;
    info!("Archive {} deleted", name);

    if args.stats {
        println!("{}", Statistics::header());
        println!("{}", stats.summary("Deleted data:"));
        println!("{}", totals(&cache).summary("All archives:"));
    }
    Ok(true)
}
