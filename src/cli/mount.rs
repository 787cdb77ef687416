//! `burrow mount`

use super::Context;
use crate::helpers::Location;
use crate::mount::{self, ArchiveTree};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct MountArgs {
    /// Stay in foreground, do not daemonize
    #[arg(short, long)]
    pub foreground: bool,

    /// Extra mount options
    #[arg(short = 'o', value_name = "OPTIONS", value_delimiter = ',')]
    pub options: Vec<String>,

    /// Repository or archive to mount
    pub location: Location,

    /// Where to mount the filesystem
    pub mountpoint: PathBuf,
}

pub fn run(args: MountArgs, context: &Context) -> anyhow::Result<bool> {
    if !args.mountpoint.is_dir() {
        anyhow::bail!("{}: mountpoint must be a writable directory", args.mountpoint.display());
    }
    let mut repository = context.open_repository(&args.location, false)?;
    let (manifest, key) = context.load_manifest(&mut repository)?;
    let tree = ArchiveTree::new(repository, key, manifest, args.location.archive.as_deref())?;
    info!(mountpoint = %args.mountpoint.display(), "mounting {}", args.location);
    mount::mount(tree, &args.mountpoint, &args.options, args.foreground)?;
    Ok(true)
}
