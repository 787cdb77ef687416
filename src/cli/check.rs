//! `burrow check`

use super::Context;
use crate::archive::checker::CheckOptions;
use crate::archive::ArchiveChecker;
use crate::helpers::Location;
use crate::key::InteractivePassphrase;
use anyhow::bail;
use clap::Args;
use tracing::{info, warn};

#[derive(Args)]
pub struct CheckArgs {
    /// Repository to check
    pub repository: Location,

    /// Only perform repository checks
    #[arg(long, conflicts_with = "archives_only")]
    pub repository_only: bool,

    /// Only perform archive checks
    #[arg(long)]
    pub archives_only: bool,

    /// Attempt to repair any inconsistencies found
    #[arg(long)]
    pub repair: bool,

    /// Decrypt and verify every object
    #[arg(long)]
    pub verify_data: bool,
}

pub fn run(args: CheckArgs, context: &Context) -> anyhow::Result<bool> {
    if args.repository.archive.is_some() {
        bail!("{}: check works on whole repositories", args.repository);
    }
    if args.repair {
        warn!("Repair mode writes to the repository; keep a copy of it if the data matters");
    }
    let mut repository = context.open_repository(&args.repository, true)?;
    let mut ok = true;
    if !args.archives_only {
        info!("Starting repository check...");
        if repository.check(args.repair)? {
            info!("Repository check complete, no problems found.");
        } else {
            ok = false;
        }
    }
    if !args.repository_only {
        let options = CheckOptions {
            repair: args.repair,
            verify_data: args.verify_data,
        };
        let mut checker = ArchiveChecker::new();
        ok &= checker.check(
            &mut repository,
            &context.config.paths.keys_dir,
            &mut InteractivePassphrase,
            options,
        )?;
    }
    Ok(ok)
}
