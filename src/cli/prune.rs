//! `burrow prune`

use super::{totals, Context};
use crate::archive::Archive;
use crate::helpers::{
    format_archive, prune_split, prune_within, Location, Statistics, PRUNE_DAILY, PRUNE_HOURLY, PRUNE_MONTHLY,
    PRUNE_WEEKLY, PRUNE_YEARLY,
};
use crate::manifest::ArchiveInfo;
use anyhow::bail;
use chrono::{DateTime, Utc};
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct PruneArgs {
    /// Do not change the repository
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Print statistics for the deleted archives
    #[arg(short, long)]
    pub stats: bool,

    /// Keep all archives within this time interval, e.g. 10d or 2w
    #[arg(long, value_name = "WITHIN")]
    pub keep_within: Option<String>,

    /// Number of hourly archives to keep
    #[arg(short = 'H', long, default_value_t = 0)]
    pub keep_hourly: usize,

    /// Number of daily archives to keep
    #[arg(short = 'd', long, default_value_t = 0)]
    pub keep_daily: usize,

    /// Number of weekly archives to keep
    #[arg(short = 'w', long, default_value_t = 0)]
    pub keep_weekly: usize,

    /// Number of monthly archives to keep
    #[arg(short = 'm', long, default_value_t = 0)]
    pub keep_monthly: usize,

    /// Number of yearly archives to keep
    #[arg(short = 'y', long, default_value_t = 0)]
    pub keep_yearly: usize,

    /// Only consider archive names starting with this prefix
    #[arg(short, long)]
    pub prefix: Option<String>,

    /// Repository to prune
    pub repository: Location,
}

impl PruneArgs {
    fn has_rules(&self) -> bool {
        self.keep_within.is_some()
            || self.keep_hourly + self.keep_daily + self.keep_weekly + self.keep_monthly + self.keep_yearly > 0
    }
}

/// Split `archives` into the ones to keep and the ones to delete
fn plan(
    args: &PruneArgs,
    archives: &[ArchiveInfo],
    now: DateTime<Utc>,
) -> anyhow::Result<(Vec<ArchiveInfo>, Vec<ArchiveInfo>)> {
    let mut keep = match &args.keep_within {
        Some(within) => prune_within(archives, within, now)?,
        None => Vec::new(),
    };
    for (pattern, n) in [
        (PRUNE_HOURLY, args.keep_hourly),
        (PRUNE_DAILY, args.keep_daily),
        (PRUNE_WEEKLY, args.keep_weekly),
        (PRUNE_MONTHLY, args.keep_monthly),
        (PRUNE_YEARLY, args.keep_yearly),
    ] {
        let more = prune_split(archives, pattern, n, &keep);
        keep.extend(more);
    }
    let delete = archives.iter().filter(|a| !keep.contains(a)).cloned().collect();
    keep.sort_by(|a, b| b.time.cmp(&a.time));
    Ok((keep, delete))
}

pub fn run(args: PruneArgs, context: &Context) -> anyhow::Result<bool> {
    if args.repository.archive.is_some() {
        bail!("{}: prune takes a repository, not an archive", args.repository);
    }
    if !args.has_rules() {
        bail!("at least one of the --keep-within, --keep-hourly, --keep-daily, --keep-weekly, --keep-monthly or --keep-yearly settings must be specified");
    }
    let mut repository = context.open_repository(&args.repository, true)?;
    let (mut manifest, key) = context.load_manifest(&mut repository)?;
    let mut cache = context.open_cache(&mut repository, &key, &manifest)?;

    let mut archives = Archive::list_archives(&manifest);
    if let Some(prefix) = &args.prefix {
        archives.retain(|a| a.name.starts_with(prefix.as_str()));
    }
    let (keep, delete) = plan(&args, &archives, Utc::now())?;

    let mut stats = Statistics::default();
    for archive in &keep {
        info!("Keeping archive: {}", format_archive(archive));
    }
    for archive in &delete {
        if args.dry_run {
            info!("Would prune:     {}", format_archive(archive));
            continue;
        }
        info!("Pruning archive: {}", format_archive(archive));
        Archive::open(&mut repository, &key, &mut manifest, Some(&mut cache), &archive.name)?.delete(&mut stats)?;
    }
    if !delete.is_empty() && !args.dry_run {
        manifest.write(&mut repository, &key)?;
        repository.commit()?;
        cache.commit(&manifest)?;
    }
    if args.stats {
        println!("{}", Statistics::header());
        println!("{}", stats.summary("Deleted data:"));
        println!("{}", totals(&cache).summary("All archives:"));
    }
    Ok(true)
}
