//! `burrow create`

use super::{require_archive, totals, Context};
use crate::archive::{Archive, CreateOptions};
use crate::helpers::{exclude_path, format_time, format_timedelta, is_cachedir, read_exclude_file, Location, Pattern, Statistics};
use anyhow::Context as _;
use chrono::Utc;
use clap::Args;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, span, Level};
use walkdir::{DirEntry, WalkDir};

#[derive(Args)]
pub struct CreateArgs {
    /// Print statistics for the created archive
    #[arg(short, long)]
    pub stats: bool,

    /// Exclude paths matching PATTERN
    #[arg(short, long = "exclude", value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Read exclude patterns from FILE, one per line
    #[arg(long, value_name = "FILE")]
    pub exclude_from: Vec<PathBuf>,

    /// Exclude directories that contain a CACHEDIR.TAG file
    #[arg(long)]
    pub exclude_caches: bool,

    /// Write a checkpoint every SECONDS
    #[arg(short = 'c', long, value_name = "SECONDS")]
    pub checkpoint_interval: Option<u64>,

    /// Stay in the same file system
    #[arg(short = 'x', long)]
    pub one_file_system: bool,

    /// Only store numeric user and group identifiers
    #[arg(long)]
    pub numeric_owner: bool,

    /// Archive to create
    pub archive: Location,

    /// Paths to archive
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

/// `(dev, ino)` of `path`, used to keep the repository and cache out of archives
fn inode_of(path: &Path) -> Option<(u64, u64)> {
    fs::metadata(path).ok().map(|st| (st.dev(), st.ino()))
}

fn skipped(entry: &DirEntry, excludes: &[Pattern], skip_inodes: &[(u64, u64)], exclude_caches: bool) -> bool {
    if exclude_path(&entry.path().to_string_lossy(), excludes) {
        return true;
    }
    if !entry.file_type().is_dir() {
        return false;
    }
    if let Ok(st) = entry.metadata() {
        if skip_inodes.contains(&(st.dev(), st.ino())) {
            return true;
        }
    }
    exclude_caches && is_cachedir(entry.path())
}

fn process(archive: &mut Archive<'_>, path: &Path) -> crate::Result<()> {
    let st = fs::symlink_metadata(path)?;
    let file_type = st.file_type();
    if file_type.is_dir() {
        archive.process_dir(path, &st)
    } else if file_type.is_symlink() {
        archive.process_symlink(path, &st)
    } else if file_type.is_file() {
        archive.process_file(path, &st)
    } else if file_type.is_fifo() {
        archive.process_fifo(path, &st)
    } else if file_type.is_char_device() || file_type.is_block_device() {
        archive.process_dev(path, &st)
    } else {
        debug!(path = %path.display(), "skipping socket");
        Ok(())
    }
}

pub fn run(args: CreateArgs, context: &Context) -> anyhow::Result<bool> {
    let name = require_archive(&args.archive)?;
    let span = span!(Level::INFO, "create", archive = %name);
    let _enter = span.enter();

    let mut excludes: Vec<Pattern> = args.exclude.iter().map(|p| Pattern::exclude(p)).collect();
    for file in &args.exclude_from {
        excludes.extend(
            read_exclude_file(file).with_context(|| format!("cannot read exclude file {}", file.display()))?,
        );
    }
    let skip_inodes: Vec<(u64, u64)> = [args.archive.path.as_path(), context.config.paths.cache_dir.as_path()]
        .into_iter()
        .filter_map(inode_of)
        .collect();
    let options = CreateOptions {
        checkpoint_interval: args
            .checkpoint_interval
            .map(Duration::from_secs)
            .unwrap_or_else(|| context.config.checkpoint_interval()),
        numeric_owner: args.numeric_owner,
    };

    let mut repository = context.open_repository(&args.archive, true)?;
    let (mut manifest, key) = context.load_manifest(&mut repository)?;
    let mut cache = context.open_cache(&mut repository, &key, &manifest)?;
    let start = Utc::now();

    let mut archive = Archive::create(&mut repository, &key, &mut manifest, &mut cache, name, options)?;
    let mut errors = 0usize;
    for root in &args.paths {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .same_file_system(args.one_file_system)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !skipped(entry, &excludes, &skip_inodes, args.exclude_caches));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!("{}", e);
                    errors += 1;
                    continue;
                }
            };
            debug!("{}", entry.path().display());
            if let Err(e) = process(&mut archive, entry.path()) {
                error!("{}: {}", entry.path().display(), e);
                errors += 1;
            }
        }
    }
    archive.save()?;

    if args.stats {
        let stats: Statistics = *archive.stats();
        let id = archive.id().map(|id| id.to_hex()).unwrap_or_default();
        let duration = archive.duration();
        drop(archive);
        let end = Utc::now();
        println!("{}", "-".repeat(78));
        println!("Archive name: {}", name);
        println!("Archive fingerprint: {}", id);
        println!("Start time: {}", format_time(&start));
        println!("End time: {}", format_time(&end));
        println!("Duration: {}", format_timedelta(chrono::Duration::from_std(duration)?));
        println!("Number of files: {}", stats.nfiles);
        println!("{}", stats);
        println!("{}", totals(&cache).summary("All archives:"));
        println!("{}", "-".repeat(78));
    }
    Ok(errors == 0)
}
