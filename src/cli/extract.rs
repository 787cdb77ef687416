//! `burrow extract`

use super::{require_archive, Context};
use crate::archive::{Archive, ExtractOptions, Item};
use crate::helpers::{adjust_patterns, exclude_path, read_exclude_file, Location, Pattern};
use clap::Args;
use tracing::{debug, error, span, Level};

#[derive(Args)]
pub struct ExtractArgs {
    /// Do not actually change any files, only verify the data
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Exclude paths matching PATTERN
    #[arg(short, long = "exclude", value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Read exclude patterns from FILE, one per line
    #[arg(long, value_name = "FILE")]
    pub exclude_from: Vec<std::path::PathBuf>,

    /// Only obey numeric user and group identifiers
    #[arg(long)]
    pub numeric_owner: bool,

    /// Remove NUMBER leading path elements
    #[arg(long, value_name = "NUMBER", default_value_t = 0)]
    pub strip_components: usize,

    /// Archive to extract
    pub archive: Location,

    /// Paths to extract
    pub paths: Vec<String>,
}

/// Drop the first `n` components of an archive path; None when nothing is left
fn strip_components(path: &[u8], n: usize) -> Option<Vec<u8>> {
    if n == 0 {
        return Some(path.to_vec());
    }
    let rest: Vec<&[u8]> = path.split(|b| *b == b'/').filter(|c| !c.is_empty()).skip(n).collect();
    if rest.is_empty() {
        None
    } else {
        Some(rest.join(&b'/'))
    }
}

fn is_below(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir).map_or(false, |rest| rest.starts_with('/'))
}

pub fn run(args: ExtractArgs, context: &Context) -> anyhow::Result<bool> {
    let name = require_archive(&args.archive)?;
    let span = span!(Level::INFO, "extract", archive = %name);
    let _enter = span.enter();

    let mut excludes: Vec<Pattern> = args.exclude.iter().map(|p| Pattern::exclude(p)).collect();
    for file in &args.exclude_from {
        excludes.extend(read_exclude_file(file)?);
    }
    let paths: Vec<String> = args.paths.iter().map(|p| p.trim_start_matches('/').to_string()).collect();
    let patterns = adjust_patterns(&paths, &excludes);
    let options = ExtractOptions {
        destination: std::env::current_dir()?,
        numeric_owner: args.numeric_owner,
        dry_run: args.dry_run,
    };

    let mut repository = context.open_repository(&args.archive, false)?;
    let (mut manifest, key) = context.load_manifest(&mut repository)?;
    let mut archive = Archive::open(&mut repository, &key, &mut manifest, None, name)?;

    let mut errors = 0usize;
    // directories whose attributes are restored once their contents are done
    let mut dirs: Vec<(String, Item)> = Vec::new();
    let restore_dir = |archive: &Archive<'_>, dir: &Item| {
        if options.dry_run {
            return 0;
        }
        match archive.restore_attrs(&options.target(dir), dir, &options) {
            Ok(()) => 0,
            Err(e) => {
                error!("{}: {}", dir.path_str(), e);
                1
            }
        }
    };

    let mut items = archive.iter_items(|item| !exclude_path(&item.path_str(), &patterns));
    while let Some(mut item) = items.next_item(&mut archive)? {
        let original = item.path_str();
        while let Some((dir_path, _)) = dirs.last() {
            if is_below(&original, dir_path) {
                break;
            }
            if let Some((_, dir)) = dirs.pop() {
                errors += restore_dir(&archive, &dir);
            }
        }
        let Some(path) = strip_components(&item.path, args.strip_components) else {
            continue;
        };
        item.path = path;
        if item.is_hardlink() {
            item.source = item
                .source
                .as_deref()
                .and_then(|source| strip_components(source, args.strip_components));
            if item.source.is_none() {
                continue;
            }
        }
        let shown = item.path_str();
        debug!("{}", shown);
        let result = if item.is_dir() {
            let result = archive.extract_item(&item, &options, false);
            dirs.push((original, item));
            result
        } else {
            archive.extract_item(&item, &options, true)
        };
        if let Err(e) = result {
            error!("{}: {}", shown, e);
            errors += 1;
        }
    }
    while let Some((_, dir)) = dirs.pop() {
        errors += restore_dir(&archive, &dir);
    }
    Ok(errors == 0)
}
