//! `burrow info`

use super::{require_archive, totals, Context, OutputFormat};
use crate::archive::Archive;
use crate::helpers::{format_time, Location, Statistics};
use anyhow::anyhow;
use clap::Args;
use serde::Serialize;

#[derive(Args)]
pub struct InfoArgs {
    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,

    /// Archive to display information about
    pub archive: Location,
}

#[derive(Serialize)]
struct ArchiveSummary {
    name: String,
    fingerprint: String,
    hostname: String,
    username: String,
    time: String,
    command_line: Vec<String>,
    stats: Statistics,
    totals: Statistics,
}

pub fn run(args: InfoArgs, context: &Context) -> anyhow::Result<bool> {
    let name = require_archive(&args.archive)?;
    let mut repository = context.open_repository(&args.archive, true)?;
    let (mut manifest, key) = context.load_manifest(&mut repository)?;
    let cache = context.open_cache(&mut repository, &key, &manifest)?;

    let mut archive = Archive::open(&mut repository, &key, &mut manifest, None, name)?;
    let stats = archive.calc_stats(&cache)?;
    let metadata = archive
        .metadata()
        .cloned()
        .ok_or_else(|| anyhow!("archive {} has no metadata", name))?;
    let summary = ArchiveSummary {
        name: metadata.name,
        fingerprint: archive.id().map(|id| id.to_hex()).unwrap_or_default(),
        hostname: metadata.hostname,
        username: metadata.username,
        time: format_time(&metadata.time),
        command_line: metadata.cmdline,
        stats,
        totals: totals(&cache),
    };

    match args.format {
        OutputFormat::Table => {
            println!("Name: {}", summary.name);
            println!("Fingerprint: {}", summary.fingerprint);
            println!("Hostname: {}", summary.hostname);
            println!("Username: {}", summary.username);
            println!("Time: {}", summary.time);
            println!("Command line: {}", summary.command_line.join(" "));
            println!("Number of files: {}", summary.stats.nfiles);
            println!("{}", summary.stats);
            println!("{}", summary.totals.summary("All archives:"));
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(true)
}
