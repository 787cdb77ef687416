//! `burrow list`

use super::{Context, OutputFormat};
use crate::archive::{Archive, Item};
use crate::helpers::{format_archive, format_file_mode, Location};
use chrono::{Local, TimeZone};
use clap::Args;
use serde::Serialize;

#[derive(Args)]
pub struct ListArgs {
    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,

    /// Repository or archive to list contents of
    pub location: Location,
}

#[derive(Serialize)]
struct ArchiveRow<'a> {
    name: &'a str,
    id: String,
    time: String,
}

#[derive(Serialize)]
struct ItemRow {
    path: String,
    mode: String,
    user: String,
    group: String,
    size: u64,
    mtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

fn owner(name: &Option<String>, id: u32) -> String {
    name.clone().unwrap_or_else(|| id.to_string())
}

fn mtime(item: &Item) -> String {
    Local
        .timestamp_nanos(item.mtime)
        .format("%a, %Y-%m-%d %H:%M:%S")
        .to_string()
}

fn item_row(item: &Item) -> ItemRow {
    ItemRow {
        path: item.path_str(),
        mode: format_file_mode(item.mode),
        user: owner(&item.user, item.uid),
        group: owner(&item.group, item.gid),
        size: item.size(),
        mtime: mtime(item),
        source: item
            .source
            .as_deref()
            .map(|source| String::from_utf8_lossy(source).into_owned()),
    }
}

/// `ls -l` like line for one item
fn format_item(row: &ItemRow, item: &Item) -> String {
    let mut line = format!(
        "{} {:<6} {:<6} {:>8} {} {}",
        row.mode, row.user, row.group, row.size, row.mtime, row.path
    );
    if let Some(source) = &row.source {
        if item.is_symlink() {
            line.push_str(&format!(" -> {}", source));
        } else if item.is_hardlink() {
            line.push_str(&format!(" link to {}", source));
        }
    }
    line
}

pub fn run(args: ListArgs, context: &Context) -> anyhow::Result<bool> {
    let mut repository = context.open_repository(&args.location, false)?;
    let (mut manifest, key) = context.load_manifest(&mut repository)?;

    let Some(name) = args.location.archive.as_deref() else {
        let archives = Archive::list_archives(&manifest);
        match args.format {
            OutputFormat::Table => {
                for archive in &archives {
                    println!("{}", format_archive(archive));
                }
            }
            OutputFormat::Json => {
                let rows: Vec<ArchiveRow<'_>> = archives
                    .iter()
                    .map(|a| ArchiveRow {
                        name: &a.name,
                        id: a.id.to_hex(),
                        time: a.time.to_rfc3339(),
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
        }
        return Ok(true);
    };

    let mut archive = Archive::open(&mut repository, &key, &mut manifest, None, name)?;
    let mut items = archive.iter_items(|_| true);
    let mut rows = Vec::new();
    while let Some(item) = items.next_item(&mut archive)? {
        let row = item_row(&item);
        match args.format {
            OutputFormat::Table => println!("{}", format_item(&row, &item)),
            OutputFormat::Json => rows.push(row),
        }
    }
    if args.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item(path: &str, mode: u32) -> Item {
        Item {
            path: path.as_bytes().to_vec(),
            mode,
            uid: 1000,
            gid: 100,
            user: Some("alice".to_string()),
            ..Item::default()
        }
    }

    #[test]
    fn test_symlink_line() {
        let mut link = item("home/alice/latest", libc::S_IFLNK | 0o777);
        link.source = Some(b"backup-2".to_vec());
        let row = item_row(&link);
        assert_eq!(row.group, "100");
        assert!(format_item(&row, &link).ends_with("home/alice/latest -> backup-2"));
        assert!(format_item(&row, &link).starts_with("lrwxrwxrwx alice  100"));
    }

    #[test]
    fn test_hardlink_line() {
        let mut link = item("b", libc::S_IFREG | 0o644);
        link.source = Some(b"a".to_vec());
        let row = item_row(&link);
        assert!(format_item(&row, &link).ends_with("b link to a"));
    }
}
