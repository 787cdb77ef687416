//! Small utilities shared by the archive engine and the command line

use crate::manifest::ArchiveInfo;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Local, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CACHEDIR_SIGNATURE: &[u8] = b"Signature: 8a477f597d28d172789f06886806bc55";

/// Size accounting for an archive operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub original_size: i64,
    pub compressed_size: i64,
    pub deduplicated_size: i64,
    pub nfiles: u64,
}

impl Statistics {
    /// Account for a chunk; negative sizes record freed data
    pub fn update(&mut self, size: i64, csize: i64, unique: bool) {
        self.original_size += size;
        self.compressed_size += csize;
        if unique {
            self.deduplicated_size += csize;
        }
    }

    /// Table row as printed by `create --stats` and `info`
    pub fn summary(&self, label: &str) -> String {
        format!(
            "{:<15} {:>20} {:>20} {:>20}",
            label,
            format_file_size(self.original_size),
            format_file_size(self.compressed_size),
            format_file_size(self.deduplicated_size)
        )
    }

    pub fn header() -> String {
        format!(
            "{:<15} {:>20} {:>20} {:>20}",
            "", "Original size", "Compressed size", "Deduplicated size"
        )
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", Self::header())?;
        write!(f, "{}", self.summary("This archive:"))
    }
}

pub fn format_file_size(v: i64) -> String {
    let v = v as f64;
    if v.abs() >= 1e12 {
        format!("{:.2} TB", v / 1e12)
    } else if v.abs() >= 1e9 {
        format!("{:.2} GB", v / 1e9)
    } else if v.abs() >= 1e6 {
        format!("{:.2} MB", v / 1e6)
    } else if v.abs() >= 1e3 {
        format!("{:.2} kB", v / 1e3)
    } else {
        format!("{} B", v)
    }
}

/// `ls -l` style mode string
pub fn format_file_mode(mode: u32) -> String {
    let kind = match mode & libc::S_IFMT {
        libc::S_IFDIR => 'd',
        libc::S_IFLNK => 'l',
        libc::S_IFCHR => 'c',
        libc::S_IFBLK => 'b',
        libc::S_IFIFO => 'p',
        libc::S_IFSOCK => 's',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    let bits = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    for (i, (bit, c)) in bits.iter().enumerate() {
        let set = mode & bit != 0;
        let special = match i {
            2 => mode & libc::S_ISUID != 0,
            5 => mode & libc::S_ISGID != 0,
            8 => mode & libc::S_ISVTX != 0,
            _ => false,
        };
        out.push(match (special, set, i) {
            (true, true, 8) => 't',
            (true, false, 8) => 'T',
            (true, true, _) => 's',
            (true, false, _) => 'S',
            (false, true, _) => *c,
            (false, false, _) => '-',
        });
    }
    out
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%a, %Y-%m-%d %H:%M:%S").to_string()
}

pub fn format_timedelta(delta: Duration) -> String {
    let total_ms = delta.num_milliseconds().max(0);
    let seconds = (total_ms % 60_000) as f64 / 1000.0;
    let minutes = total_ms / 60_000 % 60;
    let hours = total_ms / 3_600_000 % 24;
    let days = total_ms / 86_400_000;
    let mut txt = format!("{:.2} seconds", seconds);
    if minutes > 0 {
        txt = format!("{} minutes {}", minutes, txt);
    }
    if hours > 0 {
        txt = format!("{} hours {}", hours, txt);
    }
    if days > 0 {
        txt = format!("{} days {}", days, txt);
    }
    txt
}

pub fn format_archive(archive: &ArchiveInfo) -> String {
    format!("{:<36} {}", archive.name, format_time(&archive.time))
}

/// Repository path plus optional archive name, written `path::archive`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: PathBuf,
    pub archive: Option<String>,
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = || Error::InvalidLocation {
            location: text.to_string(),
        };
        let (repo, archive) = match text.split_once("::") {
            Some((repo, archive)) => (repo, Some(archive)),
            None => (text, None),
        };
        if repo.starts_with("ssh://") {
            return Err(Error::RemoteUnsupported {
                location: text.to_string(),
            });
        }
        let repo = repo.strip_prefix("file://").unwrap_or(repo);
        if let Some((host, _)) = repo.split_once(':') {
            if !host.contains('/') {
                return Err(Error::RemoteUnsupported {
                    location: text.to_string(),
                });
            }
        }
        if repo.is_empty() || archive.map_or(false, |a| a.is_empty() || a.contains('/')) {
            return Err(invalid());
        }
        Ok(Self {
            path: PathBuf::from(repo),
            archive: archive.map(str::to_string),
        })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.archive {
            Some(archive) => write!(f, "{}::{}", self.path.display(), archive),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// Shell-style wildcard match where `*` also crosses `/`
pub fn fnmatch(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(&pattern, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    } else if text[t] == '[' {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match backtrack {
            Some((star, consumed)) => {
                p = star + 1;
                t = consumed + 1;
                backtrack = Some((star, consumed + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// Match `c` against the `[...]` class starting at `start`; returns the
/// result and the index after the class, or `None` if the class is unterminated
fn match_class(pattern: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = matches!(pattern.get(i), Some('!') | Some('^'));
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        if pattern[i] == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;
        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            if pattern[i] <= c && c <= pattern[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if pattern[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

/// Include or exclude rule for paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches the path itself and everything below it
    Include(String),
    /// Wildcard pattern matching the path or any of its parents
    Exclude(String),
}

impl Pattern {
    pub fn include(path: &str) -> Self {
        Pattern::Include(path.trim_end_matches('/').to_string())
    }

    pub fn exclude(pattern: &str) -> Self {
        let pattern = if pattern.ends_with('/') {
            format!("{}*", pattern)
        } else {
            format!("{}/*", pattern)
        };
        Pattern::Exclude(pattern)
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Pattern::Include(prefix) => {
                prefix.is_empty()
                    || path == prefix
                    || path.strip_prefix(prefix.as_str()).map_or(false, |rest| rest.starts_with('/'))
            }
            Pattern::Exclude(pattern) => fnmatch(pattern, &format!("{}/", path)),
        }
    }
}

/// Whether the first matching pattern excludes `path`
pub fn exclude_path(path: &str, patterns: &[Pattern]) -> bool {
    patterns
        .iter()
        .find(|p| p.matches(path))
        .map_or(false, |p| matches!(p, Pattern::Exclude(_)))
}

/// Restrict `excludes` to `paths`: everything not below one of them is excluded
pub fn adjust_patterns(paths: &[String], excludes: &[Pattern]) -> Vec<Pattern> {
    if paths.is_empty() {
        return excludes.to_vec();
    }
    let mut patterns: Vec<Pattern> = paths.iter().map(|p| Pattern::include(p)).collect();
    patterns.extend_from_slice(excludes);
    patterns.push(Pattern::Exclude("*".into()));
    patterns
}

/// Read exclude patterns from a file, one per line; `#` starts a comment
pub fn read_exclude_file(path: &Path) -> Result<Vec<Pattern>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Pattern::exclude)
        .collect())
}

/// Strip leading `/` and `../` so extraction stays below the target directory
pub fn make_path_safe(path: &str) -> String {
    let mut rest = path;
    loop {
        let trimmed = rest.trim_start_matches('/');
        if let Some(stripped) = trimmed.strip_prefix("..") {
            if stripped.starts_with('/') {
                rest = stripped;
                continue;
            }
        }
        rest = trimmed;
        break;
    }
    if rest.is_empty() {
        ".".to_string()
    } else {
        rest.to_string()
    }
}

/// Whether `dir` carries a valid CACHEDIR.TAG
pub fn is_cachedir(dir: &Path) -> bool {
    let mut signature = [0u8; CACHEDIR_SIGNATURE.len()];
    fs::File::open(dir.join("CACHEDIR.TAG"))
        .and_then(|mut f| f.read_exact(&mut signature))
        .map_or(false, |_| signature == CACHEDIR_SIGNATURE)
}

/// Archives newer than `within` (`<n>H`, `d`, `w`, `m` or `y`)
pub fn prune_within(archives: &[ArchiveInfo], within: &str, now: DateTime<Utc>) -> Result<Vec<ArchiveInfo>> {
    let invalid = || Error::Configuration {
        reason: format!("invalid --keep-within value '{}'", within),
    };
    let unit = within.chars().last().ok_or_else(invalid)?;
    let multiplier = match unit {
        'H' => 1,
        'd' => 24,
        'w' => 24 * 7,
        'm' => 24 * 31,
        'y' => 24 * 365,
        _ => return Err(invalid()),
    };
    let count: i64 = within[..within.len() - 1].parse().map_err(|_| invalid())?;
    let target = now - Duration::hours(count * multiplier);
    Ok(archives.iter().filter(|a| a.time > target).cloned().collect())
}

/// Strftime patterns used as prune buckets
pub const PRUNE_HOURLY: &str = "%Y-%m-%d %H";
pub const PRUNE_DAILY: &str = "%Y-%m-%d";
pub const PRUNE_WEEKLY: &str = "%G-%V";
pub const PRUNE_MONTHLY: &str = "%Y-%m";
pub const PRUNE_YEARLY: &str = "%Y";

/// Newest archive of each of the `n` latest buckets, not counting
/// archives already in `skip`
pub fn prune_split(archives: &[ArchiveInfo], pattern: &str, n: usize, skip: &[ArchiveInfo]) -> Vec<ArchiveInfo> {
    let mut keep = Vec::new();
    if n == 0 {
        return keep;
    }
    let mut sorted: Vec<&ArchiveInfo> = archives.iter().collect();
    sorted.sort_by(|a, b| b.time.cmp(&a.time));
    let mut last: Option<String> = None;
    for archive in sorted {
        let period = archive.time.with_timezone(&Local).format(pattern).to_string();
        if last.as_deref() != Some(period.as_str()) {
            last = Some(period);
            if !skip.contains(archive) {
                keep.push(archive.clone());
                if keep.len() == n {
                    break;
                }
            }
        }
    }
    keep
}
