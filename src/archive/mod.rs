//! Archive creation, listing, extraction and deletion

pub mod checker;
mod item;

pub use checker::ArchiveChecker;
pub use item::{ArchiveMetadata, ChunkRef, Item, Unpacker, XattrValue, ARCHIVE_VERSION};

use crate::cache::{mtime_ns, Cache};
use crate::chunker::Chunker;
use crate::helpers::{make_path_safe, Statistics};
use crate::id::ObjectId;
use crate::key::Key;
use crate::manifest::{ArchiveEntry, ArchiveInfo, Manifest};
use crate::platform;
use crate::repository::Repository;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use nix::sys::stat::{mknod, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{fchownat, mkfifo, FchownatFlags, Gid, Uid};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, Metadata};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, span, Level};

/// Item stream bytes buffered before they are chunked
const ITEMS_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(300);

/// Archive-relative path for a filesystem path
fn item_path(path: &Path) -> Vec<u8> {
    match path.to_str() {
        Some(s) => make_path_safe(s).into_bytes(),
        None => {
            let bytes = path.as_os_str().as_bytes();
            let start = bytes.iter().position(|b| *b != b'/').unwrap_or(bytes.len());
            bytes[start..].to_vec()
        }
    }
}

fn safe_bytes(path: &[u8]) -> Vec<u8> {
    item_path(Path::new(OsStr::from_bytes(path)))
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub checkpoint_interval: Duration,
    pub numeric_owner: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            numeric_owner: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Directory item paths are resolved against
    pub destination: PathBuf,
    pub numeric_owner: bool,
    /// Read and verify file data without writing anything
    pub dry_run: bool,
}

impl ExtractOptions {
    /// Where `item` is restored
    pub fn target(&self, item: &Item) -> PathBuf {
        self.destination.join(OsStr::from_bytes(&safe_bytes(&item.path)))
    }
}

/// Item stream encoder: packs items and stores them in chunks
struct ItemBuffer {
    buffer: Vec<u8>,
    chunks: Vec<ObjectId>,
}

impl ItemBuffer {
    fn new() -> Self {
        Self { buffer: Vec::new(), chunks: Vec::new() }
    }

    fn add(&mut self, item: &Item) -> Result<()> {
        self.buffer.extend(rmp_serde::to_vec_named(item)?);
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.buffer.len() >= ITEMS_BUFFER_SIZE
    }

    /// Store buffered items; without `all` the last chunk is kept back
    /// so chunk boundaries stay content defined
    fn flush(
        &mut self,
        all: bool,
        chunker: &Chunker,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
        stats: &mut Statistics,
    ) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut chunks = chunker.chunk_bytes(&self.buffer)?;
        self.buffer = if all { Vec::new() } else { chunks.pop().unwrap_or_default() };
        for chunk in chunks {
            let id = key.id_hash(&chunk);
            cache.add_chunk(repository, key, id, &chunk, stats)?;
            self.chunks.push(id);
        }
        Ok(())
    }
}

/// Cursor over the items of an archive; fetches item stream chunks on demand
pub struct ItemIter<F> {
    ids: std::vec::IntoIter<ObjectId>,
    unpacker: Unpacker,
    filter: F,
    done: bool,
}

impl<F: FnMut(&Item) -> bool> ItemIter<F> {
    fn new(ids: Vec<ObjectId>, filter: F) -> Self {
        Self {
            ids: ids.into_iter(),
            unpacker: Unpacker::new(),
            filter,
            done: false,
        }
    }

    pub fn next_item(&mut self, archive: &mut Archive<'_>) -> Result<Option<Item>> {
        self.next_from(archive.repository, archive.key)
    }

    pub fn next_from(&mut self, repository: &mut Repository, key: &Key) -> Result<Option<Item>> {
        while !self.done {
            if let Some(item) = self.unpacker.next_value::<Item>()? {
                if (self.filter)(&item) {
                    return Ok(Some(item));
                }
                continue;
            }
            match self.ids.next() {
                Some(id) => {
                    let data = key.decrypt(Some(&id), &repository.get(&id)?)?;
                    self.unpacker.feed(&data);
                }
                None => {
                    self.done = true;
                    if self.unpacker.pending() > 0 {
                        return Err(Error::integrity("truncated item stream"));
                    }
                }
            }
        }
        Ok(None)
    }
}

pub struct Archive<'a> {
    repository: &'a mut Repository,
    key: &'a Key,
    manifest: &'a mut Manifest,
    cache: Option<&'a mut Cache>,
    name: String,
    id: Option<ObjectId>,
    metadata: Option<ArchiveMetadata>,
    chunker: Chunker,
    items: ItemBuffer,
    hard_links: HashMap<(u64, u64), Vec<u8>>,
    stats: Statistics,
    options: CreateOptions,
    start: DateTime<Utc>,
    started: Instant,
    last_checkpoint: Instant,
}

impl<'a> Archive<'a> {
    /// Start a new archive called `name`
    pub fn create(
        repository: &'a mut Repository,
        key: &'a Key,
        manifest: &'a mut Manifest,
        cache: &'a mut Cache,
        name: &str,
        options: CreateOptions,
    ) -> Result<Self> {
        if manifest.archives.contains_key(name) {
            return Err(Error::ArchiveAlreadyExists { name: name.to_string() });
        }
        let chunker = Chunker::new(manifest.config.chunker, key.chunk_seed());
        let now = Instant::now();
        Ok(Self {
            repository,
            key,
            manifest,
            cache: Some(cache),
            name: name.to_string(),
            id: None,
            metadata: None,
            chunker,
            items: ItemBuffer::new(),
            hard_links: HashMap::new(),
            stats: Statistics::default(),
            options,
            start: Utc::now(),
            started: now,
            last_checkpoint: now,
        })
    }

    /// Open an existing archive; `cache` is needed to delete it or compute its stats
    pub fn open(
        repository: &'a mut Repository,
        key: &'a Key,
        manifest: &'a mut Manifest,
        cache: Option<&'a mut Cache>,
        name: &str,
    ) -> Result<Self> {
        let entry = manifest
            .archives
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ArchiveNotFound { name: name.to_string() })?;
        let data = key.decrypt(Some(&entry.id), &repository.get(&entry.id)?)?;
        let metadata = ArchiveMetadata::decode(&data)?;
        let chunker = Chunker::new(manifest.config.chunker, key.chunk_seed());
        let now = Instant::now();
        Ok(Self {
            repository,
            key,
            manifest,
            cache,
            name: name.to_string(),
            id: Some(entry.id),
            start: metadata.time,
            metadata: Some(metadata),
            chunker,
            items: ItemBuffer::new(),
            hard_links: HashMap::new(),
            stats: Statistics::default(),
            options: CreateOptions::default(),
            started: now,
            last_checkpoint: now,
        })
    }

    /// Archives of the repository ordered by time
    pub fn list_archives(manifest: &Manifest) -> Vec<ArchiveInfo> {
        manifest.list_archives()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    pub fn metadata(&self) -> Option<&ArchiveMetadata> {
        self.metadata.as_ref()
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    fn missing_cache() -> Error {
        Error::Configuration { reason: "archive was opened without a cache".to_string() }
    }

    fn add_item(&mut self, item: &Item) -> Result<()> {
        self.items.add(item)?;
        if self.items.is_full() {
            let cache = self.cache.as_deref_mut().ok_or_else(Self::missing_cache)?;
            self.items
                .flush(false, &self.chunker, self.repository, self.key, cache, &mut self.stats)?;
        }
        if self.last_checkpoint.elapsed() >= self.options.checkpoint_interval {
            self.write_checkpoint()?;
            self.last_checkpoint = Instant::now();
        }
        Ok(())
    }

    /// Save what was archived so far as `<name>.checkpoint`; the next
    /// checkpoint or the final save supersedes it
    fn write_checkpoint(&mut self) -> Result<()> {
        let name = format!("{}.checkpoint", self.name);
        info!(archive = %name, "writing checkpoint");
        self.save_as(&name)?;
        self.manifest.archives.remove(&name);
        if let Some(id) = self.id.take() {
            let cache = self.cache.as_deref_mut().ok_or_else(Self::missing_cache)?;
            cache.chunk_decref(self.repository, id, &mut self.stats)?;
        }
        Ok(())
    }

    pub fn save(&mut self) -> Result<()> {
        let name = self.name.clone();
        self.save_as(&name)
    }

    fn save_as(&mut self, name: &str) -> Result<()> {
        if self.manifest.archives.contains_key(name) {
            return Err(Error::ArchiveAlreadyExists { name: name.to_string() });
        }
        let cache = self.cache.as_deref_mut().ok_or_else(Self::missing_cache)?;
        self.items
            .flush(true, &self.chunker, self.repository, self.key, cache, &mut self.stats)?;
        let metadata = ArchiveMetadata {
            version: ARCHIVE_VERSION,
            name: name.to_string(),
            items: self.items.chunks.clone(),
            cmdline: std::env::args().collect(),
            hostname: platform::hostname()?,
            username: platform::current_username(),
            time: self.start,
        };
        let data = rmp_serde::to_vec_named(&metadata)?;
        let id = self.key.id_hash(&data);
        cache.add_chunk(self.repository, self.key, id, &data, &mut self.stats)?;
        self.manifest
            .archives
            .insert(name.to_string(), ArchiveEntry { id, time: self.start });
        self.manifest.write(self.repository, self.key)?;
        self.repository.commit()?;
        cache.commit(self.manifest)?;
        self.id = Some(id);
        self.metadata = Some(metadata);
        debug!(archive = %name, id = %id, "archive saved");
        Ok(())
    }

    fn stat_attrs(&self, path: &Path, st: &Metadata) -> Result<Item> {
        let numeric = self.options.numeric_owner;
        let mut item = Item {
            path: item_path(path),
            mode: st.mode(),
            uid: st.uid(),
            gid: st.gid(),
            user: if numeric { None } else { platform::uid2user(st.uid()) },
            group: if numeric { None } else { platform::gid2group(st.gid()) },
            mtime: mtime_ns(st),
            xattrs: platform::xattrs_get(path)?,
            ..Default::default()
        };
        platform::acl_get(path, &mut item, numeric)?;
        Ok(item)
    }

    pub fn process_dir(&mut self, path: &Path, st: &Metadata) -> Result<()> {
        let item = self.stat_attrs(path, st)?;
        self.add_item(&item)
    }

    pub fn process_fifo(&mut self, path: &Path, st: &Metadata) -> Result<()> {
        let item = self.stat_attrs(path, st)?;
        self.add_item(&item)
    }

    pub fn process_dev(&mut self, path: &Path, st: &Metadata) -> Result<()> {
        let mut item = self.stat_attrs(path, st)?;
        item.rdev = Some(st.rdev());
        self.add_item(&item)
    }

    pub fn process_symlink(&mut self, path: &Path, st: &Metadata) -> Result<()> {
        let target = fs::read_link(path)?;
        let mut item = self.stat_attrs(path, st)?;
        item.source = Some(target.as_os_str().as_bytes().to_vec());
        self.add_item(&item)
    }

    /// Archive a regular file, reusing the chunk list of an unchanged file
    pub fn process_file(&mut self, path: &Path, st: &Metadata) -> Result<()> {
        let mut item = self.stat_attrs(path, st)?;
        if st.nlink() > 1 {
            let inode = (st.dev(), st.ino());
            if let Some(source) = self.hard_links.get(&inode) {
                item.source = Some(source.clone());
                return self.add_item(&item);
            }
            self.hard_links.insert(inode, item.path.clone());
        }

        let cache = self.cache.as_deref_mut().ok_or_else(Self::missing_cache)?;
        let path_hash = self.key.id_hash(path.as_os_str().as_bytes());
        let mut chunks = None;
        if let Some(ids) = cache.file_known_and_unchanged(&path_hash, st)? {
            if ids.iter().all(|id| cache.seen_chunk(id) > 0) {
                let mut refs = Vec::with_capacity(ids.len());
                for id in ids {
                    refs.push(cache.chunk_incref(id, &mut self.stats)?);
                }
                chunks = Some(refs);
            }
        }
        let chunks = match chunks {
            Some(chunks) => chunks,
            None => {
                let mut refs = Vec::new();
                for chunk in self.chunker.chunkify(File::open(path)?) {
                    let chunk = chunk?;
                    let id = self.key.id_hash(&chunk);
                    refs.push(cache.add_chunk(self.repository, self.key, id, &chunk, &mut self.stats)?);
                }
                cache.memorize_file(path_hash, st, refs.iter().map(|c| c.id).collect())?;
                refs
            }
        };
        self.stats.nfiles += 1;
        item.chunks = Some(chunks);
        self.add_item(&item)
    }

    /// Items passing `filter`, in archive order
    pub fn iter_items<F: FnMut(&Item) -> bool>(&self, filter: F) -> ItemIter<F> {
        let ids = self.metadata.as_ref().map(|m| m.items.clone()).unwrap_or_default();
        ItemIter::new(ids, filter)
    }

    /// Items of an archive known only by its metadata
    pub fn items_of<F: FnMut(&Item) -> bool>(metadata: &ArchiveMetadata, filter: F) -> ItemIter<F> {
        ItemIter::new(metadata.items.clone(), filter)
    }

    /// Fetch and decrypt the content of a chunk
    pub fn fetch_chunk(&mut self, chunk: &ChunkRef) -> Result<Vec<u8>> {
        self.key.decrypt(Some(&chunk.id), &self.repository.get(&chunk.id)?)
    }

    /// Restore `item` below `options.destination`. Directory attributes are
    /// only applied with `restore_attrs`, callers do so after the contents.
    pub fn extract_item(&mut self, item: &Item, options: &ExtractOptions, restore_attrs: bool) -> Result<()> {
        if options.dry_run {
            for chunk in item.chunks.iter().flatten() {
                self.fetch_chunk(chunk)?;
            }
            return Ok(());
        }
        let path = options.target(item);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Ok(existing) = fs::symlink_metadata(&path) {
            if existing.is_dir() {
                if !item.is_dir() {
                    fs::remove_dir(&path)?;
                }
            } else {
                fs::remove_file(&path)?;
            }
        }

        let file_type = SFlag::from_bits_truncate(item.file_type());
        if item.is_dir() {
            if !path.is_dir() {
                fs::create_dir(&path)?;
            }
            if restore_attrs {
                self.restore_attrs(&path, item, options)?;
            }
        } else if item.is_reg() {
            if let Some(source) = item.source.as_ref().filter(|_| item.is_hardlink()) {
                let source = options.destination.join(OsStr::from_bytes(&safe_bytes(source)));
                fs::hard_link(source, &path)?;
                return Ok(());
            }
            let mut file = File::create(&path)?;
            for chunk in item.chunks.iter().flatten() {
                file.write_all(&self.fetch_chunk(chunk)?)?;
            }
            file.flush()?;
            drop(file);
            self.restore_attrs(&path, item, options)?;
        } else if file_type == SFlag::S_IFIFO {
            mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR)?;
            self.restore_attrs(&path, item, options)?;
        } else if item.is_symlink() {
            let target = item.source.as_deref().unwrap_or_default();
            std::os::unix::fs::symlink(OsStr::from_bytes(target), &path)?;
            self.restore_attrs(&path, item, options)?;
        } else if file_type == SFlag::S_IFCHR || file_type == SFlag::S_IFBLK {
            mknod(&path, file_type, Mode::S_IRUSR | Mode::S_IWUSR, item.rdev.unwrap_or(0) as libc::dev_t)?;
            self.restore_attrs(&path, item, options)?;
        } else {
            return Err(Error::UnsupportedPayload {
                reason: format!("unknown item type {:o} for {}", item.mode, item.path_str()),
            });
        }
        Ok(())
    }

    /// Apply ownership, permissions, xattrs, ACLs and mtime of `item` to `path`
    pub fn restore_attrs(&self, path: &Path, item: &Item, options: &ExtractOptions) -> Result<()> {
        platform::xattrs_set(path, &item.xattrs)?;
        let mut uid = item.uid;
        let mut gid = item.gid;
        if !options.numeric_owner {
            uid = item.user.as_deref().and_then(platform::user2uid).unwrap_or(uid);
            gid = item.group.as_deref().and_then(platform::group2gid).unwrap_or(gid);
        }
        // only root may give files away
        let _ = fchownat(
            None,
            path,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
            FchownatFlags::NoFollowSymlink,
        );
        if !item.is_symlink() {
            fs::set_permissions(path, fs::Permissions::from_mode(item.mode & 0o7777))?;
            platform::acl_set(path, item, options.numeric_owner)?;
        }
        let mtime = TimeSpec::new(
            item.mtime.div_euclid(1_000_000_000) as libc::time_t,
            item.mtime.rem_euclid(1_000_000_000) as libc::c_long,
        );
        nix::sys::stat::utimensat(None, path, &mtime, &mtime, UtimensatFlags::NoFollowSymlink)?;
        Ok(())
    }

    /// Remove the archive, releasing every chunk it references. The caller
    /// writes the manifest and commits.
    pub fn delete(&mut self, stats: &mut Statistics) -> Result<()> {
        let span = span!(Level::INFO, "delete_archive", archive = %self.name);
        let _enter = span.enter();
        let id = self.id.ok_or_else(|| Error::ArchiveNotFound { name: self.name.clone() })?;
        let item_ids = self.metadata.as_ref().map(|m| m.items.clone()).unwrap_or_default();
        let cache = self.cache.as_deref_mut().ok_or_else(Self::missing_cache)?;
        let mut unpacker = Unpacker::new();
        for item_id in item_ids {
            let data = self.key.decrypt(Some(&item_id), &self.repository.get(&item_id)?)?;
            unpacker.feed(&data);
            while let Some(item) = unpacker.next_value::<Item>()? {
                for chunk in item.chunks.iter().flatten() {
                    cache.chunk_decref(self.repository, chunk.id, stats)?;
                }
            }
            cache.chunk_decref(self.repository, item_id, stats)?;
        }
        cache.chunk_decref(self.repository, id, stats)?;
        self.manifest.archives.remove(&self.name);
        Ok(())
    }

    /// Sizes of this archive; deduplicated size counts chunks no other
    /// archive references
    pub fn calc_stats(&mut self, cache: &Cache) -> Result<Statistics> {
        let id = self.id.ok_or_else(|| Error::ArchiveNotFound { name: self.name.clone() })?;
        let mut remaining: HashMap<ObjectId, u32> = HashMap::new();
        let mut stats = Statistics::default();
        let mut add = |id: ObjectId, stats: &mut Statistics| {
            if let Some(count) = cache.chunks().get(&id) {
                let left = remaining.entry(id).or_insert(count.refcount);
                stats.update(count.size as i64, count.csize as i64, *left == 1);
                *left = left.saturating_sub(1);
            }
        };
        add(id, &mut stats);
        let item_ids = self.metadata.as_ref().map(|m| m.items.clone()).unwrap_or_default();
        let mut unpacker = Unpacker::new();
        for item_id in item_ids {
            add(item_id, &mut stats);
            let data = self.key.decrypt(Some(&item_id), &self.repository.get(&item_id)?)?;
            unpacker.feed(&data);
            while let Some(item) = unpacker.next_value::<Item>()? {
                if let Some(chunks) = &item.chunks {
                    stats.nfiles += 1;
                    for chunk in chunks {
                        add(chunk.id, &mut stats);
                    }
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Compression;
    use crate::manifest::ManifestConfig;
    use crate::repository::DEFAULT_LOCK_WAIT;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        repository: Repository,
        key: Key,
        manifest: Manifest,
        cache: Cache,
    }

    fn fixture() -> Result<Fixture> {
        let dir = TempDir::new()?;
        let mut repository = Repository::create(dir.path().join("repo"), DEFAULT_LOCK_WAIT)?;
        let key = Key::plaintext(Compression::default());
        let mut manifest = Manifest::new(ManifestConfig::default());
        manifest.write(&mut repository, &key)?;
        repository.commit()?;
        let cache = Cache::open(&dir.path().join("cache"), &mut repository, &key, &manifest, DEFAULT_LOCK_WAIT)?;
        Ok(Fixture { dir, repository, key, manifest, cache })
    }

    fn source_tree(root: &Path) -> Result<()> {
        fs::create_dir_all(root.join("sub"))?;
        fs::write(root.join("a.txt"), b"hello world")?;
        let big: Vec<u8> = (0..300_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        fs::write(root.join("sub/big.bin"), big)?;
        fs::hard_link(root.join("a.txt"), root.join("sub/link.txt"))?;
        std::os::unix::fs::symlink("../a.txt", root.join("sub/sym"))?;
        fs::set_permissions(root.join("a.txt"), fs::Permissions::from_mode(0o640))?;
        Ok(())
    }

    fn archive_tree(f: &mut Fixture, name: &str, root: &Path) -> Result<Statistics> {
        let mut archive = Archive::create(
            &mut f.repository,
            &f.key,
            &mut f.manifest,
            &mut f.cache,
            name,
            CreateOptions::default(),
        )?;
        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            let st = entry.path().symlink_metadata()?;
            if st.is_dir() {
                archive.process_dir(entry.path(), &st)?;
            } else if st.file_type().is_symlink() {
                archive.process_symlink(entry.path(), &st)?;
            } else {
                archive.process_file(entry.path(), &st)?;
            }
        }
        archive.save()?;
        Ok(*archive.stats())
    }

    #[test]
    fn test_create_and_extract() -> Result<()> {
        let mut f = fixture()?;
        let src = f.dir.path().join("src");
        source_tree(&src)?;
        let stats = archive_tree(&mut f, "first", &src)?;
        assert_eq!(stats.nfiles, 2);

        let dest = f.dir.path().join("dest");
        let options = ExtractOptions { destination: dest.clone(), ..Default::default() };
        let mut archive = Archive::open(&mut f.repository, &f.key, &mut f.manifest, None, "first")?;
        let mut items = archive.iter_items(|_| true);
        let mut dirs = Vec::new();
        while let Some(item) = items.next_item(&mut archive)? {
            if item.is_dir() {
                archive.extract_item(&item, &options, false)?;
                dirs.push(item);
            } else {
                archive.extract_item(&item, &options, true)?;
            }
        }
        for dir in dirs.iter().rev() {
            archive.restore_attrs(&options.target(dir), dir, &options)?;
        }

        let out = dest.join(OsStr::from_bytes(&item_path(&src)));
        assert_eq!(fs::read(out.join("a.txt"))?, b"hello world");
        assert_eq!(fs::read(out.join("sub/big.bin"))?, fs::read(src.join("sub/big.bin"))?);
        assert_eq!(fs::read_link(out.join("sub/sym"))?, Path::new("../a.txt"));
        let original = fs::metadata(src.join("a.txt"))?;
        let restored = fs::metadata(out.join("a.txt"))?;
        assert_eq!(restored.mode() & 0o7777, 0o640);
        assert_eq!(restored.mtime(), original.mtime());
        assert_eq!(restored.ino(), fs::metadata(out.join("sub/link.txt"))?.ino());
        Ok(())
    }

    #[test]
    fn test_second_archive_is_deduplicated() -> Result<()> {
        let mut f = fixture()?;
        let src = f.dir.path().join("src");
        source_tree(&src)?;
        let first = archive_tree(&mut f, "one", &src)?;
        assert!(first.deduplicated_size > 0);
        let second = archive_tree(&mut f, "two", &src)?;
        assert!((second.original_size - first.original_size).abs() < 16);
        // only the new archive metadata is unique
        assert!(second.deduplicated_size < 1024);

        assert!(matches!(
            archive_tree(&mut f, "two", &src),
            Err(Error::ArchiveAlreadyExists { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_checkpoints_are_superseded() -> Result<()> {
        let Fixture { dir, mut repository, key, mut manifest, mut cache } = fixture()?;
        let src = dir.path().join("src");
        fs::create_dir_all(&src)?;
        let old = src.join("0-old.txt");
        fs::write(&old, b"written before the others")?;
        std::thread::sleep(Duration::from_millis(20));
        source_tree(&src)?;

        let options = CreateOptions { checkpoint_interval: Duration::ZERO, ..Default::default() };
        let mut archive = Archive::create(&mut repository, &key, &mut manifest, &mut cache, "nightly", options)?;
        for entry in walkdir::WalkDir::new(&src).sort_by_file_name() {
            let entry = entry?;
            let st = entry.path().symlink_metadata()?;
            if st.is_dir() {
                archive.process_dir(entry.path(), &st)?;
            } else if st.file_type().is_symlink() {
                archive.process_symlink(entry.path(), &st)?;
            } else {
                archive.process_file(entry.path(), &st)?;
            }
        }
        archive.save()?;
        drop(archive);

        let names: Vec<&String> = manifest.archives.keys().collect();
        assert_eq!(names, vec!["nightly"]);
        // no checkpoint metadata is left behind, and the cache accounts for every object
        let mut metadata_names = Vec::new();
        for id in repository.list() {
            if id == ObjectId::MANIFEST {
                continue;
            }
            assert!(cache.seen_chunk(&id) > 0);
            let data = key.decrypt(Some(&id), &repository.get(&id)?)?;
            if let Ok(metadata) = ArchiveMetadata::decode(&data) {
                metadata_names.push(metadata.name);
            }
        }
        assert_eq!(metadata_names, vec!["nightly".to_string()]);
        assert_eq!(cache.chunks().len() + 1, repository.len());

        // files memorized before the last checkpoint are still cached
        drop(cache);
        let mut cache = Cache::open(&dir.path().join("cache"), &mut repository, &key, &manifest, DEFAULT_LOCK_WAIT)?;
        let path_hash = key.id_hash(old.as_os_str().as_bytes());
        assert!(cache.file_known_and_unchanged(&path_hash, &fs::metadata(&old)?)?.is_some());
        Ok(())
    }

    #[test]
    fn test_delete_frees_chunks() -> Result<()> {
        let mut f = fixture()?;
        let src = f.dir.path().join("src");
        source_tree(&src)?;
        archive_tree(&mut f, "one", &src)?;
        let objects_with_one = f.repository.len();
        archive_tree(&mut f, "two", &src)?;

        let mut archive = Archive::open(&mut f.repository, &f.key, &mut f.manifest, None, "two")?;
        let own = archive.calc_stats(&f.cache)?;
        assert_eq!(own.nfiles, 2);
        assert!(own.deduplicated_size > 0 && own.deduplicated_size < own.compressed_size);
        drop(archive);

        let mut archive = Archive::open(&mut f.repository, &f.key, &mut f.manifest, Some(&mut f.cache), "two")?;
        let mut stats = Statistics::default();
        archive.delete(&mut stats)?;
        drop(archive);
        f.manifest.write(&mut f.repository, &f.key)?;
        f.repository.commit()?;
        f.cache.commit(&f.manifest)?;
        assert_eq!(f.repository.len(), objects_with_one);
        assert!(!f.manifest.archives.contains_key("two"));
        assert_eq!(stats.deduplicated_size, -own.deduplicated_size);
        Ok(())
    }
}
