//! Client-side cache of chunk reference counts and unchanged files
//!
//! The chunk index mirrors which chunks the repository holds and how many
//! archives reference them, so creating an archive never asks the
//! repository whether a chunk exists. The files cache remembers the chunk
//! list of every regular file seen recently, keyed by a hash of its path.

use crate::archive::{ArchiveMetadata, ChunkRef, Item, Unpacker};
use crate::hashindex::{ChunkCount, ChunkIndex};
use crate::helpers::Statistics;
use crate::id::ObjectId;
use crate::key::Key;
use crate::manifest::Manifest;
use crate::repository::{Repository, UpgradableLock};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, span, Level};

const CACHE_VERSION: u32 = 1;
const CACHE_README: &str = "This is a burrow cache\n";
/// Runs a file may go unseen before it leaves the files cache
const MAX_FILE_AGE: u8 = 10;
const TXN_FILES: [&str; 3] = ["config", "chunks", "files"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheConfig {
    version: u32,
    repository: String,
    manifest: String,
    timestamp: Option<DateTime<Utc>>,
}

/// What the files cache remembers about one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCacheEntry {
    pub age: u8,
    pub inode: u64,
    pub size: u64,
    pub mtime: i64,
    pub chunk_ids: Vec<ObjectId>,
}

pub fn mtime_ns(metadata: &Metadata) -> i64 {
    metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec()
}

pub struct Cache {
    path: PathBuf,
    config: CacheConfig,
    chunks: ChunkIndex,
    files: Option<HashMap<ObjectId, FileCacheEntry>>,
    newest_mtime: i64,
    txn_active: bool,
    _lock: UpgradableLock,
}

impl Cache {
    /// Open (creating if needed) the cache of `repository` below `cache_dir`
    /// and bring it in sync with `manifest`
    pub fn open(
        cache_dir: &Path,
        repository: &mut Repository,
        key: &Key,
        manifest: &Manifest,
        lock_wait: Duration,
    ) -> Result<Self> {
        let path = cache_dir.join(repository.id_hex());
        if !path.join("config").is_file() {
            Self::create(&path, &repository.id_hex())?;
        }
        let lock = UpgradableLock::acquire(path.join("config"), true, lock_wait)?;
        let mut cache = Self {
            path,
            config: CacheConfig {
                version: CACHE_VERSION,
                repository: String::new(),
                manifest: String::new(),
                timestamp: None,
            },
            chunks: ChunkIndex::new(),
            files: None,
            newest_mtime: 0,
            txn_active: false,
            _lock: lock,
        };
        cache.rollback()?;
        cache.load()?;
        if cache.config.repository != repository.id_hex() {
            return Err(Error::Configuration {
                reason: format!("cache {} belongs to another repository", cache.path.display()),
            });
        }
        if let (Some(ours), Some(theirs)) = (cache.config.timestamp, manifest.timestamp) {
            if ours > theirs {
                return Err(Error::RepositoryReplay);
            }
        }
        if cache.config.manifest != manifest.id().to_hex() {
            cache.sync(repository, key, manifest)?;
            cache.commit(manifest)?;
        }
        Ok(cache)
    }

    fn create(path: &Path, repository_id: &str) -> Result<()> {
        fs::create_dir_all(path)?;
        fs::write(path.join("README"), CACHE_README)?;
        let config = CacheConfig {
            version: CACHE_VERSION,
            repository: repository_id.to_string(),
            manifest: String::new(),
            timestamp: None,
        };
        fs::write(path.join("config"), toml::to_string_pretty(&config)?)?;
        ChunkIndex::new().write(path.join("chunks"))?;
        fs::write(path.join("files"), b"")?;
        debug!(path = %path.display(), "created cache");
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let config: CacheConfig = toml::from_str(&fs::read_to_string(self.path.join("config"))?)?;
        if config.version != CACHE_VERSION {
            return Err(Error::Configuration {
                reason: format!("unsupported cache version {}", config.version),
            });
        }
        self.config = config;
        self.chunks = ChunkIndex::read(self.path.join("chunks"))?;
        self.files = None;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunks(&self) -> &ChunkIndex {
        &self.chunks
    }

    fn read_files(&mut self) -> Result<&mut HashMap<ObjectId, FileCacheEntry>> {
        if self.files.is_none() {
            let data = fs::read(self.path.join("files"))?;
            let mut files = HashMap::new();
            if !data.is_empty() {
                let entries: Vec<(ObjectId, FileCacheEntry)> = rmp_serde::from_slice(&data)?;
                for (path_hash, mut entry) in entries {
                    entry.age = entry.age.saturating_add(1);
                    files.insert(path_hash, entry);
                }
            }
            self.files = Some(files);
            self.newest_mtime = 0;
        }
        Ok(self.files.get_or_insert_with(HashMap::new))
    }

    /// Snapshot the cache so a failed run can be undone
    pub fn begin_txn(&mut self) -> Result<()> {
        let tmp = self.path.join("txn.tmp");
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir(&tmp)?;
        for name in TXN_FILES {
            fs::copy(self.path.join(name), tmp.join(name))?;
        }
        fs::rename(&tmp, self.path.join("txn.active"))?;
        self.txn_active = true;
        Ok(())
    }

    pub fn commit(&mut self, manifest: &Manifest) -> Result<()> {
        if !self.txn_active {
            return Ok(());
        }
        if let Some(files) = &self.files {
            let newest = self.newest_mtime;
            let keep: Vec<(&ObjectId, &FileCacheEntry)> = files
                .iter()
                .filter(|(_, entry)| entry.age < MAX_FILE_AGE && entry.mtime < newest)
                .collect();
            let tmp = self.path.join("files.tmp");
            fs::write(&tmp, rmp_serde::to_vec(&keep)?)?;
            fs::rename(&tmp, self.path.join("files"))?;
        }
        self.config.manifest = manifest.id().to_hex();
        self.config.timestamp = manifest.timestamp;
        let tmp = self.path.join("config.tmp");
        fs::write(&tmp, toml::to_string_pretty(&self.config)?)?;
        fs::rename(&tmp, self.path.join("config"))?;
        self.chunks.write(self.path.join("chunks"))?;

        let txn = self.path.join("txn.active");
        fs::rename(&txn, self.path.join("txn.tmp"))?;
        fs::remove_dir_all(self.path.join("txn.tmp"))?;
        self.txn_active = false;
        Ok(())
    }

    /// Restore the state of the last commit
    pub fn rollback(&mut self) -> Result<()> {
        let txn = self.path.join("txn.active");
        if txn.is_dir() {
            for name in TXN_FILES {
                fs::copy(txn.join(name), self.path.join(name))?;
            }
            fs::rename(&txn, self.path.join("txn.tmp"))?;
        }
        let tmp = self.path.join("txn.tmp");
        if tmp.exists() {
            fs::remove_dir_all(tmp)?;
        }
        if self.txn_active {
            self.load()?;
        }
        self.txn_active = false;
        Ok(())
    }

    /// Rebuild the chunk index from every archive in the manifest
    fn sync(&mut self, repository: &mut Repository, key: &Key, manifest: &Manifest) -> Result<()> {
        let span = span!(Level::INFO, "cache_sync", archives = manifest.archives.len());
        let _enter = span.enter();

        fn add(chunks: &mut ChunkIndex, id: ObjectId, size: usize, csize: usize) {
            match chunks.get_mut(&id) {
                Some(count) => count.refcount += 1,
                None => {
                    chunks.insert(id, ChunkCount { refcount: 1, size: size as u32, csize: csize as u32 });
                }
            }
        }

        self.begin_txn()?;
        info!("Initializing cache...");
        self.chunks.clear();
        for (name, entry) in &manifest.archives {
            let cdata = repository.get(&entry.id)?;
            let data = key.decrypt(Some(&entry.id), &cdata)?;
            add(&mut self.chunks, entry.id, data.len(), cdata.len());
            let metadata = ArchiveMetadata::decode(&data)?;
            info!("Analyzing archive: {}", name);

            let mut unpacker = Unpacker::new();
            for id in &metadata.items {
                let cdata = repository.get(id)?;
                let data = key.decrypt(Some(id), &cdata)?;
                add(&mut self.chunks, *id, data.len(), cdata.len());
                unpacker.feed(&data);
                while let Some(item) = unpacker.next_value::<Item>()? {
                    for chunk in item.chunks.iter().flatten() {
                        add(&mut self.chunks, chunk.id, chunk.size as usize, chunk.csize as usize);
                    }
                }
            }
        }
        Ok(())
    }

    /// Store a new chunk, or add a reference if it is already known
    pub fn add_chunk(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        id: ObjectId,
        data: &[u8],
        stats: &mut Statistics,
    ) -> Result<ChunkRef> {
        if !self.txn_active {
            self.begin_txn()?;
        }
        if self.seen_chunk(&id) > 0 {
            return self.chunk_incref(id, stats);
        }
        let size = data.len();
        let cdata = key.encrypt(data)?;
        let csize = cdata.len();
        repository.put(&id, &cdata)?;
        self.chunks.insert(id, ChunkCount { refcount: 1, size: size as u32, csize: csize as u32 });
        stats.update(size as i64, csize as i64, true);
        Ok(ChunkRef { id, size: size as u64, csize: csize as u64 })
    }

    /// Reference count of `id`, zero when unknown
    pub fn seen_chunk(&self, id: &ObjectId) -> u32 {
        self.chunks.get(id).map_or(0, |count| count.refcount)
    }

    pub fn chunk_incref(&mut self, id: ObjectId, stats: &mut Statistics) -> Result<ChunkRef> {
        if !self.txn_active {
            self.begin_txn()?;
        }
        let count = self.chunks.get_mut(&id).ok_or_else(|| Error::ObjectNotFound { id: id.to_hex() })?;
        count.refcount += 1;
        let (size, csize) = (count.size, count.csize);
        stats.update(size as i64, csize as i64, false);
        Ok(ChunkRef { id, size: size as u64, csize: csize as u64 })
    }

    /// Drop a reference, deleting the chunk from the repository with the last one
    pub fn chunk_decref(&mut self, repository: &mut Repository, id: ObjectId, stats: &mut Statistics) -> Result<()> {
        if !self.txn_active {
            self.begin_txn()?;
        }
        let count = self.chunks.get_mut(&id).ok_or_else(|| Error::ObjectNotFound { id: id.to_hex() })?;
        count.refcount = count.refcount.saturating_sub(1);
        let (refcount, size, csize) = (count.refcount, count.size as i64, count.csize as i64);
        if refcount == 0 {
            self.chunks.remove(&id);
            repository.delete(&id)?;
            stats.update(-size, -csize, true);
        } else {
            stats.update(-size, -csize, false);
        }
        Ok(())
    }

    /// Chunk ids of a regular file if it looks unchanged since it was memorized
    pub fn file_known_and_unchanged(&mut self, path_hash: &ObjectId, metadata: &Metadata) -> Result<Option<Vec<ObjectId>>> {
        if !metadata.is_file() {
            return Ok(None);
        }
        let mtime = mtime_ns(metadata);
        let files = self.read_files()?;
        let known = match files.get_mut(path_hash) {
            Some(entry) if entry.mtime == mtime && entry.size == metadata.size() && entry.inode == metadata.ino() => {
                entry.age = 0;
                Some(entry.chunk_ids.clone())
            }
            _ => None,
        };
        if known.is_some() {
            self.newest_mtime = self.newest_mtime.max(mtime);
        }
        Ok(known)
    }

    pub fn memorize_file(&mut self, path_hash: ObjectId, metadata: &Metadata, chunk_ids: Vec<ObjectId>) -> Result<()> {
        if !metadata.is_file() {
            return Ok(());
        }
        let mtime = mtime_ns(metadata);
        let entry = FileCacheEntry {
            age: 0,
            inode: metadata.ino(),
            size: metadata.size(),
            mtime,
            chunk_ids,
        };
        self.read_files()?.insert(path_hash, entry);
        self.newest_mtime = self.newest_mtime.max(mtime);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Compression;
    use crate::manifest::ManifestConfig;
    use crate::repository::DEFAULT_LOCK_WAIT;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        cache_dir: PathBuf,
        repository: Repository,
        key: Key,
        manifest: Manifest,
    }

    fn fixture() -> Result<Fixture> {
        let dir = TempDir::new()?;
        let mut repository = Repository::create(dir.path().join("repo"), DEFAULT_LOCK_WAIT)?;
        let key = Key::plaintext(Compression::default());
        let mut manifest = Manifest::new(ManifestConfig::default());
        manifest.write(&mut repository, &key)?;
        repository.commit()?;
        Ok(Fixture {
            cache_dir: dir.path().join("cache"),
            _dir: dir,
            repository,
            key,
            manifest,
        })
    }

    fn open(f: &mut Fixture) -> Result<Cache> {
        Cache::open(&f.cache_dir, &mut f.repository, &f.key, &f.manifest, DEFAULT_LOCK_WAIT)
    }

    #[test]
    fn test_refcounts() -> Result<()> {
        let mut f = fixture()?;
        let mut cache = open(&mut f)?;
        let mut stats = Statistics::default();
        let data = b"chunk data".repeat(100);
        let id = f.key.id_hash(&data);

        let first = cache.add_chunk(&mut f.repository, &f.key, id, &data, &mut stats)?;
        let second = cache.add_chunk(&mut f.repository, &f.key, id, &data, &mut stats)?;
        assert_eq!(first, second);
        assert_eq!(cache.seen_chunk(&id), 2);
        assert_eq!(stats.original_size, 2000);
        assert_eq!(stats.deduplicated_size, first.csize as i64);

        let mut freed = Statistics::default();
        cache.chunk_decref(&mut f.repository, id, &mut freed)?;
        assert!(f.repository.contains(&id));
        cache.chunk_decref(&mut f.repository, id, &mut freed)?;
        assert!(!f.repository.contains(&id));
        assert_eq!(cache.seen_chunk(&id), 0);
        assert_eq!(freed.deduplicated_size, -(first.csize as i64));
        Ok(())
    }

    #[test]
    fn test_rollback_restores_chunks() -> Result<()> {
        let mut f = fixture()?;
        let mut cache = open(&mut f)?;
        let mut stats = Statistics::default();
        let id = f.key.id_hash(b"x");
        cache.add_chunk(&mut f.repository, &f.key, id, b"x", &mut stats)?;
        assert!(cache.path().join("txn.active").is_dir());
        cache.rollback()?;
        assert_eq!(cache.seen_chunk(&id), 0);
        assert!(!cache.path().join("txn.active").exists());
        Ok(())
    }

    #[test]
    fn test_files_cache() -> Result<()> {
        let mut f = fixture()?;
        let file = f.cache_dir.with_file_name("file.txt");
        fs::write(&file, b"content")?;
        let metadata = fs::metadata(&file)?;
        let path_hash = f.key.id_hash(file.to_string_lossy().as_bytes());
        let ids = vec![ObjectId([1; 32])];

        let mut cache = open(&mut f)?;
        assert_eq!(cache.file_known_and_unchanged(&path_hash, &metadata)?, None);
        cache.begin_txn()?;
        cache.memorize_file(path_hash, &metadata, ids.clone())?;
        assert_eq!(cache.file_known_and_unchanged(&path_hash, &metadata)?, Some(ids.clone()));
        // nothing newer was seen, so the entry is not trusted yet and not saved
        cache.commit(&f.manifest)?;
        drop(cache);

        let mut cache = open(&mut f)?;
        assert_eq!(cache.file_known_and_unchanged(&path_hash, &metadata)?, None);

        // an entry older than the newest mtime of the run survives
        let newer = f.cache_dir.with_file_name("newer.txt");
        std::thread::sleep(Duration::from_millis(20));
        fs::write(&newer, b"later")?;
        cache.begin_txn()?;
        cache.memorize_file(path_hash, &metadata, ids.clone())?;
        cache.memorize_file(f.key.id_hash(b"newer"), &fs::metadata(&newer)?, vec![])?;
        cache.commit(&f.manifest)?;
        drop(cache);

        let mut cache = open(&mut f)?;
        assert_eq!(cache.file_known_and_unchanged(&path_hash, &metadata)?, Some(ids));
        fs::write(&file, b"changed content")?;
        assert_eq!(cache.file_known_and_unchanged(&path_hash, &fs::metadata(&file)?)?, None);
        Ok(())
    }

    /// An old file and a newer one, so the old entry is trusted on commit
    fn old_and_new(f: &Fixture) -> Result<(PathBuf, PathBuf)> {
        let old = f.cache_dir.with_file_name("old.txt");
        fs::write(&old, b"old")?;
        std::thread::sleep(Duration::from_millis(20));
        let new = f.cache_dir.with_file_name("new.txt");
        fs::write(&new, b"new")?;
        Ok((old, new))
    }

    #[test]
    fn test_files_cache_survives_intermediate_commit() -> Result<()> {
        let mut f = fixture()?;
        let (old, new) = old_and_new(&f)?;
        let old_hash = f.key.id_hash(b"old");
        let ids = vec![ObjectId([2; 32])];

        let mut cache = open(&mut f)?;
        cache.begin_txn()?;
        cache.memorize_file(old_hash, &fs::metadata(&old)?, ids.clone())?;
        cache.memorize_file(f.key.id_hash(b"new"), &fs::metadata(&new)?, vec![])?;
        // a checkpoint commits and the rest of the run opens a new transaction
        cache.commit(&f.manifest)?;
        cache.begin_txn()?;
        cache.commit(&f.manifest)?;
        drop(cache);

        let mut cache = open(&mut f)?;
        assert_eq!(cache.file_known_and_unchanged(&old_hash, &fs::metadata(&old)?)?, Some(ids));
        Ok(())
    }

    #[test]
    fn test_files_cache_entries_expire() -> Result<()> {
        let mut f = fixture()?;
        let (old, new) = old_and_new(&f)?;
        let (old_hash, new_hash) = (f.key.id_hash(b"old"), f.key.id_hash(b"new"));
        let ids = vec![ObjectId([3; 32])];

        let mut cache = open(&mut f)?;
        cache.begin_txn()?;
        cache.memorize_file(old_hash, &fs::metadata(&old)?, ids.clone())?;
        cache.memorize_file(new_hash, &fs::metadata(&new)?, vec![])?;
        cache.commit(&f.manifest)?;
        drop(cache);

        // runs that only see the newer file age the old entry out
        for _ in 0..MAX_FILE_AGE {
            let mut cache = open(&mut f)?;
            cache.begin_txn()?;
            cache.memorize_file(new_hash, &fs::metadata(&new)?, vec![])?;
            cache.commit(&f.manifest)?;
        }

        let mut cache = open(&mut f)?;
        assert_eq!(cache.file_known_and_unchanged(&old_hash, &fs::metadata(&old)?)?, None);
        Ok(())
    }

    #[test]
    fn test_replay_detected() -> Result<()> {
        let mut f = fixture()?;
        drop(open(&mut f)?);
        let mut stale = f.manifest.clone();
        stale.timestamp = stale.timestamp.map(|t| t - chrono::Duration::hours(1));
        assert!(matches!(
            Cache::open(&f.cache_dir, &mut f.repository, &f.key, &stale, DEFAULT_LOCK_WAIT),
            Err(Error::RepositoryReplay)
        ));
        Ok(())
    }
}
