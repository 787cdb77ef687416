//! Transactional, log-structured object store
//!
//! Objects are appended to segment files; `index.N` maps every live id to
//! its segment and offset as of the transaction committed in segment `N`.
//! Overwritten and deleted objects leave garbage behind that commit
//! reclaims by compacting the affected segments.

mod lock;
pub mod segment;

pub use lock::UpgradableLock;

use crate::hashindex::{NsIndex, SegmentOffset};
use crate::id::ObjectId;
use crate::{Error, Result};
use rand::RngCore;
use segment::{Entry, LoggedIo, TAG_COMMIT, TAG_DELETE, TAG_PUT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, span, warn, Level};

pub const MAX_OBJECT_SIZE: usize = 20 * 1024 * 1024;
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_SEGMENTS_PER_DIR: u32 = 10000;
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(1);

const REPOSITORY_VERSION: u32 = 1;
const HINTS_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepositoryConfig {
    version: u32,
    segments_per_dir: u32,
    max_segment_size: u64,
    id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Hints {
    version: u32,
    segments: BTreeMap<u32, u32>,
    compact: BTreeSet<u32>,
}

/// On-disk object store
pub struct Repository {
    path: PathBuf,
    id: [u8; 32],
    lock: UpgradableLock,
    io: LoggedIo,
    index: NsIndex,
    /// Live object count per segment
    segments: BTreeMap<u32, u32>,
    /// Segments containing garbage
    compact: BTreeSet<u32>,
    transaction_id: Option<u32>,
    active_txn: bool,
}

fn index_files(path: &Path, prefix: &str) -> Result<Vec<(u32, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let n = name
            .to_str()
            .and_then(|s| s.strip_prefix(prefix))
            .and_then(|s| s.parse::<u32>().ok());
        if let Some(n) = n {
            found.push((n, entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

impl Repository {
    /// Initialize an empty repository at `path` and open it exclusively
    pub fn create<P: AsRef<Path>>(path: P, lock_wait: Duration) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() && (!path.is_dir() || fs::read_dir(path)?.next().is_some()) {
            return Err(Error::RepositoryAlreadyExists {
                path: path.display().to_string(),
            });
        }
        fs::create_dir_all(path.join("data"))?;
        fs::write(path.join("README"), "This is a burrow repository\n")?;

        let mut id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut id);
        let config = RepositoryConfig {
            version: REPOSITORY_VERSION,
            segments_per_dir: DEFAULT_SEGMENTS_PER_DIR,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            id: hex::encode(id),
        };
        fs::write(path.join("config"), toml::to_string_pretty(&config)?)?;
        info!("Created repository at {}", path.display());
        Self::open(path, true, lock_wait)
    }

    pub fn open<P: AsRef<Path>>(path: P, exclusive: bool, lock_wait: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config_path = path.join("config");
        if !config_path.is_file() {
            return Err(if path.exists() {
                Error::InvalidRepository {
                    path: path.display().to_string(),
                }
            } else {
                Error::RepositoryDoesNotExist {
                    path: path.display().to_string(),
                }
            });
        }
        let lock = UpgradableLock::acquire(&config_path, exclusive, lock_wait)?;
        let config: RepositoryConfig = toml::from_str(&fs::read_to_string(&config_path)?)?;
        let id = hex::decode(&config.id)
            .ok()
            .and_then(|b| <[u8; 32]>::try_from(b).ok());
        let id = match id {
            Some(id) if config.version == REPOSITORY_VERSION && config.segments_per_dir > 0 => id,
            _ => {
                return Err(Error::InvalidRepository {
                    path: path.display().to_string(),
                })
            }
        };
        let io = LoggedIo::new(&path, config.max_segment_size, config.segments_per_dir)?;

        let mut repository = Self {
            path,
            id,
            lock,
            io,
            index: NsIndex::new(),
            segments: BTreeMap::new(),
            compact: BTreeSet::new(),
            transaction_id: None,
            active_txn: false,
        };
        repository.load_transaction()?;
        Ok(repository)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> &[u8; 32] {
        &self.id
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    fn index_transaction_id(&self) -> Result<Option<u32>> {
        Ok(index_files(&self.path, "index.")?.last().map(|(n, _)| *n))
    }

    /// Bring the in-memory index up to the newest committed segment,
    /// replaying the log when no index was written for it
    fn load_transaction(&mut self) -> Result<()> {
        let index_tid = self.index_transaction_id()?;
        let segments_tid = self.io.segments_transaction_id()?;
        if index_tid.is_some() && segments_tid.is_none() {
            return Err(Error::integrity(format!(
                "{}: index present but no committed segment, run check --repair",
                self.path.display()
            )));
        }
        if self.lock.is_exclusive() {
            self.io.cleanup(segments_tid)?;
        }
        self.open_index(index_tid)?;
        if index_tid != segments_tid {
            warn!(?index_tid, ?segments_tid, "index out of date, replaying segments");
            self.replay_segments(index_tid, segments_tid)?;
        }
        self.transaction_id = segments_tid;
        Ok(())
    }

    fn open_index(&mut self, transaction_id: Option<u32>) -> Result<()> {
        match transaction_id {
            None => {
                self.index = NsIndex::new();
                self.segments.clear();
                self.compact.clear();
            }
            Some(tid) => {
                self.index = NsIndex::read(self.path.join(format!("index.{}", tid)))?;
                let hints: Hints = rmp_serde::from_slice(&fs::read(self.path.join(format!("hints.{}", tid)))?)?;
                if hints.version != HINTS_VERSION {
                    return Err(Error::integrity(format!("unknown hints version {}", hints.version)));
                }
                self.segments = hints.segments;
                self.compact = hints.compact;
            }
        }
        Ok(())
    }

    fn replay_segments(&mut self, index_tid: Option<u32>, segments_tid: Option<u32>) -> Result<()> {
        self.lock.upgrade()?;
        for segment in self.io.segments()? {
            if index_tid.map_or(false, |tid| segment <= tid) {
                continue;
            }
            if segments_tid.map_or(true, |tid| segment > tid) {
                break;
            }
            let objects = self.io.iter_objects(segment, false)?;
            self.update_index(segment, &objects, &mut |msg| warn!("{}", msg))?;
        }
        self.write_index()
    }

    fn update_index(
        &mut self,
        segment: u32,
        objects: &[Entry],
        report: &mut dyn FnMut(String),
    ) -> Result<()> {
        for entry in objects {
            match (entry.tag, entry.id) {
                (TAG_PUT, Some(id)) => {
                    if let Some(old) = self.index.get(&id) {
                        self.compact.insert(old.segment);
                        self.decrement(old.segment);
                    }
                    self.index.insert(id, SegmentOffset { segment, offset: entry.offset });
                    *self.segments.entry(segment).or_insert(0) += 1;
                }
                (TAG_DELETE, Some(id)) => {
                    if let Some(old) = self.index.remove(&id) {
                        self.decrement(old.segment);
                        self.compact.insert(old.segment);
                    }
                    self.compact.insert(segment);
                }
                (TAG_COMMIT, _) => {}
                (tag, _) => report(format!("unexpected tag {} in segment {}", tag, segment)),
            }
        }
        Ok(())
    }

    fn decrement(&mut self, segment: u32) {
        if let Some(count) = self.segments.get_mut(&segment) {
            *count = count.saturating_sub(1);
        }
    }

    fn write_index(&mut self) -> Result<()> {
        let Some(tid) = self.io.latest_segment()? else {
            return Ok(());
        };
        let hints = Hints {
            version: HINTS_VERSION,
            segments: self.segments.clone(),
            compact: self.compact.clone(),
        };
        let hints_path = self.path.join(format!("hints.{}", tid));
        let tmp = self.path.join("hints.tmp");
        fs::write(&tmp, rmp_serde::to_vec_named(&hints)?)?;
        fs::rename(&tmp, &hints_path)?;
        self.index.write(self.path.join(format!("index.{}", tid)))?;

        for prefix in ["index.", "hints."] {
            for (n, stale) in index_files(&self.path, prefix)? {
                if n != tid {
                    fs::remove_file(stale)?;
                }
            }
        }
        self.transaction_id = Some(tid);
        debug!(transaction = tid, objects = self.index.len(), "index written");
        Ok(())
    }

    fn prepare_txn(&mut self) -> Result<()> {
        if self.active_txn {
            return Ok(());
        }
        self.lock.upgrade()?;
        self.io.cleanup(self.transaction_id)?;
        self.active_txn = true;
        Ok(())
    }

    pub fn get(&mut self, id: &ObjectId) -> Result<Vec<u8>> {
        let location = self.index.get(id).ok_or_else(|| Error::ObjectNotFound { id: id.to_hex() })?;
        self.io.read(location.segment, location.offset, id)
    }

    pub fn get_many<'a>(&'a mut self, ids: &'a [ObjectId]) -> impl Iterator<Item = Result<Vec<u8>>> + 'a {
        ids.iter().map(move |id| self.get(id))
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// All stored ids, sorted
    pub fn list(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn put(&mut self, id: &ObjectId, data: &[u8]) -> Result<()> {
        self.prepare_txn()?;
        if let Some(old) = self.index.get(id) {
            self.decrement(old.segment);
            self.compact.insert(old.segment);
            let segment = self.io.write_delete(id)?;
            self.segments.entry(segment).or_insert(0);
            self.compact.insert(segment);
        }
        let (segment, offset) = self.io.write_put(id, data)?;
        *self.segments.entry(segment).or_insert(0) += 1;
        self.index.insert(*id, SegmentOffset { segment, offset });
        Ok(())
    }

    pub fn delete(&mut self, id: &ObjectId) -> Result<()> {
        self.prepare_txn()?;
        let old = self.index.remove(id).ok_or_else(|| Error::ObjectNotFound { id: id.to_hex() })?;
        self.decrement(old.segment);
        self.compact.insert(old.segment);
        let segment = self.io.write_delete(id)?;
        self.segments.entry(segment).or_insert(0);
        self.compact.insert(segment);
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.active_txn {
            return Ok(());
        }
        let span = span!(Level::DEBUG, "commit");
        let _enter = span.enter();

        self.io.write_commit()?;
        self.compact_segments()?;
        self.write_index()?;
        self.active_txn = false;
        Ok(())
    }

    /// Drop everything written since the last commit
    pub fn rollback(&mut self) -> Result<()> {
        self.io.close_segment()?;
        self.active_txn = false;
        self.open_index(self.transaction_id)?;
        Ok(())
    }

    fn compact_segments(&mut self) -> Result<()> {
        if self.compact.is_empty() {
            return Ok(());
        }
        let index_tid = self.index_transaction_id()?;
        let compact: Vec<u32> = std::mem::take(&mut self.compact).into_iter().collect();
        for &segment in &compact {
            if !self.io.segment_exists(segment) {
                continue;
            }
            let entries = match self.io.iter_objects(segment, true) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(segment, "damaged segment during compaction: {}", e);
                    self.io.recover_segment(segment)?;
                    self.io.iter_objects(segment, true)?
                }
            };
            for entry in entries {
                match (entry.tag, entry.id, entry.data) {
                    (TAG_PUT, Some(id), Some(data)) => {
                        let live = self.index.get(&id)
                            == Some(SegmentOffset { segment, offset: entry.offset });
                        if live {
                            let (new_segment, offset) = self.io.write_put(&id, &data)?;
                            self.index.insert(id, SegmentOffset { segment: new_segment, offset });
                            *self.segments.entry(new_segment).or_insert(0) += 1;
                            self.decrement(segment);
                        }
                    }
                    (TAG_DELETE, Some(id), _) => {
                        // an older index may still reference the deleted object
                        if index_tid.map_or(true, |tid| segment > tid) {
                            self.io.write_delete(&id)?;
                        }
                    }
                    _ => {}
                }
            }
            if self.segments.get(&segment).copied().unwrap_or(0) != 0 {
                return Err(Error::integrity(format!("segment {} still referenced after compaction", segment)));
            }
        }
        self.io.write_commit()?;
        for segment in compact {
            self.segments.remove(&segment);
            self.io.delete_segment(segment)?;
        }
        debug!("compaction finished");
        Ok(())
    }

    /// Verify segment checksums and the index; returns `true` when the
    /// repository is consistent (or was repaired)
    pub fn check(&mut self, repair: bool) -> Result<bool> {
        let span = span!(Level::INFO, "repository_check", path = %self.path.display(), repair);
        let _enter = span.enter();

        if self.active_txn {
            self.rollback()?;
        }
        let mut error_found = false;
        let mut report = |msg: String| {
            error!("{}", msg);
            error_found = true;
        };

        let current_index = self.index.clone();
        let index_tid = self.index_transaction_id()?;
        let segments_tid = self.io.segments_transaction_id()?;
        let transaction_id = match segments_tid.or(index_tid) {
            Some(tid) => Some(tid),
            None => self.io.latest_segment()?,
        };
        if repair {
            self.lock.upgrade()?;
            self.io.cleanup(transaction_id)?;
        }

        self.index = NsIndex::new();
        self.segments.clear();
        self.compact.clear();
        for segment in self.io.segments()? {
            if transaction_id.map_or(true, |tid| segment > tid) {
                continue;
            }
            let objects = match self.io.iter_objects(segment, false) {
                Ok(objects) => objects,
                Err(e) => {
                    report(e.to_string());
                    if repair {
                        self.io.recover_segment(segment)?;
                        self.io.iter_objects(segment, false)?
                    } else {
                        Vec::new()
                    }
                }
            };
            self.update_index(segment, &objects, &mut report)?;
        }

        if let (true, None, Some(tid)) = (repair, segments_tid, transaction_id) {
            report(format!("adding commit tag to segment {}", tid));
            self.io.cleanup(Some(tid))?;
            self.io.write_commit()?;
        }

        if !repair {
            if current_index.len() != self.index.len() {
                report(format!(
                    "index object count mismatch: {} != {}",
                    current_index.len(),
                    self.index.len()
                ));
            } else {
                for (id, location) in self.index.iter() {
                    if current_index.get(id) != Some(*location) {
                        report(format!("index mismatch for key {}", id));
                    }
                }
            }
            self.index = current_index;
            self.open_index(self.transaction_id)?;
        } else {
            self.active_txn = true;
            self.io.write_commit()?;
            self.compact_segments()?;
            self.write_index()?;
            self.active_txn = false;
        }
        if !error_found {
            info!("Repository check complete, no problems found");
        }
        Ok(!error_found || repair)
    }
}
