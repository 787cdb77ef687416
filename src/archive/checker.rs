//! Archive-level consistency check and repair

use super::{ArchiveMetadata, ChunkRef, Item, Unpacker, ARCHIVE_VERSION};
use crate::chunker::Chunker;
use crate::id::ObjectId;
use crate::key::{Key, PassphraseProvider};
use crate::manifest::{ArchiveEntry, Manifest, ManifestConfig};
use crate::repository::Repository;
use crate::{Error, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use tracing::{error, info, span, warn, Level};

/// Objects fetched per batch when verifying data
const VERIFY_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    pub repair: bool,
    pub verify_data: bool,
}

/// Walks the manifest, every archive and every chunk they reference,
/// tracking reference counts of all objects in the repository
#[derive(Debug, Default)]
pub struct ArchiveChecker {
    chunks: HashMap<ObjectId, u32>,
    errors: usize,
}

impl ArchiveChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of problems found by the last check
    pub fn errors(&self) -> usize {
        self.errors
    }

    fn report(&mut self, message: String) {
        error!("{}", message);
        self.errors += 1;
    }

    /// Returns true when the repository is consistent or was repaired
    pub fn check(
        &mut self,
        repository: &mut Repository,
        keys_dir: &Path,
        passphrases: &mut dyn PassphraseProvider,
        options: CheckOptions,
    ) -> Result<bool> {
        let span = span!(Level::INFO, "archive_check", repair = options.repair);
        let _enter = span.enter();
        self.errors = 0;
        self.chunks = repository.list().into_iter().map(|id| (id, 0)).collect();
        let Some(sample) = self.sample_object() else {
            self.report("Repository contains no apparent data at all, cannot continue check/repair.".into());
            return Ok(false);
        };
        let data = repository.get(&sample)?;
        let key = Key::detect(repository, &data, keys_dir, passphrases)?;

        if options.verify_data {
            self.verify_data(repository, &key, options.repair)?;
        }

        let mut manifest = if self.chunks.contains_key(&ObjectId::MANIFEST) {
            match Manifest::load_with_key(repository, &key) {
                Ok(manifest) => manifest,
                Err(e) => {
                    self.report(format!("Repository manifest is unreadable: {}", e));
                    self.rebuild_manifest(repository, &key)?
                }
            }
        } else {
            self.report("Repository manifest not found!".into());
            self.rebuild_manifest(repository, &key)?
        };
        self.mark(&ObjectId::MANIFEST);

        self.rebuild_refcounts(repository, &key, &mut manifest, options.repair)?;
        self.orphan_chunks_check(repository, options.repair)?;

        if options.repair {
            manifest.write(repository, &key)?;
            repository.commit()?;
        }
        if self.errors == 0 {
            info!("Archive consistency check complete, no problems found.");
        } else if options.repair {
            warn!("{} problems found and repaired.", self.errors);
        } else {
            error!("{} problems found.", self.errors);
        }
        Ok(options.repair || self.errors == 0)
    }

    fn sample_object(&self) -> Option<ObjectId> {
        if self.chunks.contains_key(&ObjectId::MANIFEST) {
            return Some(ObjectId::MANIFEST);
        }
        self.chunks.keys().min().copied()
    }

    fn mark(&mut self, id: &ObjectId) -> bool {
        match self.chunks.get_mut(id) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    /// Reference `data` under `id`, storing it when the repository lacks it
    fn add_reference(&mut self, repository: &mut Repository, key: &Key, id: ObjectId, data: &[u8]) -> Result<()> {
        if !self.mark(&id) {
            repository.put(&id, &key.encrypt(data)?)?;
            self.chunks.insert(id, 1);
        }
        Ok(())
    }

    /// Decrypt every object; corrupted ones are dropped when repairing so
    /// the reference pass treats them as missing
    fn verify_data(&mut self, repository: &mut Repository, key: &Key, repair: bool) -> Result<()> {
        info!("Starting cryptographic data integrity verification...");
        let ids = repository.list();
        let mut corrupted: Vec<(ObjectId, String)> = Vec::new();
        for batch in ids.chunks(VERIFY_BATCH) {
            let mut objects = Vec::with_capacity(batch.len());
            for id in batch {
                match repository.get(id) {
                    Ok(data) => objects.push((*id, data)),
                    Err(e) => corrupted.push((*id, e.to_string())),
                }
            }
            corrupted.par_extend(objects.par_iter().filter_map(|(id, data)| {
                let expected = (*id != ObjectId::MANIFEST).then_some(id);
                key.decrypt(expected, data).err().map(|e| (*id, e.to_string()))
            }));
        }
        for (id, reason) in corrupted {
            self.report(format!("chunk {} is corrupted: {}", id, reason));
            if repair && id != ObjectId::MANIFEST {
                repository.delete(&id)?;
                self.chunks.remove(&id);
            }
        }
        info!("Finished cryptographic data integrity verification of {} objects.", ids.len());
        Ok(())
    }

    /// Recreate the manifest from archive metadata objects found in the repository
    fn rebuild_manifest(&mut self, repository: &mut Repository, key: &Key) -> Result<Manifest> {
        warn!("Rebuilding the manifest with default chunker parameters");
        let mut manifest = Manifest::new(ManifestConfig::default());
        let mut ids: Vec<ObjectId> = self.chunks.keys().copied().collect();
        ids.sort();
        for id in ids {
            if id == ObjectId::MANIFEST {
                continue;
            }
            let Ok(cdata) = repository.get(&id) else { continue };
            let Ok(data) = key.decrypt(Some(&id), &cdata) else { continue };
            let Ok(metadata) = rmp_serde::from_slice::<ArchiveMetadata>(&data) else { continue };
            if metadata.version != ARCHIVE_VERSION {
                continue;
            }
            let entry = ArchiveEntry { id, time: metadata.time };
            match manifest.archives.get(&metadata.name) {
                Some(existing) if existing.time >= entry.time => {}
                _ => {
                    info!("Found archive {}", metadata.name);
                    manifest.archives.insert(metadata.name, entry);
                }
            }
        }
        info!("Manifest rebuild complete.");
        Ok(manifest)
    }

    /// Count references from every archive. Repairing rewrites each item
    /// stream, substituting zero-filled chunks for missing file data.
    fn rebuild_refcounts(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        manifest: &mut Manifest,
        repair: bool,
    ) -> Result<()> {
        let chunker = Chunker::new(manifest.config.chunker, key.chunk_seed());
        for info in manifest.list_archives() {
            info!("Analyzing archive {}", info.name);
            if !self.chunks.contains_key(&info.id) {
                self.report(format!("Archive metadata block {} is missing", info.id));
                manifest.archives.remove(&info.name);
                continue;
            }
            let data = key.decrypt(Some(&info.id), &repository.get(&info.id)?)?;
            let metadata = ArchiveMetadata::decode(&data)?;
            if !repair {
                self.mark(&info.id);
            }

            let mut stream = Vec::new();
            let mut unpacker = Unpacker::new();
            for item_id in &metadata.items {
                if !self.chunks.contains_key(item_id) {
                    self.report(format!("{}: item stream chunk {} is missing", info.name, item_id));
                    unpacker.clear();
                    continue;
                }
                if !repair {
                    self.mark(item_id);
                }
                let data = key.decrypt(Some(item_id), &repository.get(item_id)?)?;
                unpacker.feed(&data);
                loop {
                    match unpacker.next_value::<Item>() {
                        Ok(Some(mut item)) => {
                            self.verify_file_chunks(repository, key, &info.name, &mut item, repair)?;
                            if repair {
                                stream.extend(rmp_serde::to_vec_named(&item)?);
                            }
                        }
                        Ok(None) => break,
                        Err(Error::Decode(e)) => {
                            self.report(format!("{}: invalid item stream data: {}", info.name, e));
                            if !unpacker.resync() {
                                break;
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            if repair {
                let mut items = Vec::new();
                for chunk in chunker.chunk_bytes(&stream)? {
                    let id = key.id_hash(&chunk);
                    self.add_reference(repository, key, id, &chunk)?;
                    items.push(id);
                }
                let metadata = ArchiveMetadata { items, ..metadata };
                let data = rmp_serde::to_vec_named(&metadata)?;
                let id = key.id_hash(&data);
                self.add_reference(repository, key, id, &data)?;
                manifest
                    .archives
                    .insert(info.name.clone(), ArchiveEntry { id, time: info.time });
            }
        }
        Ok(())
    }

    fn verify_file_chunks(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        archive: &str,
        item: &mut Item,
        repair: bool,
    ) -> Result<()> {
        let path = item.path_str();
        let Some(chunks) = item.chunks.as_mut() else { return Ok(()) };
        let mut offset = 0;
        for chunk in chunks.iter_mut() {
            if self.chunks.contains_key(&chunk.id) {
                self.mark(&chunk.id);
            } else {
                self.report(format!(
                    "{}: {}: missing file chunk detected (byte {}-{})",
                    archive,
                    path,
                    offset,
                    offset + chunk.size
                ));
                if repair {
                    let zeros = vec![0u8; chunk.size as usize];
                    let id = key.id_hash(&zeros);
                    self.add_reference(repository, key, id, &zeros)?;
                    *chunk = ChunkRef { id, size: chunk.size, csize: chunk.csize };
                }
            }
            offset += chunk.size;
        }
        Ok(())
    }

    fn orphan_chunks_check(&mut self, repository: &mut Repository, repair: bool) -> Result<()> {
        let orphans: Vec<ObjectId> = self
            .chunks
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }
        self.report(format!("{} orphaned objects found", orphans.len()));
        if repair {
            for id in &orphans {
                repository.delete(id)?;
                self.chunks.remove(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, CreateOptions};
    use crate::cache::Cache;
    use crate::key::{Compression, FixedPassphrase};
    use crate::repository::DEFAULT_LOCK_WAIT;
    use std::fs;
    use tempfile::TempDir;

    fn populated() -> Result<(TempDir, Repository, Key)> {
        let dir = TempDir::new()?;
        let mut repository = Repository::create(dir.path().join("repo"), DEFAULT_LOCK_WAIT)?;
        let key = Key::plaintext(Compression::default());
        let mut manifest = Manifest::new(ManifestConfig::default());
        manifest.write(&mut repository, &key)?;
        repository.commit()?;
        let mut cache = Cache::open(&dir.path().join("cache"), &mut repository, &key, &manifest, DEFAULT_LOCK_WAIT)?;

        let file = dir.path().join("data.bin");
        fs::write(&file, vec![7u8; 5000])?;
        let st = fs::symlink_metadata(&file)?;
        let mut archive = Archive::create(
            &mut repository,
            &key,
            &mut manifest,
            &mut cache,
            "archive",
            CreateOptions::default(),
        )?;
        archive.process_file(&file, &st)?;
        archive.save()?;
        drop(archive);
        drop(cache);
        Ok((dir, repository, key))
    }

    fn check(repository: &mut Repository, dir: &TempDir, options: CheckOptions) -> Result<(bool, usize)> {
        let mut checker = ArchiveChecker::new();
        let ok = checker.check(repository, dir.path(), &mut FixedPassphrase(String::new()), options)?;
        Ok((ok, checker.errors()))
    }

    #[test]
    fn test_clean_repository() -> Result<()> {
        let (dir, mut repository, _key) = populated()?;
        let options = CheckOptions { repair: false, verify_data: true };
        assert_eq!(check(&mut repository, &dir, options)?, (true, 0));
        Ok(())
    }

    #[test]
    fn test_missing_chunk_repaired() -> Result<()> {
        let (dir, mut repository, key) = populated()?;
        let lost = key.id_hash(&vec![7u8; 5000]);
        repository.delete(&lost)?;
        repository.commit()?;

        let (ok, errors) = check(&mut repository, &dir, CheckOptions::default())?;
        assert!(!ok);
        assert!(errors >= 1);

        let repair = CheckOptions { repair: true, verify_data: false };
        assert!(check(&mut repository, &dir, repair)?.0);
        assert!(repository.contains(&key.id_hash(&vec![0u8; 5000])));
        // the replaced stream and metadata leave orphans that the repair removed
        assert_eq!(check(&mut repository, &dir, CheckOptions::default())?, (true, 0));
        Ok(())
    }

    #[test]
    fn test_manifest_rebuilt() -> Result<()> {
        let (dir, mut repository, key) = populated()?;
        repository.delete(&ObjectId::MANIFEST)?;
        repository.commit()?;

        let repair = CheckOptions { repair: true, verify_data: false };
        assert!(check(&mut repository, &dir, repair)?.0);
        let manifest = Manifest::load_with_key(&mut repository, &key)?;
        assert!(manifest.archives.contains_key("archive"));
        assert_eq!(check(&mut repository, &dir, CheckOptions::default())?, (true, 0));
        Ok(())
    }

    #[test]
    fn test_unreadable_manifest_rebuilt() -> Result<()> {
        let (dir, mut repository, key) = populated()?;
        repository.put(&ObjectId::MANIFEST, &key.encrypt(b"not a manifest")?)?;
        repository.commit()?;

        let (ok, errors) = check(&mut repository, &dir, CheckOptions::default())?;
        assert!(!ok);
        assert!(errors >= 1);
        let repair = CheckOptions { repair: true, verify_data: false };
        assert!(check(&mut repository, &dir, repair)?.0);
        let manifest = Manifest::load_with_key(&mut repository, &key)?;
        assert_eq!(manifest.config, ManifestConfig::default());
        assert!(manifest.archives.contains_key("archive"));
        Ok(())
    }

    #[test]
    fn test_unreadable_object_reported() -> Result<()> {
        let (dir, mut repository, key) = populated()?;
        let marker = b"segment bytes that will rot on disk";
        let id = key.id_hash(marker);
        repository.put(&id, marker)?;
        repository.commit()?;
        for entry in walkdir::WalkDir::new(dir.path().join("repo").join("data")) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let mut segment = fs::read(entry.path())?;
            if let Some(at) = segment.windows(marker.len()).position(|w| w == marker) {
                segment[at] ^= 0xff;
                fs::write(entry.path(), segment)?;
            }
        }
        assert!(matches!(repository.get(&id), Err(Error::IntegrityError { .. })));

        let verify = CheckOptions { repair: false, verify_data: true };
        let (ok, errors) = check(&mut repository, &dir, verify)?;
        assert!(!ok);
        assert!(errors >= 1);
        let repair = CheckOptions { repair: true, verify_data: true };
        assert!(check(&mut repository, &dir, repair)?.0);
        assert!(!repository.contains(&id));
        assert_eq!(check(&mut repository, &dir, verify)?, (true, 0));
        Ok(())
    }

    #[test]
    fn test_orphans_reported() -> Result<()> {
        let (dir, mut repository, key) = populated()?;
        let stray = b"nobody references me";
        repository.put(&key.id_hash(stray), &key.encrypt(stray)?)?;
        repository.commit()?;
        assert_eq!(check(&mut repository, &dir, CheckOptions::default())?, (false, 1));
        let repair = CheckOptions { repair: true, verify_data: false };
        assert!(check(&mut repository, &dir, repair)?.0);
        assert!(!repository.contains(&key.id_hash(stray)));
        Ok(())
    }
}
