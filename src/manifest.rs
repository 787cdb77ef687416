//! Repository manifest: the list of archives and repository-wide settings

use crate::chunker::ChunkerParams;
use crate::id::ObjectId;
use crate::key::{Key, PassphraseProvider};
use crate::repository::Repository;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Manifest entry pointing at an archive's metadata object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: ObjectId,
    pub time: DateTime<Utc>,
}

/// An archive as listed by the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub name: String,
    pub id: ObjectId,
    pub time: DateTime<Utc>,
}

/// Settings shared by every client of a repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestConfig {
    pub chunker: ChunkerParams,
}

#[derive(Serialize, Deserialize)]
struct ManifestData {
    version: u32,
    archives: BTreeMap<String, ArchiveEntry>,
    timestamp: Option<DateTime<Utc>>,
    config: ManifestConfig,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub archives: BTreeMap<String, ArchiveEntry>,
    pub timestamp: Option<DateTime<Utc>>,
    pub config: ManifestConfig,
    id: ObjectId,
}

impl Manifest {
    pub fn new(config: ManifestConfig) -> Self {
        Self {
            archives: BTreeMap::new(),
            timestamp: None,
            config,
            id: ObjectId::default(),
        }
    }

    /// Load the manifest, detecting and unlocking the repository key
    pub fn load(
        repository: &mut Repository,
        keys_dir: &Path,
        passphrases: &mut dyn PassphraseProvider,
    ) -> Result<(Self, Key)> {
        let data = repository.get(&ObjectId::MANIFEST)?;
        let key = Key::detect(repository, &data, keys_dir, passphrases)?;
        let manifest = Self::decode(&key, &data)?;
        Ok((manifest, key))
    }

    /// Load the manifest with an already unlocked key
    pub fn load_with_key(repository: &mut Repository, key: &Key) -> Result<Self> {
        let data = repository.get(&ObjectId::MANIFEST)?;
        Self::decode(key, &data)
    }

    fn decode(key: &Key, data: &[u8]) -> Result<Self> {
        let plain = key.decrypt(None, data)?;
        let decoded: ManifestData = rmp_serde::from_slice(&plain)?;
        if decoded.version != MANIFEST_VERSION {
            return Err(Error::UnsupportedPayload {
                reason: format!("unknown manifest version {}", decoded.version),
            });
        }
        decoded.config.chunker.validate()?;
        Ok(Self {
            archives: decoded.archives,
            timestamp: decoded.timestamp,
            config: decoded.config,
            id: key.id_hash(&plain),
        })
    }

    /// Store the manifest; the caller commits the repository
    pub fn write(&mut self, repository: &mut Repository, key: &Key) -> Result<()> {
        // strictly increasing, the cache relies on it to detect replays
        let now = Utc::now();
        self.timestamp = Some(match self.timestamp {
            Some(previous) if previous >= now => previous + Duration::milliseconds(1),
            _ => now,
        });
        let data = ManifestData {
            version: MANIFEST_VERSION,
            archives: self.archives.clone(),
            timestamp: self.timestamp,
            config: self.config.clone(),
        };
        let plain = rmp_serde::to_vec_named(&data)?;
        self.id = key.id_hash(&plain);
        repository.put(&ObjectId::MANIFEST, &key.encrypt(&plain)?)?;
        debug!(archives = self.archives.len(), "manifest written");
        Ok(())
    }

    /// Hash of the manifest as last loaded or written
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Archives ordered by creation time
    pub fn list_archives(&self) -> Vec<ArchiveInfo> {
        let mut archives: Vec<ArchiveInfo> = self
            .archives
            .iter()
            .map(|(name, entry)| ArchiveInfo {
                name: name.clone(),
                id: entry.id,
                time: entry.time,
            })
            .collect();
        archives.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.name.cmp(&b.name)));
        archives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Compression, FixedPassphrase};
    use crate::repository::DEFAULT_LOCK_WAIT;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut repo = Repository::create(temp_dir.path().join("repo"), DEFAULT_LOCK_WAIT)?;
        let key = Key::plaintext(Compression::default());

        let mut manifest = Manifest::new(ManifestConfig::default());
        let time = Utc::now() - Duration::hours(1);
        manifest.archives.insert("b".into(), ArchiveEntry { id: ObjectId([2; 32]), time });
        manifest.archives.insert(
            "a".into(),
            ArchiveEntry { id: ObjectId([1; 32]), time: time + Duration::minutes(5) },
        );
        manifest.write(&mut repo, &key)?;
        let first_timestamp = manifest.timestamp;
        manifest.write(&mut repo, &key)?;
        assert!(manifest.timestamp > first_timestamp);
        repo.commit()?;

        let (loaded, loaded_key) =
            Manifest::load(&mut repo, temp_dir.path(), &mut FixedPassphrase(String::new()))?;
        assert_eq!(loaded_key.mode(), crate::key::KeyMode::None);
        assert_eq!(loaded.archives, manifest.archives);
        assert_eq!(loaded.id(), manifest.id());
        let names: Vec<String> = loaded.list_archives().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["b", "a"]);
        Ok(())
    }

    #[test]
    fn test_missing_manifest() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut repo = Repository::create(temp_dir.path().join("repo"), DEFAULT_LOCK_WAIT)?;
        let key = Key::plaintext(Compression::default());
        assert!(matches!(
            Manifest::load_with_key(&mut repo, &key),
            Err(Error::ObjectNotFound { .. })
        ));
        Ok(())
    }
}
