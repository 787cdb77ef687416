//! End-to-end run over an encrypted repository: init, create, reopen,
//! extract, check and delete through the library API.

use burrow::archive::checker::CheckOptions;
use burrow::archive::{Archive, ArchiveChecker, CreateOptions, ExtractOptions};
use burrow::cache::Cache;
use burrow::helpers::Statistics;
use burrow::key::{Compression, FixedPassphrase, Key, KeyMode};
use burrow::manifest::{Manifest, ManifestConfig};
use burrow::repository::{Repository, DEFAULT_LOCK_WAIT};
use burrow::Result;
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const PASSPHRASE: &str = "correct horse battery staple";

fn passphrase() -> FixedPassphrase {
    FixedPassphrase(PASSPHRASE.to_string())
}

fn init(repo: &Path, keys: &Path) -> Result<()> {
    let mut repository = Repository::create(repo, DEFAULT_LOCK_WAIT)?;
    let key = Key::create(&repository, KeyMode::Passphrase, Compression::Zstd(3), keys, &mut passphrase())?;
    let mut manifest = Manifest::new(ManifestConfig::default());
    manifest.write(&mut repository, &key)?;
    repository.commit()?;
    Ok(())
}

fn create(repo: &Path, keys: &Path, cache_dir: &Path, name: &str, root: &Path) -> Result<Statistics> {
    let mut repository = Repository::open(repo, true, DEFAULT_LOCK_WAIT)?;
    let (mut manifest, key) = Manifest::load(&mut repository, keys, &mut passphrase())?;
    let mut cache = Cache::open(cache_dir, &mut repository, &key, &manifest, DEFAULT_LOCK_WAIT)?;
    let mut archive = Archive::create(
        &mut repository,
        &key,
        &mut manifest,
        &mut cache,
        name,
        CreateOptions::default(),
    )?;
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let st = entry.path().symlink_metadata()?;
        if st.is_dir() {
            archive.process_dir(entry.path(), &st)?;
        } else {
            archive.process_file(entry.path(), &st)?;
        }
    }
    archive.save()?;
    Ok(*archive.stats())
}

#[test]
fn test_encrypted_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let (repo, keys, cache_dir) = (dir.path().join("repo"), dir.path().join("keys"), dir.path().join("cache"));
    let src = dir.path().join("src");
    fs::create_dir_all(src.join("docs"))?;
    fs::write(src.join("docs/notes.txt"), b"burrow keeps what matters")?;
    let data: Vec<u8> = (0..2_000_000u32).map(|i| (i.wrapping_mul(2654435761) >> 11) as u8).collect();
    fs::write(src.join("blob.bin"), &data)?;

    init(&repo, &keys)?;
    let first = create(&repo, &keys, &cache_dir, "monday", &src)?;
    assert_eq!(first.nfiles, 2);
    let second = create(&repo, &keys, &cache_dir, "tuesday", &src)?;
    assert!(second.deduplicated_size < first.deduplicated_size / 100);

    // stored objects never contain the plaintext
    for entry in walkdir::WalkDir::new(repo.join("data")) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let segment = fs::read(entry.path())?;
            assert!(!segment.windows(13).any(|w| w == b"burrow keeps "));
        }
    }

    let mut repository = Repository::open(&repo, true, DEFAULT_LOCK_WAIT)?;
    let (mut manifest, key) = Manifest::load(&mut repository, &keys, &mut passphrase())?;
    let names: Vec<String> = Archive::list_archives(&manifest).into_iter().map(|a| a.name).collect();
    assert_eq!(names, vec!["monday".to_string(), "tuesday".to_string()]);

    let dest = dir.path().join("dest");
    let options = ExtractOptions { destination: dest.clone(), ..Default::default() };
    let mut archive = Archive::open(&mut repository, &key, &mut manifest, None, "monday")?;
    let mut items = archive.iter_items(|item| !item.is_dir());
    let mut restored = 0;
    while let Some(item) = items.next_item(&mut archive)? {
        archive.extract_item(&item, &options, true)?;
        let original = Path::new("/").join(item.path_str());
        assert_eq!(fs::read(options.target(&item))?, fs::read(original)?);
        restored += 1;
    }
    assert_eq!(restored, 2);
    drop(archive);

    let mut checker = ArchiveChecker::new();
    assert!(checker.check(&mut repository, &keys, &mut passphrase(), CheckOptions::default())?);
    assert_eq!(checker.errors(), 0);

    let mut cache = Cache::open(&cache_dir, &mut repository, &key, &manifest, DEFAULT_LOCK_WAIT)?;
    let mut stats = Statistics::default();
    Archive::open(&mut repository, &key, &mut manifest, Some(&mut cache), "monday")?.delete(&mut stats)?;
    manifest.write(&mut repository, &key)?;
    repository.commit()?;
    cache.commit(&manifest)?;
    assert!(stats.deduplicated_size < 1024);
    assert_eq!(manifest.list_archives().len(), 1);
    Ok(())
}

#[test]
fn test_wrong_passphrase_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let (repo, keys) = (dir.path().join("repo"), dir.path().join("keys"));
    init(&repo, &keys)?;
    let mut repository = Repository::open(&repo, false, DEFAULT_LOCK_WAIT)?;
    let result = Manifest::load(&mut repository, &keys, &mut FixedPassphrase("nope".to_string()));
    assert!(result.is_err());
    Ok(())
}
