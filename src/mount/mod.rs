//! Read-only filesystem view of archives
//!
//! [`ArchiveTree`] turns item streams into an inode table that a
//! filesystem adapter can serve. Archives are only decoded when first
//! visited.

#[cfg(feature = "fuse")]
mod fuse;

use crate::archive::{Archive, ArchiveMetadata, Item};
use crate::id::ObjectId;
use crate::key::Key;
use crate::manifest::Manifest;
use crate::repository::Repository;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const ROOT_INO: u64 = 1;
/// Decrypted chunks kept for sequential reads
const CHUNK_CACHE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            libc::S_IFIFO => FileKind::NamedPipe,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFBLK => FileKind::BlockDevice,
            libc::S_IFSOCK => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }
}

/// Attributes of one inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub mtime: SystemTime,
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
}

impl Attr {
    /// Device number in the 32-bit encoding the kernel's FUSE protocol
    /// carries; devices that do not fit map to 0
    pub fn rdev_u32(&self) -> u32 {
        let (major, minor) = (nix::sys::stat::major(self.rdev), nix::sys::stat::minor(self.rdev));
        if major > 0xfff || minor > 0xfffff {
            return 0;
        }
        ((minor & 0xff) | (major << 8) | ((minor & !0xff) << 12)) as u32
    }
}

struct Inode {
    item: Item,
    nlink: u32,
    children: BTreeMap<Vec<u8>, u64>,
    /// Directory holding the first link to this inode
    parent: u64,
    /// Archive whose items still have to be loaded below this directory
    pending: Option<String>,
}

pub struct ArchiveTree {
    repository: Repository,
    key: Key,
    manifest: Manifest,
    inodes: Vec<Inode>,
    chunks: LruCache<ObjectId, Vec<u8>>,
    default_uid: u32,
    default_gid: u32,
}

fn mtime_ns(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or_default()
}

fn system_time(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(ns.unsigned_abs())
    }
}

impl ArchiveTree {
    /// Tree of a single archive, or of every archive when `archive` is None
    pub fn new(repository: Repository, key: Key, manifest: Manifest, archive: Option<&str>) -> Result<Self> {
        let mut tree = Self {
            repository,
            key,
            manifest,
            inodes: Vec::new(),
            chunks: LruCache::new(NonZeroUsize::new(CHUNK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN)),
            default_uid: nix::unistd::getuid().as_raw(),
            default_gid: nix::unistd::getgid().as_raw(),
        };
        let now = mtime_ns(Utc::now());
        tree.new_dir(now, ROOT_INO);
        match archive {
            Some(name) => {
                if !tree.manifest.archives.contains_key(name) {
                    return Err(Error::ArchiveNotFound { name: name.to_string() });
                }
                tree.inodes[0].pending = Some(name.to_string());
            }
            None => {
                for info in tree.manifest.list_archives() {
                    let ino = tree.new_dir(mtime_ns(info.time), ROOT_INO);
                    tree.inode_mut(ino)?.pending = Some(info.name.clone());
                    tree.inodes[0].children.insert(info.name.into_bytes(), ino);
                }
            }
        }
        Ok(tree)
    }

    fn new_dir(&mut self, mtime: i64, parent: u64) -> u64 {
        let item = Item {
            mode: libc::S_IFDIR | 0o755,
            uid: self.default_uid,
            gid: self.default_gid,
            mtime,
            ..Default::default()
        };
        self.push(item, parent)
    }

    fn push(&mut self, item: Item, parent: u64) -> u64 {
        self.inodes.push(Inode {
            item,
            nlink: 1,
            children: BTreeMap::new(),
            parent,
            pending: None,
        });
        self.inodes.len() as u64
    }

    fn inode(&self, ino: u64) -> Result<&Inode> {
        ino.checked_sub(1)
            .and_then(|i| self.inodes.get(i as usize))
            .ok_or_else(|| Error::ObjectNotFound { id: format!("inode {}", ino) })
    }

    fn inode_mut(&mut self, ino: u64) -> Result<&mut Inode> {
        ino.checked_sub(1)
            .and_then(|i| self.inodes.get_mut(i as usize))
            .ok_or_else(|| Error::ObjectNotFound { id: format!("inode {}", ino) })
    }

    /// Decode the pending archive below `ino`, if any
    fn load(&mut self, ino: u64) -> Result<()> {
        let Some(name) = self.inode_mut(ino)?.pending.take() else {
            return Ok(());
        };
        debug!(archive = %name, "loading archive");
        let entry = self
            .manifest
            .archives
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::ArchiveNotFound { name: name.clone() })?;
        let data = self.key.decrypt(Some(&entry.id), &self.repository.get(&entry.id)?)?;
        let metadata = ArchiveMetadata::decode(&data)?;
        let mut items = Archive::items_of(&metadata, |_: &Item| true);
        while let Some(item) = items.next_from(&mut self.repository, &self.key)? {
            self.insert(ino, item)?;
        }
        Ok(())
    }

    fn insert(&mut self, base: u64, item: Item) -> Result<()> {
        let components: Vec<Vec<u8>> = item
            .path
            .split(|b| *b == b'/')
            .filter(|c| !c.is_empty() && *c != b".")
            .map(<[u8]>::to_vec)
            .collect();
        let Some((name, parents)) = components.split_last() else {
            return Ok(());
        };
        let mut parent = base;
        for component in parents {
            parent = match self.inode(parent)?.children.get(component) {
                Some(&ino) => ino,
                None => {
                    let mtime = self.inode(parent)?.item.mtime;
                    let ino = self.new_dir(mtime, parent);
                    self.inode_mut(parent)?.children.insert(component.clone(), ino);
                    ino
                }
            };
        }

        if item.is_hardlink() {
            let source = item.source.clone().unwrap_or_default();
            if let Some(target) = self.resolve(base, &source)? {
                self.inode_mut(target)?.nlink += 1;
                self.inode_mut(parent)?.children.insert(name.clone(), target);
                return Ok(());
            }
        }
        match self.inode(parent)?.children.get(name) {
            // a directory created for one of its children gets its real attributes
            Some(&existing) if item.is_dir() => self.inode_mut(existing)?.item = item,
            _ => {
                let ino = self.push(item, parent);
                self.inode_mut(parent)?.children.insert(name.clone(), ino);
            }
        }
        Ok(())
    }

    fn resolve(&self, base: u64, path: &[u8]) -> Result<Option<u64>> {
        let mut ino = base;
        for component in path.split(|b| *b == b'/').filter(|c| !c.is_empty()) {
            match self.inode(ino)?.children.get(component) {
                Some(&child) => ino = child,
                None => return Ok(None),
            }
        }
        Ok(Some(ino))
    }

    fn make_attr(&self, ino: u64) -> Result<Attr> {
        let inode = self.inode(ino)?;
        let item = &inode.item;
        let size = if item.is_symlink() {
            item.source.as_ref().map_or(0, |s| s.len() as u64)
        } else {
            item.size()
        };
        Ok(Attr {
            ino,
            size,
            blocks: (size + 511) / 512,
            mtime: system_time(item.mtime),
            kind: FileKind::from_mode(item.mode),
            perm: (item.mode & 0o7777) as u16,
            nlink: inode.nlink,
            uid: item.uid,
            gid: item.gid,
            rdev: item.rdev.unwrap_or(0),
        })
    }

    pub fn attr(&mut self, ino: u64) -> Result<Attr> {
        self.make_attr(ino)
    }

    pub fn lookup(&mut self, parent: u64, name: &[u8]) -> Result<Option<Attr>> {
        self.load(parent)?;
        match self.inode(parent)?.children.get(name) {
            Some(&ino) => {
                self.load(ino)?;
                Ok(Some(self.make_attr(ino)?))
            }
            None => Ok(None),
        }
    }

    /// Children of a directory as `(ino, kind, name)`
    pub fn readdir(&mut self, ino: u64) -> Result<Vec<(u64, FileKind, Vec<u8>)>> {
        self.load(ino)?;
        let inode = self.inode(ino)?;
        inode
            .children
            .iter()
            .map(|(name, &child)| {
                let kind = FileKind::from_mode(self.inode(child)?.item.mode);
                Ok((child, kind, name.clone()))
            })
            .collect()
    }

    /// Parent inode used for `..`; the root is its own parent
    pub fn parent(&self, ino: u64) -> u64 {
        self.inode(ino).map_or(ROOT_INO, |inode| inode.parent)
    }

    pub fn readlink(&mut self, ino: u64) -> Result<Option<Vec<u8>>> {
        let item = &self.inode(ino)?.item;
        Ok(if item.is_symlink() { item.source.clone() } else { None })
    }

    /// Up to `size` bytes of file content starting at `offset`
    pub fn read(&mut self, ino: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let chunks = self.inode(ino)?.item.chunks.clone().unwrap_or_default();
        let end = offset.saturating_add(size as u64);
        let mut out = Vec::with_capacity(size);
        let mut chunk_start = 0u64;
        for chunk in chunks {
            let chunk_end = chunk_start + chunk.size;
            if chunk_end > offset && chunk_start < end {
                let data = self.fetch(&chunk.id)?;
                let from = offset.saturating_sub(chunk_start) as usize;
                let to = (end.min(chunk_end) - chunk_start) as usize;
                out.extend_from_slice(&data[from.min(data.len())..to.min(data.len())]);
            }
            if chunk_end >= end {
                break;
            }
            chunk_start = chunk_end;
        }
        Ok(out)
    }

    fn fetch(&mut self, id: &ObjectId) -> Result<&Vec<u8>> {
        if !self.chunks.contains(id) {
            let data = self.key.decrypt(Some(id), &self.repository.get(id)?)?;
            self.chunks.put(*id, data);
        }
        self.chunks
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound { id: id.to_hex() })
    }

    pub fn getxattr(&mut self, ino: u64, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inode(ino)?.item.xattrs.get(name).map(|v| v.0.clone()))
    }

    pub fn listxattr(&mut self, ino: u64) -> Result<Vec<String>> {
        Ok(self.inode(ino)?.item.xattrs.keys().cloned().collect())
    }
}

/// Serve `tree` read-only at `mountpoint` until it is unmounted
#[cfg(feature = "fuse")]
pub fn mount(tree: ArchiveTree, mountpoint: &Path, options: &[String], foreground: bool) -> Result<()> {
    fuse::mount(tree, mountpoint, options, foreground)
}

#[cfg(not(feature = "fuse"))]
pub fn mount(_tree: ArchiveTree, _mountpoint: &Path, _options: &[String], _foreground: bool) -> Result<()> {
    Err(Error::FeatureNotAvailable {
        feature: "fuse (rebuild with --features fuse)".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::CreateOptions;
    use crate::cache::Cache;
    use crate::key::Compression;
    use crate::manifest::ManifestConfig;
    use crate::repository::DEFAULT_LOCK_WAIT;
    use std::fs;
    use tempfile::TempDir;

    fn build(names: &[&str]) -> Result<(TempDir, Repository, Key, Manifest, Vec<u8>)> {
        let dir = TempDir::new()?;
        let mut repository = Repository::create(dir.path().join("repo"), DEFAULT_LOCK_WAIT)?;
        let key = Key::plaintext(Compression::default());
        let mut manifest = Manifest::new(ManifestConfig::default());
        manifest.write(&mut repository, &key)?;
        repository.commit()?;
        let mut cache = Cache::open(&dir.path().join("cache"), &mut repository, &key, &manifest, DEFAULT_LOCK_WAIT)?;

        let src = dir.path().join("src");
        fs::create_dir_all(src.join("docs"))?;
        let content: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(2246822519) >> 11) as u8).collect();
        fs::write(src.join("docs/data.bin"), &content)?;
        fs::hard_link(src.join("docs/data.bin"), src.join("twin.bin"))?;
        std::os::unix::fs::symlink("docs/data.bin", src.join("link"))?;

        for name in names {
            let mut archive = Archive::create(
                &mut repository,
                &key,
                &mut manifest,
                &mut cache,
                name,
                CreateOptions::default(),
            )?;
            for path in [src.join("docs"), src.join("docs/data.bin"), src.join("twin.bin"), src.join("link")] {
                let st = fs::symlink_metadata(&path)?;
                if st.is_dir() {
                    archive.process_dir(&path, &st)?;
                } else if st.file_type().is_symlink() {
                    archive.process_symlink(&path, &st)?;
                } else {
                    archive.process_file(&path, &st)?;
                }
            }
            archive.save()?;
        }
        drop(cache);
        Ok((dir, repository, key, manifest, content))
    }

    fn walk(tree: &mut ArchiveTree, mut ino: u64, path: &str) -> Result<u64> {
        for component in path.split('/').filter(|c| !c.is_empty()) {
            ino = tree
                .lookup(ino, component.as_bytes())?
                .ok_or_else(|| Error::ObjectNotFound { id: component.to_string() })?
                .ino;
        }
        Ok(ino)
    }

    #[test]
    fn test_single_archive_tree() -> Result<()> {
        let (dir, repository, key, manifest, content) = build(&["only"])?;
        let src = dir.path().join("src");
        let mut tree = ArchiveTree::new(repository, key, manifest, Some("only"))?;
        let src_ino = walk(&mut tree, ROOT_INO, src.to_str().unwrap_or_default())?;
        let names: Vec<Vec<u8>> = tree.readdir(src_ino)?.into_iter().map(|(_, _, n)| n).collect();
        assert_eq!(names, vec![b"docs".to_vec(), b"link".to_vec(), b"twin.bin".to_vec()]);

        let data = walk(&mut tree, src_ino, "docs/data.bin")?;
        let twin = walk(&mut tree, src_ino, "twin.bin")?;
        assert_eq!(data, twin);
        let attr = tree.attr(data)?;
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.size, content.len() as u64);
        assert_eq!(attr.kind, FileKind::RegularFile);

        let link = walk(&mut tree, src_ino, "link")?;
        assert_eq!(tree.readlink(link)?, Some(b"docs/data.bin".to_vec()));
        assert_eq!(tree.lookup(src_ino, b"missing")?, None);
        assert_eq!(tree.parent(data), walk(&mut tree, src_ino, "docs")?);
        Ok(())
    }

    #[test]
    fn test_read_ranges() -> Result<()> {
        let (dir, repository, key, manifest, content) = build(&["only"])?;
        let src = dir.path().join("src");
        let mut tree = ArchiveTree::new(repository, key, manifest, Some("only"))?;
        let ino = walk(&mut tree, ROOT_INO, &format!("{}/docs/data.bin", src.display()))?;
        for (offset, size) in [(0usize, 10usize), (4000, 70_000), (150_000, 100_000), (199_999, 5), (300_000, 10)] {
            let expected = &content[offset.min(content.len())..(offset + size).min(content.len())];
            assert_eq!(tree.read(ino, offset as u64, size)?, expected);
        }
        Ok(())
    }

    #[test]
    fn test_rdev_encoding() {
        let attr = |rdev| Attr {
            ino: 2,
            size: 0,
            blocks: 0,
            mtime: UNIX_EPOCH,
            kind: FileKind::CharDevice,
            perm: 0o600,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev,
        };
        assert_eq!(attr(nix::sys::stat::makedev(1, 3)).rdev_u32(), 0x103);
        assert_eq!(attr(nix::sys::stat::makedev(259, 0x1234)).rdev_u32(), 0x0121_0334);
        assert_eq!(attr(nix::sys::stat::makedev(0x1000, 0)).rdev_u32(), 0);
    }

    #[test]
    fn test_archive_per_directory() -> Result<()> {
        let (_dir, repository, key, manifest, _) = build(&["first", "second"])?;
        assert!(matches!(
            ArchiveTree::new(repository, key, manifest.clone(), Some("third")),
            Err(Error::ArchiveNotFound { .. })
        ));
        let (_dir, repository, key, manifest, _) = build(&["first", "second"])?;
        let mut tree = ArchiveTree::new(repository, key, manifest, None)?;
        let root: Vec<(FileKind, Vec<u8>)> =
            tree.readdir(ROOT_INO)?.into_iter().map(|(_, kind, name)| (kind, name)).collect();
        assert_eq!(
            root,
            vec![(FileKind::Directory, b"first".to_vec()), (FileKind::Directory, b"second".to_vec())]
        );
        let second = tree.lookup(ROOT_INO, b"second")?.map(|a| a.ino).unwrap_or_default();
        assert_eq!(tree.readdir(second)?.len(), 1);
        assert_eq!(tree.parent(second), ROOT_INO);
        assert_eq!(tree.parent(ROOT_INO), ROOT_INO);
        let top = tree.readdir(second)?[0].0;
        assert_eq!(tree.parent(top), second);
        Ok(())
    }
}
