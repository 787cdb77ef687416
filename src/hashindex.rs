//! Persistent id-keyed indices used by the repository and the cache

use crate::id::{ObjectId, ID_SIZE};
use crate::{Error, Result};
use std::collections::hash_map::{self, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"BURROWIX";
const HEADER_SIZE: usize = MAGIC.len() + 2 + 8;

/// Fixed-size value stored in a [`HashIndex`]
pub trait IndexValue: Copy {
    const SIZE: usize;

    fn write_to(&self, out: &mut Vec<u8>);
    fn read_from(buf: &[u8]) -> Self;
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

/// Location of an object in the segment log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOffset {
    pub segment: u32,
    pub offset: u32,
}

impl IndexValue for SegmentOffset {
    const SIZE: usize = 8;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.segment.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            segment: u32_at(buf, 0),
            offset: u32_at(buf, 4),
        }
    }
}

/// Reference count and sizes of a stored chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCount {
    pub refcount: u32,
    pub size: u32,
    pub csize: u32,
}

impl IndexValue for ChunkCount {
    const SIZE: usize = 12;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.refcount.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.csize.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            refcount: u32_at(buf, 0),
            size: u32_at(buf, 4),
            csize: u32_at(buf, 8),
        }
    }
}

/// In-memory map with a checksummed on-disk form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashIndex<V> {
    map: HashMap<ObjectId, V>,
}

pub type NsIndex = HashIndex<SegmentOffset>;
pub type ChunkIndex = HashIndex<ChunkCount>;

impl<V> Default for HashIndex<V> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<V: IndexValue> HashIndex<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let corrupt = |what: &str| Error::integrity(format!("{}: {}", path.display(), what));

        if data.len() < HEADER_SIZE + 4 || &data[..MAGIC.len()] != MAGIC {
            return Err(corrupt("not an index file"));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        if crc32fast::hash(body) != u32_at(crc, 0) {
            return Err(corrupt("checksum mismatch"));
        }
        if body[8] as usize != ID_SIZE || body[9] as usize != V::SIZE {
            return Err(corrupt("unexpected key or value size"));
        }
        let mut count = [0u8; 8];
        count.copy_from_slice(&body[10..HEADER_SIZE]);
        let count = u64::from_le_bytes(count) as usize;
        let entry_size = ID_SIZE + V::SIZE;
        let entries = &body[HEADER_SIZE..];
        if count.checked_mul(entry_size) != Some(entries.len()) {
            return Err(corrupt("truncated"));
        }

        let mut map = HashMap::with_capacity(count);
        for entry in entries.chunks_exact(entry_size) {
            let (key, value) = entry.split_at(ID_SIZE);
            let key = ObjectId::from_slice(key).ok_or_else(|| corrupt("bad key"))?;
            map.insert(key, V::read_from(value));
        }
        Ok(Self { map })
    }

    /// Write the index atomically via a temporary file
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut body = Vec::with_capacity(HEADER_SIZE + self.map.len() * (ID_SIZE + V::SIZE) + 4);
        body.extend_from_slice(MAGIC);
        body.push(ID_SIZE as u8);
        body.push(V::SIZE as u8);
        body.extend_from_slice(&(self.map.len() as u64).to_le_bytes());
        for (key, value) in &self.map {
            body.extend_from_slice(key.as_bytes());
            value.write_to(&mut body);
        }
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        let tmp = path.with_extension("tmp");
        {
            let mut file = BufWriter::new(File::create(&tmp)?);
            file.write_all(&body)?;
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl<V: Copy> HashIndex<V> {
    pub fn get(&self, key: &ObjectId) -> Option<V> {
        self.map.get(key).copied()
    }

    pub fn insert(&mut self, key: ObjectId, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn remove(&mut self, key: &ObjectId) -> Option<V> {
        self.map.remove(key)
    }

    pub fn contains_key(&self, key: &ObjectId) -> bool {
        self.map.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &ObjectId) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, ObjectId, V> {
        self.map.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectId> {
        self.map.keys()
    }
}

impl ChunkIndex {
    /// Sum of `(refcount * size, refcount * csize, size, csize, unique, total)`
    /// over all chunks, as shown by `info`
    pub fn summarize(&self) -> (u64, u64, u64, u64, usize, u64) {
        let mut summary = (0u64, 0u64, 0u64, 0u64, 0usize, 0u64);
        for count in self.map.values() {
            let refs = count.refcount as u64;
            summary.0 += refs * count.size as u64;
            summary.1 += refs * count.csize as u64;
            summary.2 += count.size as u64;
            summary.3 += count.csize as u64;
            summary.4 += 1;
            summary.5 += refs;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn id(n: u8) -> ObjectId {
        ObjectId([n; ID_SIZE])
    }

    #[test]
    fn test_ns_index_persists() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("index.1");

        let mut index = NsIndex::new();
        for n in 0..50u8 {
            index.insert(id(n), SegmentOffset { segment: n as u32, offset: 8 + n as u32 });
        }
        index.remove(&id(3));
        index.write(&path)?;

        let loaded = NsIndex::read(&path)?;
        assert_eq!(loaded, index);
        assert_eq!(loaded.len(), 49);
        assert_eq!(loaded.get(&id(7)), Some(SegmentOffset { segment: 7, offset: 15 }));
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[test]
    fn test_corruption_detected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("chunks");

        let mut index = ChunkIndex::new();
        index.insert(id(1), ChunkCount { refcount: 2, size: 100, csize: 50 });
        index.write(&path)?;

        let mut data = fs::read(&path)?;
        let last = HEADER_SIZE + 3;
        data[last] ^= 0xff;
        fs::write(&path, &data)?;
        assert!(matches!(ChunkIndex::read(&path), Err(Error::IntegrityError { .. })));

        // wrong value size
        index.write(&path)?;
        assert!(NsIndex::read(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_oversized_count_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("chunks");
        ChunkIndex::new().write(&path)?;
        let mut data = fs::read(&path)?;
        let body_len = data.len() - 4;
        data[10..HEADER_SIZE].copy_from_slice(&u64::MAX.to_le_bytes());
        let crc = crc32fast::hash(&data[..body_len]);
        data[body_len..].copy_from_slice(&crc.to_le_bytes());
        fs::write(&path, data)?;
        assert!(matches!(ChunkIndex::read(&path), Err(Error::IntegrityError { .. })));
        Ok(())
    }

    #[test]
    fn test_summarize() {
        let mut index = ChunkIndex::new();
        index.insert(id(1), ChunkCount { refcount: 2, size: 100, csize: 50 });
        index.insert(id(2), ChunkCount { refcount: 1, size: 10, csize: 5 });
        assert_eq!(index.summarize(), (210, 105, 110, 55, 2, 3));
    }
}
