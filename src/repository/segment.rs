//! Append-only segment files
//!
//! Every entry is `crc32 | size | tag | [id] | [data]`, little endian. The
//! checksum covers everything after itself and `size` counts the whole
//! entry. A segment ends with a COMMIT entry when the transaction that
//! wrote it completed.

use super::MAX_OBJECT_SIZE;
use crate::id::{ObjectId, ID_SIZE};
use crate::{Error, Result};
use lru::LruCache;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MAGIC: &[u8; 8] = b"BURROWSG";

pub const TAG_PUT: u8 = 0;
pub const TAG_DELETE: u8 = 1;
pub const TAG_COMMIT: u8 = 2;

const HEADER_SIZE: usize = 9;
const ID_HEADER_SIZE: usize = HEADER_SIZE + ID_SIZE;

const FD_CACHE_SIZE: usize = 100;

/// An entry decoded from a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub tag: u8,
    pub id: Option<ObjectId>,
    pub offset: u32,
    pub data: Option<Vec<u8>>,
}

fn encode_entry(tag: u8, id: Option<&ObjectId>, data: &[u8]) -> Vec<u8> {
    let size = HEADER_SIZE + id.map_or(0, |_| ID_SIZE) + data.len();
    let mut entry = Vec::with_capacity(size);
    entry.extend_from_slice(&[0u8; 4]);
    entry.extend_from_slice(&(size as u32).to_le_bytes());
    entry.push(tag);
    if let Some(id) = id {
        entry.extend_from_slice(id.as_bytes());
    }
    entry.extend_from_slice(data);
    let crc = crc32fast::hash(&entry[4..]);
    entry[..4].copy_from_slice(&crc.to_le_bytes());
    entry
}

fn parse_header(header: &[u8]) -> (u32, usize, u8) {
    let mut crc = [0u8; 4];
    let mut size = [0u8; 4];
    crc.copy_from_slice(&header[..4]);
    size.copy_from_slice(&header[4..8]);
    (u32::from_le_bytes(crc), u32::from_le_bytes(size) as usize, header[8])
}

/// Decode the entry at the start of `buf`, returning it and its length
fn decode_entry(buf: &[u8], offset: u32, include_data: bool) -> std::result::Result<(Entry, usize), String> {
    if buf.len() < HEADER_SIZE {
        return Err("truncated header".into());
    }
    let (crc, size, tag) = parse_header(buf);
    if size > MAX_OBJECT_SIZE + ID_HEADER_SIZE || size < HEADER_SIZE {
        return Err(format!("invalid entry size {}", size));
    }
    if size > buf.len() {
        return Err("truncated entry".into());
    }
    if crc32fast::hash(&buf[4..size]) != crc {
        return Err("entry checksum mismatch".into());
    }
    let entry = match tag {
        TAG_PUT | TAG_DELETE => {
            if size < ID_HEADER_SIZE {
                return Err(format!("entry too short for tag {}", tag));
            }
            let id = ObjectId::from_slice(&buf[HEADER_SIZE..ID_HEADER_SIZE]);
            let data = (tag == TAG_PUT && include_data).then(|| buf[ID_HEADER_SIZE..size].to_vec());
            Entry { tag, id, offset, data }
        }
        TAG_COMMIT => Entry { tag, id: None, offset, data: None },
        _ => return Err(format!("unknown tag {}", tag)),
    };
    Ok((entry, size))
}

/// Reads and writes the segment files of one repository
pub struct LoggedIo {
    path: PathBuf,
    limit: u64,
    segments_per_dir: u32,
    fds: LruCache<u32, File>,
    /// Segment currently (or next) written to
    segment: u32,
    offset: u64,
    writer: Option<File>,
}

impl LoggedIo {
    pub fn new<P: AsRef<Path>>(path: P, limit: u64, segments_per_dir: u32) -> Result<Self> {
        let mut io = Self {
            path: path.as_ref().to_path_buf(),
            limit,
            segments_per_dir,
            fds: LruCache::new(NonZeroUsize::new(FD_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN)),
            segment: 0,
            offset: 0,
            writer: None,
        };
        io.segment = io.latest_segment()?.map_or(0, |s| s + 1);
        Ok(io)
    }

    pub fn segment_filename(&self, segment: u32) -> PathBuf {
        self.path
            .join("data")
            .join((segment / self.segments_per_dir).to_string())
            .join(segment.to_string())
    }

    /// All segment numbers on disk, ascending
    pub fn segments(&self) -> Result<Vec<u32>> {
        let mut segments = Vec::new();
        let data = self.path.join("data");
        if !data.is_dir() {
            return Ok(segments);
        }
        for dir in fs::read_dir(&data)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(dir.path())? {
                let file = file?;
                if let Some(n) = file.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                    segments.push(n);
                }
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    pub fn latest_segment(&self) -> Result<Option<u32>> {
        Ok(self.segments()?.last().copied())
    }

    /// Newest segment that ends with a commit entry
    pub fn segments_transaction_id(&self) -> Result<Option<u32>> {
        for segment in self.segments()?.into_iter().rev() {
            if self.is_committed_segment(segment)? {
                return Ok(Some(segment));
            }
        }
        Ok(None)
    }

    pub fn is_committed_segment(&self, segment: u32) -> Result<bool> {
        let mut file = File::open(self.segment_filename(segment))?;
        let len = file.metadata()?.len();
        if len < (MAGIC.len() + HEADER_SIZE) as u64 {
            return Ok(false);
        }
        file.seek(SeekFrom::End(-(HEADER_SIZE as i64)))?;
        let mut tail = [0u8; HEADER_SIZE];
        file.read_exact(&mut tail)?;
        Ok(tail == encode_entry(TAG_COMMIT, None, &[])[..])
    }

    /// Remove segments written after `transaction_id`
    pub fn cleanup(&mut self, transaction_id: Option<u32>) -> Result<()> {
        self.writer = None;
        self.offset = 0;
        for segment in self.segments()?.into_iter().rev() {
            if transaction_id.map_or(false, |tid| segment <= tid) {
                break;
            }
            warn!(segment, "removing uncommitted segment");
            self.delete_segment(segment)?;
        }
        self.segment = transaction_id.map_or(0, |tid| tid + 1);
        Ok(())
    }

    pub fn segment_exists(&self, segment: u32) -> bool {
        self.segment_filename(segment).exists()
    }

    pub fn delete_segment(&mut self, segment: u32) -> Result<()> {
        self.fds.pop(&segment);
        match fs::remove_file(self.segment_filename(segment)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn get_fd(&mut self, segment: u32) -> Result<&mut File> {
        if !self.fds.contains(&segment) {
            let file = File::open(self.segment_filename(segment))?;
            self.fds.put(segment, file);
        }
        self.fds.get_mut(&segment).ok_or_else(|| Error::ObjectNotFound {
            id: format!("segment {}", segment),
        })
    }

    fn write_fd(&mut self, no_new: bool) -> Result<&mut File> {
        if !no_new && self.writer.is_some() && self.offset > self.limit {
            self.close_segment()?;
        }
        if self.writer.is_none() {
            let filename = self.segment_filename(self.segment);
            if let Some(parent) = filename.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&filename)?;
            file.write_all(MAGIC)?;
            self.offset = MAGIC.len() as u64;
            debug!(segment = self.segment, "opened segment for writing");
            self.writer = Some(file);
        }
        self.writer.as_mut().ok_or_else(|| Error::integrity("no writable segment"))
    }

    pub fn close_segment(&mut self) -> Result<()> {
        if let Some(file) = self.writer.take() {
            file.sync_all()?;
            self.segment += 1;
            self.offset = 0;
        }
        Ok(())
    }

    fn append(&mut self, entry: &[u8], no_new: bool) -> Result<(u32, u32)> {
        let file = self.write_fd(no_new)?;
        file.write_all(entry)?;
        let offset = self.offset as u32;
        self.offset += entry.len() as u64;
        Ok((self.segment, offset))
    }

    pub fn write_put(&mut self, id: &ObjectId, data: &[u8]) -> Result<(u32, u32)> {
        if data.len() > MAX_OBJECT_SIZE {
            return Err(Error::integrity(format!("object {} too large", id)));
        }
        self.append(&encode_entry(TAG_PUT, Some(id), data), false)
    }

    pub fn write_delete(&mut self, id: &ObjectId) -> Result<u32> {
        Ok(self.append(&encode_entry(TAG_DELETE, Some(id), &[]), false)?.0)
    }

    /// Terminate the current segment with a commit entry and return it
    pub fn write_commit(&mut self) -> Result<u32> {
        let (segment, _) = self.append(&encode_entry(TAG_COMMIT, None, &[]), true)?;
        self.close_segment()?;
        Ok(segment)
    }

    /// Read the PUT entry at `(segment, offset)` and check it belongs to `id`
    pub fn read(&mut self, segment: u32, offset: u32, id: &ObjectId) -> Result<Vec<u8>> {
        let file = self.get_fd(segment)?;
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut header = [0u8; ID_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let (crc, size, tag) = parse_header(&header);
        if tag != TAG_PUT || size < ID_HEADER_SIZE || size > MAX_OBJECT_SIZE + ID_HEADER_SIZE {
            return Err(Error::integrity(format!(
                "invalid segment entry header [segment {}, offset {}]",
                segment, offset
            )));
        }
        let mut data = vec![0u8; size - ID_HEADER_SIZE];
        file.read_exact(&mut data)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[4..]);
        hasher.update(&data);
        if hasher.finalize() != crc {
            return Err(Error::integrity(format!(
                "segment entry checksum mismatch [segment {}, offset {}]",
                segment, offset
            )));
        }
        if &header[HEADER_SIZE..] != id.as_bytes() {
            return Err(Error::integrity(format!(
                "invalid segment entry id [segment {}, offset {}]",
                segment, offset
            )));
        }
        Ok(data)
    }

    /// Decode every entry of a segment, failing on the first corrupt one
    pub fn iter_objects(&mut self, segment: u32, include_data: bool) -> Result<Vec<Entry>> {
        let filename = self.segment_filename(segment);
        let buf = fs::read(&filename)?;
        if buf.len() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
            return Err(Error::integrity(format!("invalid segment magic [segment {}]", segment)));
        }
        let mut entries = Vec::new();
        let mut offset = MAGIC.len();
        while offset < buf.len() {
            let (entry, size) = decode_entry(&buf[offset..], offset as u32, include_data).map_err(|reason| {
                Error::integrity(format!("{} [segment {}, offset {}]", reason, segment, offset))
            })?;
            entries.push(entry);
            offset += size;
        }
        Ok(entries)
    }

    /// Rewrite a damaged segment keeping only entries with a valid checksum
    pub fn recover_segment(&mut self, segment: u32) -> Result<usize> {
        self.fds.pop(&segment);
        let filename = self.segment_filename(segment);
        let buf = fs::read(&filename)?;
        let mut out = MAGIC.to_vec();
        let mut kept = 0;
        let mut offset = if buf.starts_with(MAGIC) { MAGIC.len() } else { 0 };
        while offset + HEADER_SIZE <= buf.len() {
            match decode_entry(&buf[offset..], 0, true) {
                Ok((_, size)) => {
                    out.extend_from_slice(&buf[offset..offset + size]);
                    kept += 1;
                    offset += size;
                }
                Err(_) => offset += 1,
            }
        }
        warn!(segment, kept, "recovered segment");
        let tmp = filename.with_extension("tmp");
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, &filename)?;
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(n: u8) -> ObjectId {
        ObjectId([n; ID_SIZE])
    }

    #[test]
    fn test_put_read_commit() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut io = LoggedIo::new(temp_dir.path(), 1024, 10)?;

        let (segment, offset) = io.write_put(&id(1), b"hello")?;
        assert_eq!((segment, offset), (0, MAGIC.len() as u32));
        io.write_delete(&id(2))?;
        assert_eq!(io.write_commit()?, 0);

        assert!(io.is_committed_segment(0)?);
        assert_eq!(io.read(0, offset, &id(1))?, b"hello");
        assert!(matches!(io.read(0, offset, &id(3)), Err(Error::IntegrityError { .. })));

        let entries = io.iter_objects(0, true)?;
        let tags: Vec<u8> = entries.iter().map(|e| e.tag).collect();
        assert_eq!(tags, vec![TAG_PUT, TAG_DELETE, TAG_COMMIT]);
        assert_eq!(entries[0].data.as_deref(), Some(&b"hello"[..]));
        Ok(())
    }

    #[test]
    fn test_segments_roll_over() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut io = LoggedIo::new(temp_dir.path(), 100, 2)?;
        for n in 0..5u8 {
            io.write_put(&id(n), &[n; 80])?;
        }
        io.write_commit()?;

        let segments = io.segments()?;
        assert_eq!(segments, vec![0, 1, 2, 3, 4]);
        assert!(temp_dir.path().join("data/2/4").exists());
        assert_eq!(io.segments_transaction_id()?, Some(4));
        assert!(!io.is_committed_segment(3)?);
        Ok(())
    }

    #[test]
    fn test_cleanup_and_recover() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut io = LoggedIo::new(temp_dir.path(), 1 << 20, 10)?;
        io.write_put(&id(1), b"one")?;
        io.write_put(&id(2), b"two")?;
        io.write_commit()?;
        io.write_put(&id(3), b"three")?;
        io.close_segment()?;

        io.cleanup(Some(0))?;
        assert_eq!(io.segments()?, vec![0]);

        // flip a byte inside the first entry's data
        let filename = io.segment_filename(0);
        let mut buf = fs::read(&filename)?;
        buf[MAGIC.len() + ID_HEADER_SIZE] ^= 0xff;
        fs::write(&filename, &buf)?;
        assert!(io.iter_objects(0, false).is_err());

        assert_eq!(io.recover_segment(0)?, 2);
        let entries = io.iter_objects(0, false)?;
        assert_eq!(entries[0].id, Some(id(2)));
        assert_eq!(entries[1].tag, TAG_COMMIT);
        Ok(())
    }
}
