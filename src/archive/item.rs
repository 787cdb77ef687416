//! Archive entries and their msgpack stream

use crate::id::{self, ObjectId};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, ErrorKind};

pub const ARCHIVE_VERSION: u32 = 1;

/// Reference from an item to one chunk of its content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: ObjectId,
    pub size: u64,
    pub csize: u64,
}

/// One filesystem entry of an archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    #[serde(with = "id::bytes")]
    pub path: Vec<u8>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Modification time in nanoseconds since the epoch
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkRef>>,
    /// Symlink target, or the first path of a hard link group
    #[serde(default, skip_serializing_if = "Option::is_none", with = "id::bytes::option")]
    pub source: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdev: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, XattrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl_access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl_default: Option<String>,
}

/// Raw extended attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrValue(#[serde(with = "id::bytes")] pub Vec<u8>);

impl Item {
    pub fn path_str(&self) -> String {
        String::from_utf8_lossy(&self.path).into_owned()
    }

    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.file_type() == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == libc::S_IFLNK
    }

    /// Regular file that is a link to an earlier entry
    pub fn is_hardlink(&self) -> bool {
        self.is_reg() && self.source.is_some() && self.chunks.is_none()
    }

    /// Content size, from the chunk list
    pub fn size(&self) -> u64 {
        self.chunks.as_ref().map_or(0, |c| c.iter().map(|c| c.size).sum())
    }
}

/// Archive metadata object, referenced from the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub version: u32,
    pub name: String,
    /// Chunks of the item stream
    pub items: Vec<ObjectId>,
    pub cmdline: Vec<String>,
    pub hostname: String,
    pub username: String,
    pub time: chrono::DateTime<chrono::Utc>,
}

impl ArchiveMetadata {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let metadata: Self = rmp_serde::from_slice(data)?;
        if metadata.version != ARCHIVE_VERSION {
            return Err(Error::UnsupportedPayload {
                reason: format!("unknown archive metadata version {}", metadata.version),
            });
        }
        Ok(metadata)
    }
}

/// Incremental decoder for values that may straddle chunk boundaries
#[derive(Debug, Default)]
pub struct Unpacker {
    buf: Vec<u8>,
    pos: usize,
}

fn is_incomplete(error: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error as DecodeError;
    match error {
        DecodeError::InvalidMarkerRead(e) | DecodeError::InvalidDataRead(e) => {
            e.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

impl Unpacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Next complete value, or `None` when more input is needed
    pub fn next_value<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[self.pos..]);
        match rmp_serde::from_read::<_, T>(&mut cursor) {
            Ok(value) => {
                self.pos += cursor.position() as usize;
                Ok(Some(value))
            }
            Err(e) if is_incomplete(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes fed but not yet decoded
    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Skip to the next position that looks like the start of an item, a
    /// map whose first key is `path`. Returns false when none is buffered.
    pub fn resync(&mut self) -> bool {
        const ITEM_START: &[u8] = b"\xa4path";
        let start = self.pos + 1;
        let found = self.buf.get(start..).and_then(|rest| {
            rest.windows(ITEM_START.len() + 1)
                .position(|w| (0x80..=0x8f).contains(&w[0]) && &w[1..] == ITEM_START)
        });
        match found {
            Some(offset) => {
                self.pos = start + offset;
                true
            }
            None => {
                // keep a tail that may hold the beginning of a split marker
                self.pos = self.buf.len().saturating_sub(ITEM_START.len()).max(self.pos);
                false
            }
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(path: &str) -> Item {
        let mut item = Item {
            path: path.as_bytes().to_vec(),
            mode: libc::S_IFREG | 0o644,
            uid: 1000,
            gid: 1000,
            user: Some("user".into()),
            mtime: 1_700_000_000_123_456_789,
            chunks: Some(vec![ChunkRef { id: ObjectId([3; 32]), size: 10, csize: 12 }]),
            acl_access: Some("user::rw-\ngroup::r--\nother::r--".into()),
            ..Default::default()
        };
        item.xattrs.insert("user.comment".into(), XattrValue(b"hi".to_vec()));
        item
    }

    #[test]
    fn test_items_across_feeds() -> Result<()> {
        let items: Vec<Item> = (0..20).map(|i| sample(&format!("dir/file{}", i))).collect();
        let mut stream = Vec::new();
        for item in &items {
            stream.extend(rmp_serde::to_vec_named(item)?);
        }

        let mut unpacker = Unpacker::new();
        let mut decoded = Vec::new();
        for piece in stream.chunks(37) {
            unpacker.feed(piece);
            while let Some(item) = unpacker.next_value::<Item>()? {
                decoded.push(item);
            }
        }
        assert_eq!(unpacker.pending(), 0);
        assert_eq!(decoded, items);
        Ok(())
    }

    #[test]
    fn test_optional_fields_omitted() -> Result<()> {
        let item = Item {
            path: b"dir".to_vec(),
            mode: libc::S_IFDIR | 0o755,
            ..Default::default()
        };
        let packed = rmp_serde::to_vec_named(&item)?;
        assert!(!packed.windows(6).any(|w| w == b"chunks"));
        let back: Item = rmp_serde::from_slice(&packed)?;
        assert!(back.is_dir());
        assert_eq!(back.size(), 0);
        assert_eq!(sample("x").size(), 10);
        Ok(())
    }

    #[test]
    fn test_resync_after_lost_chunk() -> Result<()> {
        let mut stream = Vec::new();
        for i in 0..3 {
            stream.extend(rmp_serde::to_vec_named(&sample(&format!("f{}", i)))?);
        }
        let second = rmp_serde::to_vec_named(&sample("f0"))?.len();
        let mut unpacker = Unpacker::new();
        // lose the start of the first item
        unpacker.feed(&stream[7..]);
        assert!(unpacker.next_value::<Item>().is_err());
        assert!(unpacker.resync());
        let item: Item = unpacker.next_value()?.expect("item after resync");
        assert_eq!(item.path, b"f1");
        assert_eq!(unpacker.pending(), stream.len() - 2 * second);
        Ok(())
    }

    #[test]
    fn test_hardlink_detection() {
        let mut item = sample("b");
        assert!(!item.is_hardlink());
        item.chunks = None;
        item.source = Some(b"a".to_vec());
        assert!(item.is_hardlink());
    }
}
