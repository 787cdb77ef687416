//! Content-defined chunking with a seeded rolling buzhash
//!
//! Chunk boundaries depend only on the bytes since the previous boundary,
//! so inserting or removing data in a file shifts at most a few chunks and
//! the rest deduplicate against earlier backups.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::mem;

/// Default rolling window in bytes
pub const WINDOW_SIZE: usize = 0xfff;
/// Default boundary mask, about 64 KiB average chunks
pub const CHUNK_MASK: u32 = 0xffff;
pub const CHUNK_MIN: usize = 1024;
pub const CHUNK_MAX: usize = 10 * 1024 * 1024;

const READ_SIZE: usize = 64 * 1024;

const BUZHASH_TABLE: [u32; 256] = [
    0x458be752, 0xc10748cc, 0xfbbcdbb8, 0x6ded5b68, 0xb10a82b5, 0x20d75648, 0xdfc5665f, 0xa8428801,
    0x7ebf5191, 0x841135c7, 0x65cc53b3, 0x280a597c, 0x16f60255, 0xc78cbc3e, 0x294415f5, 0xb938d494,
    0xec85c4e6, 0xb7d33edc, 0xe549b544, 0xfdeda5aa, 0x882bf287, 0x3116737c, 0x05569956, 0xe8cc1f68,
    0x0806ac5e, 0x22a14443, 0x15297e10, 0x50d090e7, 0x4ba60f6f, 0xefd9f1a7, 0x5c5c885c, 0x82482f93,
    0x9bfd7c64, 0x0b3e7276, 0xf2688e77, 0x8fad8abc, 0xb0509568, 0xf1ada29f, 0xa53efdfe, 0xcb2b1d00,
    0xf2a9e986, 0x6463432b, 0x95094051, 0x5a223ad2, 0x9be8401b, 0x61e579cb, 0x1a556a14, 0x5840fdc2,
    0x9261ddf6, 0xcde002bb, 0x52432bb0, 0xbf17373e, 0x7b7c222f, 0x2955ed16, 0x9f10ca59, 0xe840c4c9,
    0xccabd806, 0x14543f34, 0x1462417a, 0x0d4a1f9c, 0x087ed925, 0xd7f8f24c, 0x7338c425, 0xcf86c8f5,
    0xb19165cd, 0x9891c393, 0x325384ac, 0x0308459d, 0x86141d7e, 0xc922116a, 0xe2ffa6b6, 0x53f52aed,
    0x2cd86197, 0xf5b9f498, 0xbf319c8f, 0xe0411fae, 0x977eb18c, 0xd8770976, 0x9833466a, 0xc674df7f,
    0x8c297d45, 0x8ca48d26, 0xc49ed8e2, 0x7344f874, 0x556f79c7, 0x6b25eaed, 0xa03e2b42, 0xf68f66a4,
    0x8e8b09a2, 0xf2e0e62a, 0x0d3a9806, 0x9729e493, 0x8c72b0fc, 0x160b94f6, 0x450e4d3d, 0x7a320e85,
    0xbef8f0e1, 0x21d73653, 0x4e3d977a, 0x1e7b3929, 0x1cc6c719, 0xbe478d53, 0x8d752809, 0xe6d8c2c6,
    0x275f0892, 0xc8acc273, 0x4cc21580, 0xecc4a617, 0xf5f7be70, 0xe795248a, 0x375a2fe9, 0x425570b6,
    0x8898dcf8, 0xdc2d97c4, 0x0106114b, 0x364dc22f, 0x1e0cad1f, 0xbe63803c, 0x5f69fac2, 0x4d5afa6f,
    0x1bc0dfb5, 0xfb273589, 0x0ea47f7b, 0x3c1c2b50, 0x21b2a932, 0x6b1223fd, 0x2fe706a8, 0xf9bd6ce2,
    0xa268e64e, 0xe987f486, 0x3eacf563, 0x1ca2018c, 0x65e18228, 0x2207360a, 0x57cf1715, 0x34c37d2b,
    0x1f8f3cde, 0x93b657cf, 0x31a019fd, 0xe69eb729, 0x8bca7b9b, 0x4c9d5bed, 0x277ebeaf, 0xe0d8f8ae,
    0xd150821c, 0x31381871, 0xafc3f1b0, 0x927db328, 0xe95effac, 0x305a47bd, 0x426ba35b, 0x1233af3f,
    0x686a5b83, 0x50e072e5, 0xd9d3bb2a, 0x8befc475, 0x487f0de6, 0xc88dff89, 0xbd664d5e, 0x971b5d18,
    0x63b14847, 0xd7d3c1ce, 0x7f583cf3, 0x72cbcb09, 0xc0d0a81c, 0x7fa3429b, 0xe9158a1b, 0x225ea19a,
    0xd8ca9ea3, 0xc763b282, 0xbb0c6341, 0x020b8293, 0xd4cd299d, 0x58cfa7f8, 0x91b4ee53, 0x37e4d140,
    0x95ec764c, 0x30f76b06, 0x5ee68d24, 0x679c8661, 0xa41979c2, 0xf2b61284, 0x4fac1475, 0x0adb49f9,
    0x19727a23, 0x15a7e374, 0xc43a18d5, 0x3fb1aa73, 0x342fc615, 0x924c0793, 0xbee2d7f0, 0x8a279de9,
    0x4aa2d70c, 0xe24dd37f, 0xbe862c0b, 0x177c22c2, 0x5388e5ee, 0xcd8a7510, 0xf901b4fd, 0xdbc13dbc,
    0x6c0bae5b, 0x64efe8c7, 0x48b02079, 0x80331a49, 0xca3d8ae6, 0xf3546190, 0xfed7108b, 0xc49b941b,
    0x32baf4a9, 0xeb833a4a, 0x88a3f1a5, 0x3a91ce0a, 0x3cc27da1, 0x7112e684, 0x4a3096b1, 0x3794574c,
    0xa3c8b6f3, 0x1d213941, 0x6e0a2e00, 0x233479f1, 0x0f4cd82f, 0x6093edd2, 0x5d7d209e, 0x464fe319,
    0xd4dcac9e, 0x0db845cb, 0xfb5e4bc3, 0xe0256ce1, 0x09fb4ed1, 0x0914be1e, 0xa5bdb2c3, 0xc6eb57bb,
    0x30320350, 0x3f397e91, 0xa67791bc, 0x86bc0e2c, 0xefa0a7e2, 0xe9ff7543, 0xe733612c, 0xd185897b,
    0x329e5388, 0x91dd236b, 0x2ecb0d93, 0xf4d82a3d, 0x35b5c03f, 0xe4e606f0, 0x05b21843, 0x37b45964,
    0x5eff22f4, 0x6027f4cc, 0x77178b3c, 0xae507131, 0x7bf7cabc, 0xf9c18d66, 0x593ade65, 0xd95ddf11,
];

/// Tunable chunker parameters, recorded in the manifest so every client
/// of a repository cuts the same boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerParams {
    pub window_size: usize,
    pub chunk_mask: u32,
    pub min_size: usize,
    pub max_size: usize,
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self {
            window_size: WINDOW_SIZE,
            chunk_mask: CHUNK_MASK,
            min_size: CHUNK_MIN,
            max_size: CHUNK_MAX,
        }
    }
}

impl ChunkerParams {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 || self.max_size == 0 || self.min_size > self.max_size {
            return Err(Error::Configuration {
                reason: format!("invalid chunker parameters {:?}", self),
            });
        }
        Ok(())
    }
}

fn seeded_table(seed: u32) -> [u32; 256] {
    let mut table = BUZHASH_TABLE;
    for entry in table.iter_mut() {
        *entry ^= seed;
    }
    table
}

fn hash_window(data: &[u8], table: &[u32; 256]) -> u32 {
    let len = data.len();
    data.iter().enumerate().fold(0u32, |sum, (i, &b)| {
        sum ^ table[b as usize].rotate_left(((len - 1 - i) & 0x1f) as u32)
    })
}

fn roll(sum: u32, remove: u8, add: u8, len: usize, table: &[u32; 256]) -> u32 {
    sum.rotate_left(1) ^ table[remove as usize].rotate_left((len & 0x1f) as u32) ^ table[add as usize]
}

/// Buzhash of `data` with the table seeded by `seed`
pub fn buzhash(data: &[u8], seed: u32) -> u32 {
    hash_window(data, &seeded_table(seed))
}

/// Roll a window hash of length `len` by dropping `remove` and appending `add`
pub fn buzhash_update(sum: u32, remove: u8, add: u8, len: usize, seed: u32) -> u32 {
    roll(sum, remove, add, len, &seeded_table(seed))
}

/// Splits byte streams into content-defined chunks
#[derive(Clone)]
pub struct Chunker {
    params: ChunkerParams,
    table: [u32; 256],
}

impl Chunker {
    pub fn new(params: ChunkerParams, seed: u32) -> Self {
        Self {
            params,
            table: seeded_table(seed),
        }
    }

    pub fn params(&self) -> &ChunkerParams {
        &self.params
    }

    /// Iterate over the chunks of `reader`
    pub fn chunkify<R: Read>(&self, reader: R) -> Chunks<'_, R> {
        Chunks {
            chunker: self,
            reader,
            buf: Vec::new(),
            pos: 0,
            hash: 0,
            eof: false,
        }
    }

    /// Chunk an in-memory buffer
    pub fn chunk_bytes(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.chunkify(data).collect()
    }
}

/// Iterator returned by [`Chunker::chunkify`]
pub struct Chunks<'c, R> {
    chunker: &'c Chunker,
    reader: R,
    /// Data of the current chunk plus read-ahead; the chunk starts at 0
    buf: Vec<u8>,
    /// Bytes of `buf` consumed into the current chunk
    pos: usize,
    hash: u32,
    eof: bool,
}

impl<R: Read> Chunks<'_, R> {
    fn fill(&mut self) -> Result<usize> {
        let old = self.buf.len();
        self.buf.resize(old + READ_SIZE, 0);
        loop {
            match self.reader.read(&mut self.buf[old..]) {
                Ok(n) => {
                    self.buf.truncate(old + n);
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(old);
                    return Err(e.into());
                }
            }
        }
    }

    fn cut(&mut self) -> Vec<u8> {
        let rest = self.buf.split_off(self.pos);
        self.pos = 0;
        self.hash = 0;
        mem::replace(&mut self.buf, rest)
    }
}

impl<R: Read> Iterator for Chunks<'_, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let params = self.chunker.params;
        let window = params.window_size;
        let min = params.min_size.max(window);
        loop {
            if self.pos >= self.buf.len() {
                if self.eof {
                    if self.buf.is_empty() {
                        return None;
                    }
                    return Some(Ok(self.cut()));
                }
                match self.fill() {
                    Ok(0) => self.eof = true,
                    Ok(_) => {}
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }

            self.pos += 1;
            if self.pos >= params.max_size {
                return Some(Ok(self.cut()));
            }
            if self.pos < window {
                continue;
            }
            self.hash = if self.pos == window {
                hash_window(&self.buf[..window], &self.chunker.table)
            } else {
                roll(
                    self.hash,
                    self.buf[self.pos - window - 1],
                    self.buf[self.pos - 1],
                    window,
                    &self.chunker.table,
                )
            };
            if self.pos >= min && self.hash & params.chunk_mask == 0 {
                return Some(Ok(self.cut()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{RngCore, SeedableRng};
    use std::collections::HashSet;

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        SmallRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn small_params() -> ChunkerParams {
        ChunkerParams {
            window_size: 48,
            chunk_mask: 0x3ff,
            min_size: 64,
            max_size: 8192,
        }
    }

    #[test]
    fn test_buzhash_rolls() {
        let seed = 0;
        assert_eq!(
            buzhash(b"abcdefghijklmnop", seed),
            buzhash_update(buzhash(b"Xabcdefghijklmno", seed), b'X', b'p', 16, seed)
        );
        assert_ne!(buzhash(b"abcdefghijklmnop", 0), buzhash(b"abcdefghijklmnop", 1));

        // windows wider than the rotation period
        let data = random_bytes(200, 3);
        let mut sum = buzhash(&data[..100], 42);
        for i in 100..200 {
            sum = buzhash_update(sum, data[i - 100], data[i], 100, 42);
            assert_eq!(sum, buzhash(&data[i - 99..=i], 42));
        }
    }

    #[test]
    fn test_chunks_concatenate_to_input() -> Result<()> {
        let data = random_bytes(300_000, 1);
        let chunker = Chunker::new(small_params(), 0);
        let chunks = chunker.chunk_bytes(&data)?;
        assert!(chunks.len() > 10);
        assert_eq!(chunks.concat(), data);
        assert!(chunks.iter().all(|c| c.len() <= 8192));
        assert!(chunks[..chunks.len() - 1].iter().all(|c| c.len() >= 64));
        Ok(())
    }

    #[test]
    fn test_empty_input() -> Result<()> {
        let chunker = Chunker::new(ChunkerParams::default(), 0);
        assert!(chunker.chunk_bytes(b"")?.is_empty());
        assert_eq!(chunker.chunk_bytes(b"foo")?, vec![b"foo".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_max_size_cuts() -> Result<()> {
        let params = ChunkerParams {
            window_size: 16,
            chunk_mask: u32::MAX,
            min_size: 16,
            max_size: 100,
        };
        let data = random_bytes(1050, 2);
        let chunks = Chunker::new(params, 5).chunk_bytes(&data)?;
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes.len(), 11);
        assert!(sizes[..10].iter().all(|&s| s == 100));
        assert_eq!(sizes[10], 50);
        Ok(())
    }

    #[test]
    fn test_deterministic_and_seeded() -> Result<()> {
        let data = random_bytes(200_000, 4);
        let a = Chunker::new(small_params(), 1).chunk_bytes(&data)?;
        let b = Chunker::new(small_params(), 1).chunk_bytes(&data)?;
        let c = Chunker::new(small_params(), 2).chunk_bytes(&data)?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn test_insertion_keeps_most_chunks() -> Result<()> {
        let data = random_bytes(256 * 1024, 5);
        let mut shifted = random_bytes(100, 6);
        shifted.extend_from_slice(&data);

        let chunker = Chunker::new(small_params(), 0);
        let original = chunker.chunk_bytes(&data)?;
        let moved: HashSet<Vec<u8>> = chunker.chunk_bytes(&shifted)?.into_iter().collect();
        let shared = original.iter().filter(|c| moved.contains(*c)).count();
        assert!(shared * 4 >= original.len() * 3, "{} of {}", shared, original.len());
        Ok(())
    }

    #[test]
    fn test_small_reads() -> Result<()> {
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = buf.len().min(7).min(self.0.len());
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }

        let data = random_bytes(50_000, 7);
        let chunker = Chunker::new(small_params(), 9);
        let whole = chunker.chunk_bytes(&data)?;
        let trickled: Vec<Vec<u8>> = chunker.chunkify(Trickle(&data)).collect::<Result<_>>()?;
        assert_eq!(whole, trickled);
        Ok(())
    }
}
