//! Compression applied to objects before encryption

use crate::repository::MAX_OBJECT_SIZE;
use crate::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

const ZSTD_BASE: u8 = 10;

/// Compressor and level, stored as one type byte in every object header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// zlib with level 0-9 (0 stores uncompressed)
    Zlib(u8),
    /// zstd with level 0-9 (0 picks zstd's default)
    Zstd(u8),
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zlib(6)
    }
}

impl Compression {
    pub fn from_type(byte: u8) -> Result<Self> {
        match byte {
            0..=9 => Ok(Compression::Zlib(byte)),
            10..=19 => Ok(Compression::Zstd(byte - ZSTD_BASE)),
            other => Err(Error::UnsupportedPayload {
                reason: format!("unknown compression type {}", other),
            }),
        }
    }

    pub fn type_byte(&self) -> u8 {
        match *self {
            Compression::Zlib(level) => level,
            Compression::Zstd(level) => ZSTD_BASE + level,
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match *self {
            Compression::Zlib(level) => {
                let mut encoder = ZlibEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    flate2::Compression::new(level as u32),
                );
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Compression::Zstd(level) => Ok(zstd::encode_all(data, level as i32)?),
        }
    }

    /// Inflate `data`; output larger than an object may be is rejected
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2);
        let limit = MAX_OBJECT_SIZE as u64 + 1;
        match self {
            Compression::Zlib(_) => {
                ZlibDecoder::new(data)
                    .take(limit)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::integrity(format!("zlib stream corrupt: {}", e)))?;
            }
            Compression::Zstd(_) => {
                zstd::stream::read::Decoder::new(data)?
                    .take(limit)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::integrity(format!("zstd stream corrupt: {}", e)))?;
            }
        }
        if out.len() > MAX_OBJECT_SIZE {
            return Err(Error::integrity(format!(
                "decompressed object exceeds {} bytes",
                MAX_OBJECT_SIZE
            )));
        }
        Ok(out)
    }
}

impl FromStr for Compression {
    type Err = Error;

    /// Parses `none`, `zlib`, `zlib,N`, `zstd` or `zstd,N`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Configuration {
            reason: format!("invalid compression spec '{}'", s),
        };
        let (name, level) = match s.split_once(',') {
            Some((name, level)) => (name, Some(level.trim().parse::<u8>().map_err(|_| invalid())?)),
            None => (s, None),
        };
        if level.map_or(false, |l| l > 9) {
            return Err(invalid());
        }
        match name.trim() {
            "none" if level.is_none() => Ok(Compression::Zlib(0)),
            "zlib" => Ok(Compression::Zlib(level.unwrap_or(6))),
            "zstd" => Ok(Compression::Zstd(level.unwrap_or(3))),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Zlib(0) => write!(f, "none"),
            Compression::Zlib(level) => write!(f, "zlib,{}", level),
            Compression::Zstd(level) => write!(f, "zstd,{}", level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() -> Result<()> {
        assert_eq!("zlib,9".parse::<Compression>()?, Compression::Zlib(9));
        assert_eq!("zstd".parse::<Compression>()?, Compression::Zstd(3));
        assert_eq!("none".parse::<Compression>()?, Compression::Zlib(0));
        assert!("lzma,6".parse::<Compression>().is_err());
        assert!("zlib,10".parse::<Compression>().is_err());
        assert_eq!(Compression::Zstd(4).to_string(), "zstd,4");
        Ok(())
    }

    #[test]
    fn test_type_bytes() -> Result<()> {
        for byte in 0..20u8 {
            assert_eq!(Compression::from_type(byte)?.type_byte(), byte);
        }
        assert!(matches!(
            Compression::from_type(20),
            Err(Error::UnsupportedPayload { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_compressors_shrink_text() -> Result<()> {
        let data = b"burrow ".repeat(1000);
        for compression in [Compression::Zlib(0), Compression::Zlib(6), Compression::Zstd(0), Compression::Zstd(9)] {
            let packed = compression.compress(&data)?;
            if compression != Compression::Zlib(0) {
                assert!(packed.len() < data.len() / 10);
            }
            assert_eq!(compression.decompress(&packed)?, data);
        }
        assert!(Compression::Zlib(6).decompress(b"garbage").is_err());
        Ok(())
    }

    #[test]
    fn test_decompression_is_bounded() -> Result<()> {
        let bomb = vec![0u8; MAX_OBJECT_SIZE + 1];
        for compression in [Compression::Zlib(6), Compression::Zstd(3)] {
            let packed = compression.compress(&bomb)?;
            assert!(matches!(
                compression.decompress(&packed),
                Err(Error::IntegrityError { .. })
            ));
        }
        Ok(())
    }
}
