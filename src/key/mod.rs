//! Object envelope: compression, encryption and id hashing
//!
//! Every object stored in a repository starts with two header bytes, the
//! key type and the compression type. Encrypted objects follow with a
//! random 24 byte nonce and XChaCha20-Poly1305 ciphertext whose
//! associated data is the header.

pub mod compress;
pub mod keyfile;

pub use compress::Compression;
pub use keyfile::{FixedPassphrase, InteractivePassphrase, KeyMaterial, PassphraseProvider};

use crate::id::ObjectId;
use crate::repository::Repository;
use crate::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

pub const TYPE_KEYFILE: u8 = 0x00;
pub const TYPE_PASSPHRASE: u8 = 0x01;
pub const TYPE_PLAINTEXT: u8 = 0x02;

const NONCE_SIZE: usize = 24;
const MAX_PASSPHRASE_ATTEMPTS: usize = 3;

/// How a repository's objects are protected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// No encryption, ids are plain BLAKE3 digests
    None,
    /// Key material sealed with a passphrase inside the repository
    Passphrase,
    /// Key material sealed with a passphrase in the local keys directory
    Keyfile,
}

impl KeyMode {
    pub fn type_byte(&self) -> u8 {
        match self {
            KeyMode::None => TYPE_PLAINTEXT,
            KeyMode::Passphrase => TYPE_PASSPHRASE,
            KeyMode::Keyfile => TYPE_KEYFILE,
        }
    }

    fn from_type(byte: u8) -> Result<Self> {
        match byte {
            TYPE_PLAINTEXT => Ok(KeyMode::None),
            TYPE_PASSPHRASE => Ok(KeyMode::Passphrase),
            TYPE_KEYFILE => Ok(KeyMode::Keyfile),
            other => Err(Error::UnsupportedPayload {
                reason: format!("unknown key type {:#04x}", other),
            }),
        }
    }
}

impl FromStr for KeyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(KeyMode::None),
            "passphrase" => Ok(KeyMode::Passphrase),
            "keyfile" => Ok(KeyMode::Keyfile),
            other => Err(Error::Configuration {
                reason: format!("unknown encryption mode '{}'", other),
            }),
        }
    }
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyMode::None => "none",
            KeyMode::Passphrase => "passphrase",
            KeyMode::Keyfile => "keyfile",
        };
        f.write_str(name)
    }
}

/// Keys of one repository
pub struct Key {
    mode: KeyMode,
    compression: Compression,
    material: Option<KeyMaterial>,
    /// File holding the sealed key material
    location: Option<PathBuf>,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("mode", &self.mode)
            .field("compression", &self.compression)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

fn repository_key_path(repository: &Repository) -> PathBuf {
    repository.path().join("key")
}

impl Key {
    /// Key for an unencrypted repository
    pub fn plaintext(compression: Compression) -> Self {
        Self {
            mode: KeyMode::None,
            compression,
            material: None,
            location: None,
        }
    }

    /// Generate and store a new key for `repository`
    pub fn create(
        repository: &Repository,
        mode: KeyMode,
        compression: Compression,
        keys_dir: &Path,
        passphrases: &mut dyn PassphraseProvider,
    ) -> Result<Self> {
        if mode == KeyMode::None {
            return Ok(Self::plaintext(compression));
        }
        let material = KeyMaterial::generate(repository.id());
        let location = match mode {
            KeyMode::Keyfile => keyfile::new_keyfile_path(keys_dir, repository.path()),
            _ => repository_key_path(repository),
        };
        let passphrase = passphrases.new_passphrase()?;
        let sealed = keyfile::seal(&material, &passphrase)?;
        keyfile::write_keyfile(&location, repository.id(), &sealed)?;
        info!("Key stored in {}", location.display());
        Ok(Self {
            mode,
            compression,
            material: Some(material),
            location: Some(location),
        })
    }

    /// Identify and load the key that encrypted `manifest_data`
    pub fn detect(
        repository: &Repository,
        manifest_data: &[u8],
        keys_dir: &Path,
        passphrases: &mut dyn PassphraseProvider,
    ) -> Result<Self> {
        if manifest_data.len() < 2 {
            return Err(Error::integrity("manifest envelope truncated"));
        }
        let mode = KeyMode::from_type(manifest_data[0])?;
        let compression = Compression::from_type(manifest_data[1])?;
        let location = match mode {
            KeyMode::None => return Ok(Self::plaintext(compression)),
            KeyMode::Passphrase => repository_key_path(repository),
            KeyMode::Keyfile => keyfile::find_keyfile(keys_dir, repository.id())?,
        };
        let sealed = keyfile::read_keyfile(&location, repository.id())?;
        let prompt = format!("Enter passphrase for key {}", location.display());

        let mut attempt = 0;
        let material = loop {
            attempt += 1;
            let passphrase = passphrases.existing(&prompt)?;
            match keyfile::unseal(&sealed, &passphrase) {
                Ok(material) => break material,
                Err(Error::KeyDecryption { reason })
                    if passphrases.can_retry() && attempt < MAX_PASSPHRASE_ATTEMPTS =>
                {
                    warn!("Incorrect passphrase ({})", reason);
                }
                Err(e) => return Err(e),
            }
        };
        if material.repository_id != repository.id() {
            return Err(Error::integrity("key belongs to a different repository"));
        }
        Ok(Self {
            mode,
            compression,
            material: Some(material),
            location: Some(location),
        })
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Seed for the chunker's hash table
    pub fn chunk_seed(&self) -> u32 {
        self.material.as_ref().map_or(0, |m| m.chunk_seed)
    }

    pub fn id_hash(&self, data: &[u8]) -> ObjectId {
        let digest = match self.material.as_ref().and_then(|m| <[u8; 32]>::try_from(&m.id_key[..]).ok()) {
            Some(id_key) => blake3::keyed_hash(&id_key, data),
            None => blake3::hash(data),
        };
        ObjectId(*digest.as_bytes())
    }

    fn cipher(&self) -> Result<Option<XChaCha20Poly1305>> {
        match &self.material {
            None => Ok(None),
            Some(material) => XChaCha20Poly1305::new_from_slice(&material.enc_key)
                .map(Some)
                .map_err(|e| Error::Crypto { reason: e.to_string() }),
        }
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let header = [self.mode.type_byte(), self.compression.type_byte()];
        let compressed = self.compression.compress(data)?;
        let mut out = header.to_vec();
        match self.cipher()? {
            None => out.extend_from_slice(&compressed),
            Some(cipher) => {
                let mut nonce = [0u8; NONCE_SIZE];
                rand::rngs::OsRng.fill_bytes(&mut nonce);
                let sealed = cipher
                    .encrypt(XNonce::from_slice(&nonce), Payload { msg: &compressed, aad: &header })
                    .map_err(|e| Error::Crypto { reason: e.to_string() })?;
                out.reserve(NONCE_SIZE + sealed.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
            }
        }
        Ok(out)
    }

    /// Open an envelope; when `id` is given the plaintext must hash to it
    pub fn decrypt(&self, id: Option<&ObjectId>, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 2 {
            return Err(Error::integrity("object envelope truncated"));
        }
        if data[0] != self.mode.type_byte() {
            return Err(Error::integrity(format!(
                "invalid encryption envelope: key type {:#04x}, expected {:#04x}",
                data[0],
                self.mode.type_byte()
            )));
        }
        let compression = Compression::from_type(data[1])?;
        let header = &data[..2];
        let payload = &data[2..];

        let compressed = match self.cipher()? {
            None => payload.to_vec(),
            Some(cipher) => {
                if payload.len() < NONCE_SIZE {
                    return Err(Error::integrity("encryption envelope truncated"));
                }
                let (nonce, sealed) = payload.split_at(NONCE_SIZE);
                cipher
                    .decrypt(XNonce::from_slice(nonce), Payload { msg: sealed, aad: header })
                    .map_err(|_| Error::integrity("encryption envelope checksum mismatch"))?
            }
        };
        let plain = compression.decompress(&compressed)?;
        if let Some(id) = id {
            if self.id_hash(&plain) != *id {
                return Err(Error::integrity(format!("chunk id verification failed for {}", id)));
            }
        }
        Ok(plain)
    }

    /// Re-seal the key material under a new passphrase
    pub fn change_passphrase(&mut self, passphrases: &mut dyn PassphraseProvider) -> Result<()> {
        let (Some(material), Some(location)) = (&self.material, &self.location) else {
            return Err(Error::Configuration {
                reason: "repository is not encrypted".into(),
            });
        };
        let passphrase = passphrases.new_passphrase()?;
        let sealed = keyfile::seal(material, &passphrase)?;
        keyfile::write_keyfile(location, &material.repository_id, &sealed)?;
        info!("Key file {} updated", location.display());
        Ok(())
    }
}
