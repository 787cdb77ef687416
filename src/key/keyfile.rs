//! Key material sealed with a passphrase, and where to find it

use crate::{Error, Result};
use age::secrecy::{ExposeSecret, Secret, SecretString};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

pub const HEADER: &str = "BURROW KEY";
pub const PASSPHRASE_ENV: &str = "BURROW_PASSPHRASE";

const KEY_VERSION: u32 = 1;
const LINE_WIDTH: usize = 76;

/// Secrets of an encrypted repository
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub version: u32,
    #[serde(with = "crate::id::bytes")]
    pub repository_id: Vec<u8>,
    #[serde(with = "crate::id::bytes")]
    pub enc_key: Vec<u8>,
    #[serde(with = "crate::id::bytes")]
    pub id_key: Vec<u8>,
    pub chunk_seed: u32,
}

impl KeyMaterial {
    pub fn generate(repository_id: &[u8]) -> Self {
        use rand::RngCore;
        let mut rng = rand::rngs::OsRng;
        let mut enc_key = vec![0u8; 32];
        let mut id_key = vec![0u8; 32];
        rng.fill_bytes(&mut enc_key);
        rng.fill_bytes(&mut id_key);
        Self {
            version: KEY_VERSION,
            repository_id: repository_id.to_vec(),
            enc_key,
            id_key,
            chunk_seed: rng.next_u32(),
        }
    }

    fn validate(self) -> Result<Self> {
        if self.version != KEY_VERSION || self.enc_key.len() != 32 || self.id_key.len() != 32 {
            return Err(Error::UnsupportedPayload {
                reason: format!("unsupported key material version {}", self.version),
            });
        }
        Ok(self)
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.id_key.zeroize();
        self.chunk_seed.zeroize();
    }
}

/// Serialize and seal key material, returning wrapped base64 text
pub fn seal(material: &KeyMaterial, passphrase: &SecretString) -> Result<String> {
    let mut plain = rmp_serde::to_vec_named(material)?;
    let encryptor = age::Encryptor::with_user_passphrase(Secret::new(passphrase.expose_secret().clone()));
    let mut sealed = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut sealed)
        .map_err(|e| Error::Crypto { reason: e.to_string() })?;
    writer.write_all(&plain)?;
    writer.finish()?;
    plain.zeroize();

    let encoded = STANDARD.encode(&sealed);
    let lines: Vec<&str> = encoded
        .as_bytes()
        .chunks(LINE_WIDTH)
        .filter_map(|line| std::str::from_utf8(line).ok())
        .collect();
    Ok(lines.join("\n"))
}

/// Reverse of [`seal`]
pub fn unseal(text: &str, passphrase: &SecretString) -> Result<KeyMaterial> {
    let compact: String = text.split_whitespace().collect();
    let sealed = STANDARD.decode(compact).map_err(|e| Error::KeyDecryption {
        reason: format!("key data is not valid base64: {}", e),
    })?;
    let decryptor = match age::Decryptor::new(&sealed[..]) {
        Ok(age::Decryptor::Passphrase(decryptor)) => decryptor,
        Ok(_) => {
            return Err(Error::KeyDecryption {
                reason: "key is not sealed with a passphrase".into(),
            })
        }
        Err(e) => return Err(Error::KeyDecryption { reason: e.to_string() }),
    };
    let mut reader = decryptor
        .decrypt(passphrase, None)
        .map_err(|e| Error::KeyDecryption { reason: e.to_string() })?;
    let mut plain = Vec::new();
    reader.read_to_end(&mut plain)?;
    let material: KeyMaterial = rmp_serde::from_slice(&plain)?;
    plain.zeroize();
    material.validate()
}

/// Write a key file: header line naming the repository, then sealed data
pub fn write_keyfile(path: &Path, repository_id: &[u8], sealed: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, format!("{} {}\n{}\n", HEADER, hex::encode(repository_id), sealed))?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a key file, checking it belongs to `repository_id`; returns the sealed text
pub fn read_keyfile(path: &Path, repository_id: &[u8]) -> Result<String> {
    let content = fs::read_to_string(path)?;
    let (header, body) = content.split_once('\n').unwrap_or((content.as_str(), ""));
    if header.trim() != format!("{} {}", HEADER, hex::encode(repository_id)) {
        return Err(Error::KeyFileNotFound {
            repository_id: hex::encode(repository_id),
        });
    }
    Ok(body.to_string())
}

/// Locate the key file for `repository_id` in `keys_dir`
pub fn find_keyfile(keys_dir: &Path, repository_id: &[u8]) -> Result<PathBuf> {
    let wanted = format!("{} {}", HEADER, hex::encode(repository_id));
    if keys_dir.is_dir() {
        for entry in fs::read_dir(keys_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let mut first = String::new();
            BufReader::new(fs::File::open(&path)?).read_line(&mut first)?;
            if first.trim() == wanted {
                return Ok(path);
            }
        }
    }
    Err(Error::KeyFileNotFound {
        repository_id: hex::encode(repository_id),
    })
}

/// Pick an unused key file name in `keys_dir` derived from the repository path
pub fn new_keyfile_path(keys_dir: &Path, repository_path: &Path) -> PathBuf {
    let base = repository_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repository")
        .to_string();
    let mut path = keys_dir.join(&base);
    let mut n = 1;
    while path.exists() {
        path = keys_dir.join(format!("{}.{}", base, n));
        n += 1;
    }
    path
}

/// Source of passphrases for sealing and unsealing keys
pub trait PassphraseProvider {
    /// Passphrase of an existing key
    fn existing(&mut self, prompt: &str) -> Result<SecretString>;

    /// A new passphrase for sealing a key
    fn new_passphrase(&mut self) -> Result<SecretString>;

    /// Whether a wrong passphrase may be asked for again
    fn can_retry(&self) -> bool {
        false
    }
}

/// Reads `BURROW_PASSPHRASE`, falling back to prompting on the terminal
#[derive(Debug, Default)]
pub struct InteractivePassphrase;

impl InteractivePassphrase {
    fn from_env() -> Option<SecretString> {
        std::env::var(PASSPHRASE_ENV).ok().map(Secret::new)
    }
}

impl PassphraseProvider for InteractivePassphrase {
    fn existing(&mut self, prompt: &str) -> Result<SecretString> {
        match Self::from_env() {
            Some(passphrase) => Ok(passphrase),
            None => read_password(&format!("{}: ", prompt)),
        }
    }

    fn new_passphrase(&mut self) -> Result<SecretString> {
        if let Some(passphrase) = Self::from_env() {
            return Ok(passphrase);
        }
        loop {
            let first = read_password("Enter passphrase (empty for no passphrase): ")?;
            let second = read_password("Enter same passphrase again: ")?;
            if first.expose_secret() == second.expose_secret() {
                if first.expose_secret().is_empty() {
                    eprintln!("Using empty passphrase");
                }
                return Ok(first);
            }
            eprintln!("Passphrases do not match");
        }
    }

    fn can_retry(&self) -> bool {
        Self::from_env().is_none()
    }
}

/// Always answers with the same passphrase
#[derive(Clone)]
pub struct FixedPassphrase(pub String);

impl PassphraseProvider for FixedPassphrase {
    fn existing(&mut self, _prompt: &str) -> Result<SecretString> {
        Ok(Secret::new(self.0.clone()))
    }

    fn new_passphrase(&mut self) -> Result<SecretString> {
        Ok(Secret::new(self.0.clone()))
    }
}

/// Prompt on the controlling terminal with echo disabled
fn read_password(prompt: &str) -> Result<SecretString> {
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
    use std::os::unix::io::AsRawFd;

    let tty = fs::OpenOptions::new().read(true).write(true).open("/dev/tty")?;
    let fd = tty.as_raw_fd();
    let saved = tcgetattr(fd)?;
    let mut silent = saved.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    silent.local_flags.insert(LocalFlags::ECHONL);

    (&tty).write_all(prompt.as_bytes())?;
    tcsetattr(fd, SetArg::TCSANOW, &silent)?;
    let mut line = String::new();
    let read = BufReader::new(&tty).read_line(&mut line);
    tcsetattr(fd, SetArg::TCSANOW, &saved)?;
    read?;

    let passphrase = line.trim_end_matches(['\r', '\n']).to_string();
    line.zeroize();
    Ok(Secret::new(passphrase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seal_unseal() -> Result<()> {
        let material = KeyMaterial::generate(&[9u8; 32]);
        let passphrase = Secret::new("correct horse".to_string());
        let sealed = seal(&material, &passphrase)?;
        assert!(sealed.lines().all(|l| l.len() <= LINE_WIDTH));

        let opened = unseal(&sealed, &passphrase)?;
        assert_eq!(opened.enc_key, material.enc_key);
        assert_eq!(opened.id_key, material.id_key);
        assert_eq!(opened.chunk_seed, material.chunk_seed);

        let wrong = Secret::new("battery staple".to_string());
        assert!(matches!(unseal(&sealed, &wrong), Err(Error::KeyDecryption { .. })));
        Ok(())
    }

    #[test]
    fn test_keyfile_lookup() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let keys = temp_dir.path().join("keys");
        let repo_path = temp_dir.path().join("repo");

        let first = new_keyfile_path(&keys, &repo_path);
        write_keyfile(&first, &[1u8; 32], "AAAA")?;
        let second = new_keyfile_path(&keys, &repo_path);
        assert_ne!(first, second);
        write_keyfile(&second, &[2u8; 32], "BBBB")?;

        assert_eq!(find_keyfile(&keys, &[2u8; 32])?, second);
        assert_eq!(read_keyfile(&first, &[1u8; 32])?.trim(), "AAAA");
        assert!(matches!(
            find_keyfile(&keys, &[3u8; 32]),
            Err(Error::KeyFileNotFound { .. })
        ));
        assert!(read_keyfile(&first, &[2u8; 32]).is_err());
        Ok(())
    }
}
