//! Client configuration file

use crate::chunker::ChunkerParams;
use crate::key::{Compression, KeyMode};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "BURROW_CONFIG";
pub const CACHE_DIR_ENV: &str = "BURROW_CACHE_DIR";
pub const KEYS_DIR_ENV: &str = "BURROW_KEYS_DIR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub repository: RepositoryConfig,
    pub create: CreateConfig,
    pub chunker: ChunkerParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub cache_dir: PathBuf,
    pub keys_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Key mode used by `init`
    pub encryption: KeyMode,
    /// Compression spec such as `zlib,6` or `zstd,3`
    pub compression: String,
    /// Seconds to wait for a repository or cache lock
    pub lock_wait: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateConfig {
    /// Seconds between checkpoints while creating an archive
    pub checkpoint_interval: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        let cache = dirs::cache_dir().unwrap_or_else(|| home.join(".cache"));
        let config = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
        Self {
            cache_dir: cache.join("burrow"),
            keys_dir: config.join("burrow").join("keys"),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            encryption: KeyMode::Passphrase,
            compression: Compression::default().to_string(),
            lock_wait: 1,
        }
    }
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self { checkpoint_interval: 300 }
    }
}

impl Config {
    /// Default location, `~/.config/burrow/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("burrow").join("config.toml"))
    }

    /// Load from `path`, `BURROW_CONFIG` or the default location; a missing
    /// file yields defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut config = match explicit.clone().or_else(Self::default_path) {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) if explicit.is_some() => {
                return Err(Error::Configuration {
                    reason: format!("config file {} does not exist", path.display()),
                })
            }
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
            self.paths.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os(KEYS_DIR_ENV) {
            self.paths.keys_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.compression()?;
        self.chunker.validate()
    }

    pub fn compression(&self) -> Result<Compression> {
        self.repository.compression.parse()
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.repository.lock_wait)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.create.checkpoint_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[repository]\nencryption = \"keyfile\"\ncompression = \"zstd,3\"\n\n[create]\ncheckpoint_interval = 60\n",
        )?;
        let config = Config::from_file(&path)?;
        assert_eq!(config.repository.encryption, KeyMode::Keyfile);
        assert_eq!(config.compression()?, Compression::Zstd(3));
        assert_eq!(config.checkpoint_interval(), Duration::from_secs(60));
        assert_eq!(config.repository.lock_wait, 1);
        assert_eq!(config.chunker, ChunkerParams::default());
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.paths.cache_dir = dir.path().join("cache");
        config.save(&path)?;
        assert_eq!(Config::from_file(&path)?, config);
        Ok(())
    }

    #[test]
    fn test_missing_explicit_file() {
        let missing = Path::new("/nonexistent/burrow.toml");
        assert!(matches!(Config::load(Some(missing)), Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_invalid_compression_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "[repository]\ncompression = \"lz4\"\n")?;
        assert!(Config::load(Some(&path)).is_err());
        Ok(())
    }
}
