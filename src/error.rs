//! Error types for burrow

use thiserror::Error;

/// Main error type for burrow operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Msgpack encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Msgpack decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("Repository {path} does not exist")]
    RepositoryDoesNotExist { path: String },

    #[error("Repository {path} already exists")]
    RepositoryAlreadyExists { path: String },

    #[error("{path} is not a valid repository")]
    InvalidRepository { path: String },

    #[error("Object not found in repository: {id}")]
    ObjectNotFound { id: String },

    #[error("Integrity verification failed: {reason}")]
    IntegrityError { reason: String },

    #[error("Unsupported payload: {reason}")]
    UnsupportedPayload { reason: String },

    #[error("No key file for repository {repository_id} found")]
    KeyFileNotFound { repository_id: String },

    #[error("Failed to decrypt key: {reason}")]
    KeyDecryption { reason: String },

    #[error("Archive {name} already exists")]
    ArchiveAlreadyExists { name: String },

    #[error("Archive {name} does not exist")]
    ArchiveNotFound { name: String },

    #[error("Cache is newer than repository, refusing to continue (possible replay attack)")]
    RepositoryReplay,

    #[error("Failed to acquire lock on {path}")]
    LockTimeout { path: String },

    #[error("Invalid location: {location}")]
    InvalidLocation { location: String },

    #[error("Remote repositories are not supported: {location}")]
    RemoteUnsupported { location: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Cryptographic operation failed: {reason}")]
    Crypto { reason: String },

    #[error("Feature not available: {feature}")]
    FeatureNotAvailable { feature: String },
}

impl Error {
    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        Error::IntegrityError {
            reason: reason.into(),
        }
    }
}

/// Result type alias for burrow operations
pub type Result<T> = std::result::Result<T, Error>;
