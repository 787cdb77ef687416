//! # burrow
//!
//! Deduplicating, encrypting backup archiver with content-defined chunking.
//!
//! ## Features
//!
//! - **Chunker**: buzhash content-defined chunking with keyed seeds
//! - **Repository**: append-only segment log with a transactional hash index
//! - **Encryption**: XChaCha20-Poly1305 envelopes and keyed BLAKE3 object ids
//! - **Archives**: msgpack item streams with checkpoints, ACLs and xattrs
//! - **Check**: repository and archive consistency checks with repair
//! - **Mount**: read-only FUSE view of archives (feature `fuse`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use burrow::key::{Compression, FixedPassphrase, Key, KeyMode};
//! use burrow::manifest::{Manifest, ManifestConfig};
//! use burrow::repository::{Repository, DEFAULT_LOCK_WAIT};
//! use std::path::Path;
//!
//! # fn main() -> burrow::Result<()> {
//! let mut repository = Repository::create(Path::new("/backup/repo"), DEFAULT_LOCK_WAIT)?;
//! let key = Key::create(
//!     &repository,
//!     KeyMode::Passphrase,
//!     Compression::default(),
//!     Path::new("/backup/keys"),
//!     &mut FixedPassphrase("secret".to_string()),
//! )?;
//! let mut manifest = Manifest::new(ManifestConfig::default());
//! manifest.write(&mut repository, &key)?;
//! repository.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod chunker;
pub mod cli;
pub mod config;
pub mod error;
pub mod hashindex;
pub mod helpers;
pub mod id;
pub mod key;
pub mod logging;
pub mod manifest;
pub mod mount;
pub mod platform;
pub mod repository;

pub use error::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
