//! extmount: a pluggable external-storage mounting layer
//!
//! Exposes remote storage services (S3, Swift, SMB, FTP, WebDAV, Dropbox,
//! Google Drive) behind one filesystem-like interface with a shared error
//! taxonomy.
//!
//! # Architecture
//!
//! - **Backends**: protocol drivers implementing the `Driver`/`Handle`
//!   traits for path-based file operations.
//! - **Credential store**: per-mount credential material with single-flight
//!   OAuth refresh.
//! - **Pools**: per-mount connection pools bounding backend concurrency and
//!   reusing healthy connections.
//! - **Resolver**: maps virtual paths plus the calling identity to a mount
//!   by longest-prefix match.
//! - **Facade**: ties the above together and owns the retry policy for
//!   expired credentials and transient outages.
//!
//! # Example
//!
//! ```no_run
//! use extmount::config::Config;
//! use extmount::facade::ExternalStorage;
//! use extmount::resolver::Caller;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file(std::path::Path::new("config.yaml"))?;
//! let storage = ExternalStorage::from_config(config)?;
//!
//! let alice = Caller::new("alice", vec!["staff".into()]);
//! let entries = storage.list(&alice, "/docs").await?;
//! for entry in entries {
//!     println!("{}", entry.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod credentials;
pub mod diag;
pub mod env;
pub mod error;
pub mod facade;
pub mod pool;
pub mod resolver;

pub use error::{Result, StorageError};
