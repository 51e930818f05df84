//! Backend drivers
//!
//! One driver per remote protocol, all behind the same capability interface.
//! A [`Driver`] validates its options at construction and opens protocol
//! connections; a [`Handle`] is one live connection, owned by the pool and
//! handed out exclusively. Handles raise only the shared error taxonomy, so
//! nothing backend-specific crosses the facade.

pub mod dropbox;
pub mod ftp;
pub mod gdrive;
pub mod memory;
pub mod s3;
pub mod smb;
pub mod swift;
pub mod webdav;

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{BackendOptions, MountConfig};
use crate::credentials::CredentialStore;
use crate::error::{Result, StorageError};

/// File type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

/// Metadata for a file or directory
#[derive(Debug, Clone)]
pub struct Metadata {
    pub file_type: FileType,
    pub size: u64,
    pub mtime: SystemTime,
}

impl Metadata {
    pub fn file(size: u64, mtime: SystemTime) -> Self {
        Self {
            file_type: FileType::File,
            size,
            mtime,
        }
    }

    pub fn directory(mtime: SystemTime) -> Self {
        Self {
            file_type: FileType::Directory,
            size: 0,
            mtime,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.file_type, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.file_type, FileType::Directory)
    }
}

/// Directory entry returned by list
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

impl DirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::File,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::Directory,
        }
    }
}

/// A configured backend driver. Stateless apart from its options; all
/// network state lives in the handles it opens.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a new protocol connection.
    async fn connect(&self) -> Result<Box<dyn Handle>>;
}

/// One live backend connection.
///
/// Paths are mount-relative, slash-separated, with a leading `/` (the facade
/// has already applied the mount's remote subfolder). Operations take `&mut`
/// because several protocols (FTP, SMB) carry connection state; the pool
/// guarantees exclusive access.
#[async_trait]
pub trait Handle: Send + Sync {
    /// Get metadata for a path
    async fn stat(&mut self, path: &str) -> Result<Metadata>;

    /// Read `size` bytes starting at `offset`
    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes>;

    /// Write a full object; returns the number of bytes written
    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64>;

    /// List directory contents
    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>>;

    /// Remove a file or an empty directory
    async fn delete(&mut self, path: &str) -> Result<()>;

    /// Create a directory
    async fn mkdir(&mut self, path: &str) -> Result<()>;

    /// Probe a path for reading; fails on directories.
    ///
    /// Default implementation uses stat()
    async fn open(&mut self, path: &str) -> Result<Metadata> {
        let metadata = self.stat(path).await?;
        if metadata.is_dir() {
            return Err(StorageError::InvalidPath(format!(
                "cannot open a directory: {}",
                path
            )));
        }
        Ok(metadata)
    }

    /// Check if a path exists
    ///
    /// Default implementation uses stat()
    async fn exists(&mut self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Map a reqwest transport failure into the shared taxonomy. Connect and
/// timeout failures are retryable; anything else about the exchange itself
/// is a protocol error.
pub(crate) fn transport_error(backend: &str, err: reqwest::Error) -> StorageError {
    if err.is_timeout() || err.is_connect() {
        StorageError::Unavailable(format!("{}: {}", backend, err))
    } else {
        StorageError::ProtocolError(format!("{}: {}", backend, err))
    }
}

/// Build the driver for a mount. Closed dispatch over the backend type;
/// adding a backend means adding an arm here and a module above.
pub fn create_driver(
    config: &MountConfig,
    credentials: Arc<CredentialStore>,
) -> Result<Arc<dyn Driver>> {
    config.backend.validate()?;
    let mount_id = config.mount_id.clone();

    Ok(match &config.backend {
        BackendOptions::S3(o) => Arc::new(s3::S3Driver::new(mount_id, o.clone(), credentials)),
        BackendOptions::Swift(o) => {
            Arc::new(swift::SwiftDriver::new(mount_id, o.clone(), credentials))
        }
        BackendOptions::Smb(o) => Arc::new(smb::SmbDriver::new(mount_id, o.clone(), credentials)),
        BackendOptions::Ftp(o) => Arc::new(ftp::FtpDriver::new(mount_id, o.clone(), credentials)),
        BackendOptions::WebDav(o) => {
            Arc::new(webdav::WebDavDriver::new(mount_id, o.clone(), credentials)?)
        }
        BackendOptions::Dropbox(o) => {
            Arc::new(dropbox::DropboxDriver::new(mount_id, o.clone(), credentials))
        }
        BackendOptions::GoogleDrive(o) => {
            Arc::new(gdrive::GDriveDriver::new(mount_id, o.clone(), credentials))
        }
        BackendOptions::Memory(_) => Arc::new(memory::MemoryDriver::new()),
    })
}
