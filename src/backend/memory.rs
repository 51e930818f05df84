//! In-memory backend
//!
//! Backs the facade, pool, and resolver tests and doubles as a scratch
//! backend for local development. All handles opened by one driver share the
//! same object map, so it behaves like one remote store with many
//! connections.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::backend::{DirEntry, Driver, FileType, Handle, Metadata};
use crate::error::{Result, StorageError};

#[derive(Default)]
struct State {
    files: DashMap<String, (Bytes, SystemTime)>,
    dirs: RwLock<BTreeSet<String>>,
}

/// In-memory driver; cheap handles over shared state.
#[derive(Default)]
pub struct MemoryDriver {
    state: Arc<State>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        Ok(Box::new(MemoryHandle {
            state: self.state.clone(),
        }))
    }
}

struct MemoryHandle {
    state: Arc<State>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        trimmed.to_string()
    }
}

fn parent_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut acc = String::new();
    for part in path.split('/') {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(part);
        prefixes.push(acc.clone());
    }
    prefixes.pop(); // the path itself is not its own parent
    prefixes
}

#[async_trait]
impl Handle for MemoryHandle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        let key = normalize(path);
        if key.is_empty() {
            return Ok(Metadata::directory(SystemTime::now()));
        }
        if let Some(entry) = self.state.files.get(&key) {
            let (data, mtime) = entry.value();
            return Ok(Metadata::file(data.len() as u64, *mtime));
        }
        if self.state.dirs.read().contains(&key) {
            return Ok(Metadata::directory(SystemTime::now()));
        }
        // Implicit directory: any file beneath this prefix
        let prefix = format!("{}/", key);
        if self.state.files.iter().any(|e| e.key().starts_with(&prefix)) {
            return Ok(Metadata::directory(SystemTime::now()));
        }
        Err(StorageError::NotFound(format!("path not found: {}", path)))
    }

    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        let key = normalize(path);
        let entry = self
            .state
            .files
            .get(&key)
            .ok_or_else(|| StorageError::NotFound(format!("file not found: {}", path)))?;
        let (data, _) = entry.value();
        let start = (offset as usize).min(data.len());
        let end = (start + size as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        let key = normalize(path);
        if key.is_empty() {
            return Err(StorageError::InvalidPath("cannot write to /".into()));
        }
        self.state
            .files
            .insert(key, (Bytes::copy_from_slice(data), SystemTime::now()));
        Ok(data.len() as u64)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let key = normalize(path);
        if !key.is_empty() {
            // Listing a missing path is an error, listing a file is invalid
            let metadata = self.stat(path).await?;
            if metadata.is_file() {
                return Err(StorageError::InvalidPath(format!(
                    "not a directory: {}",
                    path
                )));
            }
        }
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        };

        let mut names: BTreeMap<String, FileType> = BTreeMap::new();
        for entry in self.state.files.iter() {
            if let Some(rest) = entry.key().strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((dir, _)) => names.insert(dir.to_string(), FileType::Directory),
                    None => names.insert(rest.to_string(), FileType::File),
                };
            }
        }
        for dir in self.state.dirs.read().iter() {
            if let Some(rest) = dir.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    names.insert(rest.to_string(), FileType::Directory);
                }
            }
        }

        Ok(names
            .into_iter()
            .map(|(name, file_type)| DirEntry { name, file_type })
            .collect())
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        let key = normalize(path);
        if self.state.files.remove(&key).is_some() {
            return Ok(());
        }
        if self.state.dirs.read().contains(&key) {
            let prefix = format!("{}/", key);
            let occupied = self.state.files.iter().any(|e| e.key().starts_with(&prefix))
                || self
                    .state
                    .dirs
                    .read()
                    .iter()
                    .any(|d| d.starts_with(&prefix));
            if occupied {
                return Err(StorageError::NotEmpty(format!(
                    "directory not empty: {}",
                    path
                )));
            }
            self.state.dirs.write().remove(&key);
            return Ok(());
        }
        Err(StorageError::NotFound(format!("path not found: {}", path)))
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        let key = normalize(path);
        if key.is_empty() {
            return Err(StorageError::AlreadyExists("/".into()));
        }
        if self.state.files.contains_key(&key) {
            return Err(StorageError::AlreadyExists(format!(
                "a file exists at: {}",
                path
            )));
        }
        let mut dirs = self.state.dirs.write();
        if !dirs.insert(key.clone()) {
            return Err(StorageError::AlreadyExists(format!(
                "directory exists: {}",
                path
            )));
        }
        for prefix in parent_prefixes(&key) {
            dirs.insert(prefix);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handle() -> Box<dyn Handle> {
        MemoryDriver::new().connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let mut h = handle().await;
        h.write("/a/b.txt", b"hello world").await.unwrap();
        let data = h.read("/a/b.txt", 0, 1024).await.unwrap();
        assert_eq!(&data[..], b"hello world");

        // Ranged read
        let data = h.read("/a/b.txt", 6, 5).await.unwrap();
        assert_eq!(&data[..], b"world");
    }

    #[tokio::test]
    async fn test_handles_share_state() {
        let driver = MemoryDriver::new();
        let mut a = driver.connect().await.unwrap();
        let mut b = driver.connect().await.unwrap();
        a.write("/shared.txt", b"x").await.unwrap();
        assert!(b.exists("/shared.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_implicit_directories() {
        let mut h = handle().await;
        h.write("/docs/a.txt", b"a").await.unwrap();
        h.write("/docs/sub/b.txt", b"b").await.unwrap();
        h.mkdir("/docs/empty").await.unwrap();

        let entries = h.list("/docs").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "empty", "sub"]);

        assert!(h.stat("/docs/sub").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let mut h = handle().await;
        h.write("/d/f.txt", b"f").await.unwrap();
        h.mkdir("/d/sub").await.unwrap();

        assert!(matches!(
            h.delete("/d").await,
            Err(StorageError::NotEmpty(_))
        ));
        h.delete("/d/f.txt").await.unwrap();
        h.delete("/d/sub").await.unwrap();
        h.delete("/d").await.unwrap();
        assert!(!h.exists("/d").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_rejects_directories() {
        let mut h = handle().await;
        h.mkdir("/dir").await.unwrap();
        assert!(matches!(
            h.open("/dir").await,
            Err(StorageError::InvalidPath(_))
        ));
    }
}
