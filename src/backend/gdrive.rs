//! Google Drive driver
//!
//! Drive has no paths, only file IDs and parent links, so every operation
//! starts by resolving the mount-relative path component by component with
//! `files.list` queries. Resolved IDs are cached at the driver so the cache
//! survives individual connections; mutations invalidate the affected
//! subtree.
//!
//! Talks to the v3 REST API directly with a bearer token from the
//! credential store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backend::{transport_error, DirEntry, Driver, Handle, Metadata};
use crate::config::{GDriveOptions, MountId};
use crate::credentials::CredentialStore;
use crate::error::{Result, StorageError};

const API_ENDPOINT: &str = "https://www.googleapis.com";

/// MIME type marking a folder
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Fields to request for file metadata
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime";

/// Fields to request for file listings
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,size,modifiedTime)";

pub struct GDriveDriver {
    mount_id: MountId,
    options: GDriveOptions,
    credentials: Arc<CredentialStore>,
    /// Cache mapping normalized paths to Drive file IDs, shared by all
    /// connections of this mount.
    path_cache: Arc<RwLock<HashMap<String, String>>>,
}

impl GDriveDriver {
    pub fn new(
        mount_id: MountId,
        options: GDriveOptions,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            mount_id,
            options,
            credentials,
            path_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Driver for GDriveDriver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        let credential = self.credentials.get(&self.mount_id)?;
        let token = credential.bearer_token()?.to_string();
        debug!(mount = %self.mount_id, "opening Drive client");

        Ok(Box::new(GDriveHandle {
            client: reqwest::Client::new(),
            token,
            api: self
                .options
                .api_endpoint
                .clone()
                .unwrap_or_else(|| API_ENDPOINT.to_string()),
            root_id: self
                .options
                .root_folder_id
                .clone()
                .unwrap_or_else(|| "root".to_string()),
            path_cache: Arc::clone(&self.path_cache),
        }))
    }
}

fn normalize(path: &str) -> String {
    let rel = path.trim_matches('/');
    if rel.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", rel)
    }
}

/// Escape a file name for use inside a `files.list` query literal.
fn escape_query(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

fn map_status(status: StatusCode, path: &str) -> StorageError {
    match status.as_u16() {
        401 | 403 => StorageError::Unauthorized(format!("Drive rejected the token for {}", path)),
        404 => StorageError::NotFound(format!("path not found: {}", path)),
        429 => StorageError::Unavailable("Drive rate limit".into()),
        s if s >= 500 => StorageError::Unavailable(format!("Drive returned {}", s)),
        s => StorageError::ProtocolError(format!("Drive returned {} for {}", s, path)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    /// The API serializes sizes as decimal strings
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    fn mtime(&self) -> SystemTime {
        self.modified_time
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(SystemTime::from)
            .unwrap_or_else(SystemTime::now)
    }

    fn metadata(&self) -> Metadata {
        if self.is_folder() {
            Metadata::directory(self.mtime())
        } else {
            let size = self
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            Metadata::file(size, self.mtime())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct GDriveHandle {
    client: reqwest::Client,
    token: String,
    api: String,
    root_id: String,
    path_cache: Arc<RwLock<HashMap<String, String>>>,
}

impl GDriveHandle {
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        path: &str,
    ) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| transport_error("Drive", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }
        response
            .json()
            .await
            .map_err(|e| transport_error("Drive", e))
    }

    /// Query a folder for a child by name; returns its file record if
    /// present.
    async fn find_child(&self, parent_id: &str, name: &str) -> Result<Option<DriveFile>> {
        let query = format!(
            "'{}' in parents and name = '{}' and trashed = false",
            parent_id,
            escape_query(name)
        );
        let mut list: FileList = self
            .get_json(
                &format!("{}/drive/v3/files", self.api),
                &[("q", query.as_str()), ("fields", LIST_FIELDS), ("pageSize", "1")],
                name,
            )
            .await?;
        Ok(if list.files.is_empty() {
            None
        } else {
            Some(list.files.remove(0))
        })
    }

    /// Resolve a path to a Drive file ID, walking from the mount root and
    /// filling the shared cache along the way.
    async fn resolve_path(&self, path: &str) -> Result<String> {
        let normalized = normalize(path);
        trace!(%normalized, "resolve path");
        if normalized == "/" {
            return Ok(self.root_id.clone());
        }
        if let Some(id) = self.path_cache.read().get(&normalized) {
            return Ok(id.clone());
        }

        let mut current_id = self.root_id.clone();
        let mut current_path = String::new();
        for component in normalized.trim_start_matches('/').split('/') {
            current_path.push('/');
            current_path.push_str(component);

            let cached = self.path_cache.read().get(&current_path).cloned();
            if let Some(id) = cached {
                current_id = id;
                continue;
            }

            let child = self
                .find_child(&current_id, component)
                .await?
                .ok_or_else(|| {
                    StorageError::NotFound(format!("path not found: {}", current_path))
                })?;
            self.path_cache
                .write()
                .insert(current_path.clone(), child.id.clone());
            current_id = child.id;
        }
        Ok(current_id)
    }

    /// Split a path into its parent's resolved ID and the final component.
    async fn resolve_parent(&self, path: &str) -> Result<(String, String)> {
        let normalized = normalize(path);
        let (parent, name) = match normalized.rsplit_once('/') {
            Some((parent, name)) if !name.is_empty() => (parent.to_string(), name.to_string()),
            _ => {
                return Err(StorageError::InvalidPath(format!(
                    "path has no final component: {}",
                    path
                )))
            }
        };
        let parent_id = self.resolve_path(&parent).await?;
        Ok((parent_id, name))
    }

    fn invalidate(&self, path: &str) {
        let normalized = normalize(path);
        self.path_cache
            .write()
            .retain(|k, _| k != &normalized && !k.starts_with(&format!("{}/", normalized)));
    }

    async fn file_metadata(&self, file_id: &str, path: &str) -> Result<DriveFile> {
        self.get_json(
            &format!("{}/drive/v3/files/{}", self.api, file_id),
            &[("fields", FILE_FIELDS)],
            path,
        )
        .await
    }

    async fn list_children(&self, folder_id: &str, path: &str) -> Result<Vec<DriveFile>> {
        let query = format!("'{}' in parents and trashed = false", folder_id);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.clone()),
                ("fields", LIST_FIELDS.to_string()),
                ("pageSize", "100".to_string()),
            ];
            if let Some(token) = page_token.take() {
                params.push(("pageToken", token));
            }
            let borrowed: Vec<(&str, &str)> =
                params.iter().map(|(k, v)| (*k, v.as_str())).collect();
            let list: FileList = self
                .get_json(&format!("{}/drive/v3/files", self.api), &borrowed, path)
                .await?;
            files.extend(list.files);
            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(files)
    }

    /// Create an entry under a parent; folders carry the folder MIME type
    /// and no content.
    async fn create_entry(&self, parent_id: &str, name: &str, folder: bool, path: &str) -> Result<String> {
        let mut body = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });
        if folder {
            body["mimeType"] = serde_json::Value::String(FOLDER_MIME_TYPE.to_string());
        }

        let response = self
            .client
            .post(format!("{}/drive/v3/files", self.api))
            .query(&[("fields", "id")])
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Drive", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }
        let created: DriveFile = response
            .json()
            .await
            .map_err(|e| transport_error("Drive", e))?;
        Ok(created.id)
    }

    /// Replace a file's content with a media upload.
    async fn upload_content(&self, file_id: &str, data: &[u8], path: &str) -> Result<()> {
        let response = self
            .client
            .patch(format!("{}/upload/drive/v3/files/{}", self.api, file_id))
            .query(&[("uploadType", "media")])
            .bearer_auth(&self.token)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| transport_error("Drive", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }
        Ok(())
    }
}

#[async_trait]
impl Handle for GDriveHandle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        trace!(%path, "stat");
        let file_id = self.resolve_path(path).await?;
        let file = self.file_metadata(&file_id, path).await?;
        Ok(file.metadata())
    }

    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        trace!(%path, offset, size, "read");
        let file_id = self.resolve_path(path).await?;
        let end = (offset + size as u64).saturating_sub(1);

        let response = self
            .client
            .get(format!("{}/drive/v3/files/{}", self.api, file_id))
            .query(&[("alt", "media")])
            .bearer_auth(&self.token)
            .header("Range", format!("bytes={}-{}", offset, end))
            .send()
            .await
            .map_err(|e| transport_error("Drive", e))?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Bytes::new());
        }
        if !status.is_success() {
            return Err(map_status(status, path));
        }

        let ranged = status == StatusCode::PARTIAL_CONTENT;
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error("Drive", e))?;
        if ranged {
            return Ok(body);
        }
        let start = (offset as usize).min(body.len());
        let stop = (start + size as usize).min(body.len());
        Ok(body.slice(start..stop))
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        debug!(%path, size = data.len(), "write");
        let file_id = match self.resolve_path(path).await {
            Ok(id) => id,
            Err(StorageError::NotFound(_)) => {
                let (parent_id, name) = self.resolve_parent(path).await?;
                let id = self.create_entry(&parent_id, &name, false, path).await?;
                self.path_cache.write().insert(normalize(path), id.clone());
                id
            }
            Err(e) => return Err(e),
        };
        self.upload_content(&file_id, data, path).await?;
        Ok(data.len() as u64)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        trace!(%path, "list");
        let folder_id = self.resolve_path(path).await?;
        let children = self.list_children(&folder_id, path).await?;
        Ok(children
            .into_iter()
            .map(|f| {
                if f.is_folder() {
                    DirEntry::directory(f.name)
                } else {
                    DirEntry::file(f.name)
                }
            })
            .collect())
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        debug!(%path, "delete");
        let file_id = self.resolve_path(path).await?;
        let file = self.file_metadata(&file_id, path).await?;

        // Drive deletes folders recursively; refuse non-empty ones to match
        // the other backends
        if file.is_folder() {
            let children = self.list_children(&file_id, path).await?;
            if !children.is_empty() {
                return Err(StorageError::NotEmpty(format!(
                    "directory not empty: {}",
                    path
                )));
            }
        }

        let response = self
            .client
            .delete(format!("{}/drive/v3/files/{}", self.api, file_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| transport_error("Drive", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }

        self.invalidate(path);
        Ok(())
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        debug!(%path, "mkdir");
        let (parent_id, name) = self.resolve_parent(path).await?;
        if self.find_child(&parent_id, &name).await?.is_some() {
            return Err(StorageError::AlreadyExists(format!(
                "path already exists: {}",
                path
            )));
        }
        let id = self.create_entry(&parent_id, &name, true, path).await?;
        self.path_cache.write().insert(normalize(path), id);
        Ok(())
    }
}
