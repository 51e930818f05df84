//! Dropbox driver
//!
//! Speaks the v2 HTTP API: JSON RPC calls against the api endpoint, raw
//! up/downloads against the content endpoint with the JSON arguments packed
//! into the `Dropbox-API-Arg` header. Authentication is a bearer token from
//! the credential store; expired tokens surface as `Unauthorized`, which the
//! facade answers with a refresh and a retry on a fresh connection.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backend::{transport_error, DirEntry, Driver, Handle, Metadata};
use crate::config::{DropboxOptions, MountId};
use crate::credentials::CredentialStore;
use crate::error::{Result, StorageError};

const API_ENDPOINT: &str = "https://api.dropboxapi.com";
const CONTENT_ENDPOINT: &str = "https://content.dropboxapi.com";

pub struct DropboxDriver {
    mount_id: MountId,
    options: DropboxOptions,
    credentials: Arc<CredentialStore>,
}

impl DropboxDriver {
    pub fn new(
        mount_id: MountId,
        options: DropboxOptions,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            mount_id,
            options,
            credentials,
        }
    }
}

#[async_trait]
impl Driver for DropboxDriver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        let credential = self.credentials.get(&self.mount_id)?;
        let token = credential.bearer_token()?.to_string();
        debug!(mount = %self.mount_id, "opening Dropbox client");

        Ok(Box::new(DropboxHandle {
            client: reqwest::Client::new(),
            token,
            api: self
                .options
                .api_endpoint
                .clone()
                .unwrap_or_else(|| API_ENDPOINT.to_string()),
            content: self
                .options
                .content_endpoint
                .clone()
                .unwrap_or_else(|| CONTENT_ENDPOINT.to_string()),
        }))
    }
}

/// Convert a mount-relative path into the API's form: `""` for the root,
/// otherwise `/`-prefixed.
fn api_path(path: &str) -> String {
    let rel = path.trim_matches('/');
    if rel.is_empty() {
        String::new()
    } else {
        format!("/{}", rel)
    }
}

#[derive(Debug, Deserialize)]
struct ApiMetadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    server_modified: Option<String>,
}

impl ApiMetadata {
    fn mtime(&self) -> SystemTime {
        self.server_modified
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(SystemTime::from)
            .unwrap_or_else(SystemTime::now)
    }

    fn metadata(&self) -> Metadata {
        if self.tag == "folder" {
            Metadata::directory(self.mtime())
        } else {
            Metadata::file(self.size, self.mtime())
        }
    }

    fn dir_entry(&self) -> DirEntry {
        if self.tag == "folder" {
            DirEntry::directory(self.name.clone())
        } else {
            DirEntry::file(self.name.clone())
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<ApiMetadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error_summary: String,
}

/// Map an API failure response. Dropbox reports path errors as 409 with a
/// machine-readable summary.
fn map_api_error(status: StatusCode, summary: &str, path: &str) -> StorageError {
    match status.as_u16() {
        401 | 403 => StorageError::Unauthorized(format!("Dropbox rejected the token: {}", summary)),
        409 if summary.contains("not_found") => {
            StorageError::NotFound(format!("path not found: {}", path))
        }
        409 if summary.contains("conflict") => {
            StorageError::AlreadyExists(format!("path already exists: {}", path))
        }
        409 if summary.contains("not_folder") || summary.contains("not_file") => {
            StorageError::InvalidPath(format!("wrong entry kind: {}", path))
        }
        429 => StorageError::Unavailable("Dropbox rate limit".into()),
        s if s >= 500 => StorageError::Unavailable(format!("Dropbox returned {}", s)),
        s => StorageError::ProtocolError(format!("Dropbox returned {}: {}", s, summary)),
    }
}

pub struct DropboxHandle {
    client: reqwest::Client,
    token: String,
    api: String,
    content: String,
}

impl DropboxHandle {
    /// One JSON RPC call; deserializes the success body, maps everything
    /// else through the shared taxonomy.
    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        args: serde_json::Value,
        path: &str,
    ) -> Result<T> {
        let url = format!("{}/2/{}", self.api, endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .map_err(|e| transport_error("Dropbox", e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| transport_error("Dropbox", e));
        }

        let summary = response
            .json::<ApiError>()
            .await
            .map(|e| e.error_summary)
            .unwrap_or_default();
        Err(map_api_error(status, &summary, path))
    }

    async fn list_page(&self, path: &str, cursor: Option<&str>) -> Result<ListFolderResponse> {
        match cursor {
            None => {
                self.rpc(
                    "files/list_folder",
                    serde_json::json!({ "path": api_path(path) }),
                    path,
                )
                .await
            }
            Some(cursor) => {
                self.rpc(
                    "files/list_folder/continue",
                    serde_json::json!({ "cursor": cursor }),
                    path,
                )
                .await
            }
        }
    }
}

#[async_trait]
impl Handle for DropboxHandle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        trace!(%path, "stat");
        let target = api_path(path);
        if target.is_empty() {
            // the root namespace has no metadata record
            return Ok(Metadata::directory(SystemTime::now()));
        }
        let meta: ApiMetadata = self
            .rpc(
                "files/get_metadata",
                serde_json::json!({ "path": target }),
                path,
            )
            .await?;
        Ok(meta.metadata())
    }

    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        trace!(%path, offset, size, "read");
        let arg = serde_json::json!({ "path": api_path(path) }).to_string();
        let end = offset + size as u64;

        let response = self
            .client
            .post(format!("{}/2/files/download", self.content))
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", arg)
            .header("Range", format!("bytes={}-{}", offset, end.saturating_sub(1)))
            .send()
            .await
            .map_err(|e| transport_error("Dropbox", e))?;

        let status = response.status();
        if !status.is_success() {
            let summary = response
                .json::<ApiError>()
                .await
                .map(|e| e.error_summary)
                .unwrap_or_default();
            return Err(map_api_error(status, &summary, path));
        }

        let ranged = status == StatusCode::PARTIAL_CONTENT;
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error("Dropbox", e))?;
        if ranged {
            return Ok(body);
        }
        // a server that ignores Range sends the whole object
        let start = (offset as usize).min(body.len());
        let stop = (start + size as usize).min(body.len());
        Ok(body.slice(start..stop))
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        debug!(%path, size = data.len(), "write");
        let arg = serde_json::json!({
            "path": api_path(path),
            "mode": "overwrite",
            "mute": true,
        })
        .to_string();

        let response = self
            .client
            .post(format!("{}/2/files/upload", self.content))
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", arg)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| transport_error("Dropbox", e))?;

        let status = response.status();
        if !status.is_success() {
            let summary = response
                .json::<ApiError>()
                .await
                .map(|e| e.error_summary)
                .unwrap_or_default();
            return Err(map_api_error(status, &summary, path));
        }
        Ok(data.len() as u64)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        trace!(%path, "list");
        let mut entries = Vec::new();
        let mut page = self.list_page(path, None).await?;
        loop {
            entries.extend(page.entries.iter().map(ApiMetadata::dir_entry));
            if !page.has_more {
                break;
            }
            page = self.list_page(path, Some(&page.cursor)).await?;
        }
        Ok(entries)
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        debug!(%path, "delete");
        // the API deletes folders recursively; refuse non-empty ones to
        // match the other backends
        if self.stat(path).await?.is_dir() {
            let children = self.list(path).await?;
            if !children.is_empty() {
                return Err(StorageError::NotEmpty(format!(
                    "directory not empty: {}",
                    path
                )));
            }
        }
        let _: serde_json::Value = self
            .rpc(
                "files/delete_v2",
                serde_json::json!({ "path": api_path(path) }),
                path,
            )
            .await?;
        Ok(())
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        debug!(%path, "mkdir");
        let _: serde_json::Value = self
            .rpc(
                "files/create_folder_v2",
                serde_json::json!({ "path": api_path(path) }),
                path,
            )
            .await?;
        Ok(())
    }
}
