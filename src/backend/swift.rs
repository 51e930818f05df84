//! OpenStack Swift driver
//!
//! Authenticates against a Keystone v2 identity endpoint at connect time,
//! picks the object-store endpoint out of the service catalog (filtered by
//! region and service name when configured), then speaks the plain Swift
//! object API with the issued token. Pseudo-directories use the
//! `application/directory` convention.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use crate::backend::{transport_error, DirEntry, Driver, FileType, Handle, Metadata};
use crate::config::{MountId, SwiftOptions};
use crate::credentials::CredentialStore;
use crate::error::{Result, StorageError};

const DIRECTORY_CONTENT_TYPE: &str = "application/directory";

pub struct SwiftDriver {
    mount_id: MountId,
    options: SwiftOptions,
    credentials: Arc<CredentialStore>,
}

impl SwiftDriver {
    pub fn new(mount_id: MountId, options: SwiftOptions, credentials: Arc<CredentialStore>) -> Self {
        Self {
            mount_id,
            options,
            credentials,
        }
    }
}

// Keystone v2 tokens response, reduced to what endpoint selection needs.
#[derive(Debug, Deserialize)]
struct TokensResponse {
    access: Access,
}

#[derive(Debug, Deserialize)]
struct Access {
    token: Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct Token {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    #[serde(rename = "publicURL")]
    public_url: String,
    #[serde(default)]
    region: Option<String>,
}

/// Pick the object-store URL out of the catalog, honoring the configured
/// region and service name.
fn select_endpoint(
    catalog: &[CatalogEntry],
    region: Option<&str>,
    service_name: Option<&str>,
) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == "object-store")
        .filter(|entry| service_name.map(|n| entry.name == n).unwrap_or(true))
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            region
                .map(|r| ep.region.as_deref() == Some(r))
                .unwrap_or(true)
        })
        .map(|ep| ep.public_url.clone())
}

#[async_trait]
impl Driver for SwiftDriver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        let credential = self.credentials.get(&self.mount_id)?;
        let (user, password) = credential.static_pair()?;

        let identity = self.options.identity_endpoint.clone().unwrap_or_default();
        let tenant = self.options.tenant.clone().unwrap_or_default();
        let tokens_url = format!("{}/tokens", identity.trim_end_matches('/'));

        let client = reqwest::Client::new();
        let body = json!({
            "auth": {
                "tenantName": tenant,
                "passwordCredentials": { "username": user, "password": password }
            }
        });

        debug!(mount = %self.mount_id, %tokens_url, "authenticating against keystone");
        let response = client
            .post(&tokens_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Swift", e))?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(StorageError::Unauthorized(
                    "Keystone rejected tenant credentials".into(),
                ))
            }
            s if s.is_server_error() => {
                return Err(StorageError::Unavailable(format!(
                    "Keystone returned {}",
                    s
                )))
            }
            s => {
                return Err(StorageError::ProtocolError(format!(
                    "Keystone returned {}",
                    s
                )))
            }
        }

        let tokens: TokensResponse = response
            .json()
            .await
            .map_err(|e| StorageError::ProtocolError(format!("malformed tokens response: {}", e)))?;

        let storage_url = select_endpoint(
            &tokens.access.service_catalog,
            self.options.region.as_deref(),
            self.options.service_name.as_deref(),
        )
        .ok_or_else(|| {
            StorageError::ProtocolError("no object-store endpoint in service catalog".into())
        })?;

        let storage_url = Url::parse(&storage_url)
            .map_err(|e| StorageError::ProtocolError(format!("bad storage URL: {}", e)))?;

        Ok(Box::new(SwiftHandle {
            client,
            storage_url,
            token: tokens.access.token.id,
            container: self.options.container.clone().unwrap_or_default(),
        }))
    }
}

pub struct SwiftHandle {
    client: reqwest::Client,
    storage_url: Url,
    token: String,
    container: String,
}

/// One entry of a JSON container listing. Subdirectory markers produced by
/// the delimiter query carry only `subdir`.
#[derive(Debug, Deserialize)]
struct ListEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    subdir: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
}

fn object_name(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn map_status(status: StatusCode, path: &str) -> StorageError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::Unauthorized(format!("Swift token rejected for {}", path))
        }
        StatusCode::NOT_FOUND => StorageError::NotFound(format!("path not found: {}", path)),
        StatusCode::CONFLICT => StorageError::NotEmpty(format!("container conflict: {}", path)),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            StorageError::Unavailable(format!("Swift returned {} for {}", s, path))
        }
        s => StorageError::ProtocolError(format!("Swift returned {} for {}", s, path)),
    }
}

impl SwiftHandle {
    fn object_url(&self, name: &str) -> Result<Url> {
        let mut url = self.storage_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StorageError::InvalidPath("bad storage URL".into()))?;
            segments.pop_if_empty();
            segments.push(&self.container);
            for part in name.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    fn container_url(&self) -> Result<Url> {
        self.object_url("")
    }
}

#[async_trait]
impl Handle for SwiftHandle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        let name = object_name(path);
        trace!(%name, "stat");
        if name.is_empty() {
            return Ok(Metadata::directory(SystemTime::now()));
        }

        let response = self
            .client
            .head(self.object_url(&name)?)
            .header("X-Auth-Token", &self.token)
            .send()
            .await
            .map_err(|e| transport_error("Swift", e))?;

        if response.status().is_success() {
            let headers = response.headers();
            let size = headers
                .get("Content-Length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let is_dir = headers
                .get("Content-Type")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.starts_with(DIRECTORY_CONTENT_TYPE))
                .unwrap_or(false);
            let mtime = headers
                .get("Last-Modified")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
                .map(SystemTime::from)
                .unwrap_or_else(SystemTime::now);
            return Ok(if is_dir {
                Metadata::directory(mtime)
            } else {
                Metadata::file(size, mtime)
            });
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(map_status(response.status(), path));
        }

        // Fall back to a prefix probe for implicit directories
        let mut url = self.container_url()?;
        url.query_pairs_mut()
            .append_pair("prefix", &format!("{}/", name))
            .append_pair("limit", "1")
            .append_pair("format", "json");
        let response = self
            .client
            .get(url)
            .header("X-Auth-Token", &self.token)
            .send()
            .await
            .map_err(|e| transport_error("Swift", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }
        let entries: Vec<ListEntry> = response
            .json()
            .await
            .map_err(|e| StorageError::ProtocolError(format!("malformed listing: {}", e)))?;
        if entries.is_empty() {
            Err(StorageError::NotFound(format!("path not found: {}", path)))
        } else {
            Ok(Metadata::directory(SystemTime::now()))
        }
    }

    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        let name = object_name(path);
        trace!(%name, offset, size, "read");

        let mut request = self
            .client
            .get(self.object_url(&name)?)
            .header("X-Auth-Token", &self.token);
        if size > 0 {
            request = request.header(
                "Range",
                format!("bytes={}-{}", offset, offset + size as u64 - 1),
            );
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error("Swift", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }
        response.bytes().await.map_err(|e| transport_error("Swift", e))
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        let name = object_name(path);
        debug!(%name, size = data.len(), "write");

        let response = self
            .client
            .put(self.object_url(&name)?)
            .header("X-Auth-Token", &self.token)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| transport_error("Swift", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }
        Ok(data.len() as u64)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let name = object_name(path);
        trace!(%name, "list");

        let prefix = if name.is_empty() {
            String::new()
        } else {
            format!("{}/", name)
        };
        let mut url = self.container_url()?;
        url.query_pairs_mut()
            .append_pair("prefix", &prefix)
            .append_pair("delimiter", "/")
            .append_pair("format", "json");

        let response = self
            .client
            .get(url)
            .header("X-Auth-Token", &self.token)
            .send()
            .await
            .map_err(|e| transport_error("Swift", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }
        let raw: Vec<ListEntry> = response
            .json()
            .await
            .map_err(|e| StorageError::ProtocolError(format!("malformed listing: {}", e)))?;

        let mut entries = Vec::new();
        for entry in raw {
            if let Some(subdir) = entry.subdir {
                let rel = subdir
                    .strip_prefix(&prefix)
                    .unwrap_or(&subdir)
                    .trim_end_matches('/');
                if !rel.is_empty() {
                    entries.push(DirEntry::directory(rel));
                }
            } else if let Some(obj_name) = entry.name {
                let rel = obj_name.strip_prefix(&prefix).unwrap_or(&obj_name);
                if rel.is_empty() || rel.contains('/') {
                    continue;
                }
                let is_dir = entry
                    .content_type
                    .as_deref()
                    .map(|t| t.starts_with(DIRECTORY_CONTENT_TYPE))
                    .unwrap_or(false);
                entries.push(DirEntry {
                    name: rel.to_string(),
                    file_type: if is_dir {
                        FileType::Directory
                    } else {
                        FileType::File
                    },
                });
            }
        }
        Ok(entries)
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        let name = object_name(path);
        debug!(%name, "delete");

        let response = self
            .client
            .delete(self.object_url(&name)?)
            .header("X-Auth-Token", &self.token)
            .send()
            .await
            .map_err(|e| transport_error("Swift", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }
        Ok(())
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        let name = object_name(path);
        debug!(%name, "mkdir");

        let response = self
            .client
            .put(self.object_url(&name)?)
            .header("X-Auth-Token", &self.token)
            .header("Content-Type", DIRECTORY_CONTENT_TYPE)
            .body(Vec::new())
            .send()
            .await
            .map_err(|e| transport_error("Swift", e))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }
        Ok(())
    }
}
