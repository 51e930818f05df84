//! S3 driver
//!
//! Amazon S3 and S3-compatible object stores (MinIO, LocalStack, etc.).
//! Directories are virtual: a zero-byte `key/` marker object plus prefix
//! listings with a `/` delimiter.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::backend::{DirEntry, Driver, Handle, Metadata};
use crate::config::{MountId, S3Options};
use crate::credentials::CredentialStore;
use crate::error::{Result, StorageError};

pub struct S3Driver {
    mount_id: MountId,
    options: S3Options,
    credentials: Arc<CredentialStore>,
}

impl S3Driver {
    pub fn new(mount_id: MountId, options: S3Options, credentials: Arc<CredentialStore>) -> Self {
        Self {
            mount_id,
            options,
            credentials,
        }
    }

    fn endpoint_url(&self) -> Option<String> {
        self.options.host.as_ref().map(|host| {
            let scheme = if self.options.use_ssl { "https" } else { "http" };
            match self.options.port {
                Some(port) => format!("{}://{}:{}", scheme, host, port),
                None => format!("{}://{}", scheme, host),
            }
        })
    }
}

#[async_trait]
impl Driver for S3Driver {
    async fn connect(&self) -> Result<Box<dyn Handle>> {
        // Keys are read from the store at connect time; after a credential
        // change the facade evicts old connections and new ones pick up the
        // fresh values here.
        let credential = self.credentials.get(&self.mount_id)?;
        let (access_key, secret_key) = credential.static_pair()?;

        let region = self
            .options
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "extmount",
            ));

        if let Some(endpoint) = self.endpoint_url() {
            builder = builder.endpoint_url(endpoint);
        }
        if self.options.use_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        Ok(Box::new(S3Handle {
            client,
            bucket: self.options.bucket.clone().unwrap_or_default(),
            prefix: self.options.prefix.clone().unwrap_or_default(),
        }))
    }
}

pub struct S3Handle {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Handle {
    /// Convert a mount-relative path to an S3 key
    fn path_to_key(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.prefix.clone()
        } else if self.prefix.is_empty() {
            path.to_string()
        } else if self.prefix.ends_with('/') {
            format!("{}{}", self.prefix, path)
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    async fn dir_is_empty(&self, dir_key: &str) -> Result<bool> {
        let result = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(dir_key)
            .max_keys(2) // marker object + any content
            .send()
            .await
            .map_err(|e| map_sdk_error("ListObjectsV2", &e))?;

        let occupied = result
            .contents()
            .iter()
            .any(|obj| obj.key().map(|k| k != dir_key).unwrap_or(false));
        Ok(!occupied && result.common_prefixes().is_empty())
    }
}

/// Map an SDK failure into the shared taxonomy by transport class and HTTP
/// status.
fn map_sdk_error<E>(
    what: &str,
    err: &SdkError<E, aws_sdk_s3::config::http::HttpResponse>,
) -> StorageError
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) => {
            StorageError::Unavailable(format!("S3 {} timed out", what))
        }
        SdkError::DispatchFailure(_) => {
            StorageError::Unavailable(format!("S3 {}: request dispatch failed", what))
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or("unknown").to_string();
            match status {
                401 | 403 => {
                    StorageError::Unauthorized(format!("S3 {} rejected: {}", what, code))
                }
                404 => StorageError::NotFound(format!("S3 {}: {}", what, code)),
                429 | 500..=599 => StorageError::Unavailable(format!(
                    "S3 {} failed with status {}: {}",
                    what, status, code
                )),
                _ => StorageError::ProtocolError(format!(
                    "S3 {} failed with status {}: {}",
                    what, status, code
                )),
            }
        }
        _ => StorageError::ProtocolError(format!("S3 {}: unexpected client failure", what)),
    }
}

fn mtime_from(output: Option<&aws_sdk_s3::primitives::DateTime>) -> SystemTime {
    output
        .and_then(|dt| {
            SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(dt.secs().max(0) as u64))
        })
        .unwrap_or_else(SystemTime::now)
}

#[async_trait]
impl Handle for S3Handle {
    async fn stat(&mut self, path: &str) -> Result<Metadata> {
        let key = self.path_to_key(path);
        trace!(%key, "stat");

        // Root always exists
        if key.is_empty() || key == self.prefix {
            return Ok(Metadata::directory(SystemTime::now()));
        }

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => {
                let size = output.content_length().unwrap_or(0) as u64;
                return Ok(Metadata::file(size, mtime_from(output.last_modified())));
            }
            Err(e) => {
                let mapped = map_sdk_error("HeadObject", &e);
                if !matches!(mapped, StorageError::NotFound(_)) {
                    return Err(mapped);
                }
            }
        }

        // Not an object; check for a virtual directory under this prefix
        let dir_key = format!("{}/", key.trim_end_matches('/'));
        let result = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&dir_key)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| map_sdk_error("ListObjectsV2", &e))?;

        if result.key_count().unwrap_or(0) > 0 || !result.common_prefixes().is_empty() {
            return Ok(Metadata::directory(SystemTime::now()));
        }

        Err(StorageError::NotFound(format!("path not found: {}", path)))
    }

    async fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Bytes> {
        let key = self.path_to_key(path);
        trace!(%key, offset, size, "read");

        if size == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset + size as u64 - 1);

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .range(range)
            .send()
            .await
            .map_err(|e| map_sdk_error("GetObject", &e))?;

        let body = result
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Unavailable(format!("S3 read body failed: {}", e)))?;

        Ok(body.into_bytes())
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        let key = self.path_to_key(path);
        debug!(%key, size = data.len(), "write");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| map_sdk_error("PutObject", &e))?;

        Ok(data.len() as u64)
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let mut prefix = self.path_to_key(path);
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let result = request
                .send()
                .await
                .map_err(|e| map_sdk_error("ListObjectsV2", &e))?;

            for obj in result.contents() {
                if let Some(key) = obj.key() {
                    // Skip directory markers
                    if key.ends_with('/') || key == prefix {
                        continue;
                    }
                    let rel = key.strip_prefix(&prefix).unwrap_or(key);
                    if rel.contains('/') {
                        continue;
                    }
                    entries.push(DirEntry::file(rel));
                }
            }

            for common_prefix in result.common_prefixes() {
                if let Some(p) = common_prefix.prefix() {
                    let rel = p.strip_prefix(&prefix).unwrap_or(p);
                    let name = rel.trim_end_matches('/');
                    if !name.is_empty() {
                        entries.push(DirEntry::directory(name));
                    }
                }
            }

            if result.is_truncated().unwrap_or(false) {
                continuation_token = result.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(entries)
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        let key = self.path_to_key(path);
        debug!(%key, "delete");

        match self.stat(path).await? {
            metadata if metadata.is_dir() => {
                let dir_key = format!("{}/", key.trim_end_matches('/'));
                if !self.dir_is_empty(&dir_key).await? {
                    return Err(StorageError::NotEmpty(format!(
                        "directory not empty: {}",
                        path
                    )));
                }
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&dir_key)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("DeleteObject", &e))?;
            }
            _ => {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("DeleteObject", &e))?;
            }
        }
        Ok(())
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        let mut key = self.path_to_key(path);
        if !key.ends_with('/') {
            key.push('/');
        }
        debug!(%key, "mkdir");

        // Zero-byte marker object with trailing slash
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(Vec::new()))
            .send()
            .await
            .map_err(|e| map_sdk_error("PutObject", &e))?;

        Ok(())
    }
}
